// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BGP hijack detection engine.
//!
//! This crate turns normalized BGP update streams into typed hijack
//! verdicts. The pieces, leaf first:
//!
//! - [`update`]: the canonical update record, schema validation and
//!   AS-path decomposition (the normalizer boundary).
//! - [`tree`]: a per-address-family longest-prefix-match trie mapping
//!   monitored prefixes to configured rules.
//! - [`cfg`]: the configuration document, compiled rule snapshots and
//!   generation-swapped reloads.
//! - [`classifier`]: the pure classification function from
//!   (update, matched rules) to a hijack verdict.
//! - [`lifecycle`]: ongoing hijack tracking, alert dedup, implicit
//!   withdrawals and auto-ignore.
//! - [`cache`]: the expiring key-value store seam used for dedup
//!   markers, with a fail-open front.
//! - [`feed`]: the capability interface collector adapters implement.

pub mod cache;
pub mod cfg;
pub mod classifier;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod tree;
pub mod types;
pub mod update;

pub(crate) mod log;

#[cfg(test)]
mod test;

pub const COMPONENT_HIJACK: &str = "hijack";
pub const MOD_NORMALIZER: &str = "normalizer";
pub const MOD_CONFIG: &str = "config";
pub const MOD_LIFECYCLE: &str = "lifecycle";
pub const MOD_CACHE: &str = "cache";
pub const MOD_FEED: &str = "feed";
