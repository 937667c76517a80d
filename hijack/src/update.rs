// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The normalizer boundary: raw collector records come in, validated
//! canonical [`Update`] instances come out, one per decomposed AS-path
//! branch. Everything downstream of this module consumes the typed
//! form only.

use crate::error::Error;
use crate::log::hijack_log;
use crate::types::Prefix;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use slog::Logger;
use std::fmt;
use std::fmt::Write as _;

/// Updates older than this are dropped unless historic mode is on.
pub const DEFAULT_MAX_AGE_SECS: i64 = 90 * 60;

/// Clock-skew allowance for timestamps ahead of our own clock.
pub const FUTURE_SKEW_SECS: i64 = 60;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum UpdateType {
    #[serde(rename = "A")]
    Announce,
    #[serde(rename = "W")]
    Withdraw,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Announce => write!(f, "A"),
            Self::Withdraw => write!(f, "W"),
        }
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Community {
    pub asn: u32,
    pub value: u32,
}

/// A hop in a not-yet-normalized AS-path. Plain hops arrive as JSON
/// integers; BGP set and confederation constructs arrive as strings
/// such as `"{64512,64513}"` or `"(64512,64513)"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RawHop {
    Asn(u32),
    Expr(String),
}

impl fmt::Display for RawHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asn(asn) => write!(f, "{asn}"),
            Self::Expr(s) => write!(f, "{s}"),
        }
    }
}

/// An update record as received from a collector adapter, prior to
/// validation and path decomposition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawUpdate {
    pub service: String,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub prefix: String,
    #[serde(default)]
    pub path: Option<Vec<RawHop>>,
    #[serde(default)]
    pub communities: Vec<Community>,
    pub timestamp: f64,
    pub peer_asn: u32,
}

/// Provenance of an update that did not arrive on the wire in its
/// current form: either the pre-decomposition hop list of a
/// set/confederation expansion, or the legitimate update that caused
/// an implicit withdrawal to be synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OrigPath {
    Hops(Vec<RawHop>),
    Trigger {
        triggering_bgp_update: Box<Update>,
    },
}

/// The canonical update record consumed by the classifier and the
/// lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Update {
    pub service: String,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub prefix: Prefix,
    pub path: Vec<u32>,
    pub communities: Vec<Community>,
    pub timestamp: f64,
    pub peer_asn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_path: Option<OrigPath>,
}

impl Update {
    /// The originating ASN, i.e. the last hop of the path.
    pub fn origin(&self) -> Option<u32> {
        self.path.last().copied()
    }

    /// The hop immediately upstream of the origin.
    pub fn first_hop(&self) -> Option<u32> {
        match self.path.len() {
            0 | 1 => None,
            n => Some(self.path[n - 2]),
        }
    }

    /// Deterministic key over the wire-visible identity of this
    /// observation, used for end-to-end dedup and tracing. Distinct
    /// from the hijack key.
    pub fn key(&self) -> String {
        content_digest(&format!(
            "{}|{:?}|{}|{:.6}|{}",
            self.prefix,
            self.path,
            self.update_type,
            self.timestamp,
            self.peer_asn,
        ))
    }
}

/// SHA-256 digest truncated to 16 bytes, rendered as lowercase hex.
pub(crate) fn content_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(32);
    for b in &digest[..16] {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Collapse consecutive duplicate hops (prepending) and, when the
/// collapsed path still revisits an ASN, truncate loop segments
/// scanning from the traffic (origin) direction.
pub fn clean_as_path(path: &[u32]) -> Vec<u32> {
    let (clean, loopy) = remove_prepending(path);
    if loopy {
        clean_loops(&clean)
    } else {
        clean
    }
}

fn remove_prepending(path: &[u32]) -> (Vec<u32>, bool) {
    let mut out: Vec<u32> = Vec::with_capacity(path.len());
    for &hop in path {
        if out.last() != Some(&hop) {
            out.push(hop);
        }
    }
    let distinct: std::collections::BTreeSet<u32> =
        path.iter().copied().collect();
    let loopy = distinct.len() != out.len();
    (out, loopy)
}

fn clean_loops(path: &[u32]) -> Vec<u32> {
    let mut inv: Vec<u32> = Vec::with_capacity(path.len());
    for &hop in path.iter().rev() {
        match inv.iter().position(|&x| x == hop) {
            None => inv.push(hop),
            Some(i) => inv.truncate(i + 1),
        }
    }
    inv.reverse();
    inv
}

/// Validates raw collector records and expands AS-path set and
/// confederation constructs into linear per-branch updates.
pub struct Normalizer {
    historic: bool,
    max_age_secs: i64,
    log: Logger,
}

impl Normalizer {
    pub fn new(log: Logger) -> Self {
        Self {
            historic: false,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            log,
        }
    }

    /// Historic mode disables the timestamp age check so archived
    /// feeds can be replayed.
    pub fn historic(mut self, historic: bool) -> Self {
        self.historic = historic;
        self
    }

    pub fn max_age_secs(mut self, secs: i64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Schema validation for a raw record. A failure means the record
    /// is dropped before it reaches the classifier.
    pub fn validate(&self, raw: &RawUpdate) -> Result<(), Error> {
        if raw.service.is_empty() {
            return Err(Error::InvalidUpdate("empty service tag".into()));
        }
        raw.prefix.parse::<Prefix>()?;
        if raw.update_type == UpdateType::Announce && raw.path.is_none() {
            return Err(Error::InvalidUpdate(
                "announcement without a path".into(),
            ));
        }
        let now = chrono::Utc::now().timestamp() as f64;
        if raw.timestamp > now + FUTURE_SKEW_SECS as f64 {
            return Err(Error::TimestampOutOfWindow(raw.timestamp));
        }
        if !self.historic && raw.timestamp < now - self.max_age_secs as f64 {
            return Err(Error::TimestampOutOfWindow(raw.timestamp));
        }
        Ok(())
    }

    /// Validate `raw` and expand it into one canonical update per
    /// decomposed path branch. Branch-derived updates record the
    /// pre-decomposition hops under `orig_path`; a record whose path
    /// needed no decomposition carries none.
    pub fn normalize(&self, raw: &RawUpdate) -> Result<Vec<Update>, Error> {
        self.validate(raw)?;
        let prefix: Prefix = raw.prefix.parse()?;
        let hops = raw.path.clone().unwrap_or_default();
        let branches = decompose_path(&hops)?;

        let base = Update {
            service: raw.service.clone(),
            update_type: raw.update_type,
            prefix,
            path: vec![],
            communities: raw.communities.clone(),
            timestamp: raw.timestamp,
            peer_asn: raw.peer_asn,
            orig_path: None,
        };

        if branches.len() > 1 {
            hijack_log!(
                self.log,
                debug,
                crate::MOD_NORMALIZER,
                "expanded path into {} branches",
                branches.len();
                "prefix" => prefix.to_string(),
                "peer_asn" => raw.peer_asn
            );
        }

        match branches.len() {
            0 | 1 => {
                let mut update = base;
                update.path = branches.into_iter().next().unwrap_or_default();
                Ok(vec![update])
            }
            _ => Ok(branches
                .into_iter()
                .map(|path| {
                    let mut update = base.clone();
                    update.path = path;
                    update.orig_path = Some(OrigPath::Hops(hops.clone()));
                    update
                })
                .collect()),
        }
    }
}

/// Expand BGP set (`{a,b,c}`, `[a,b,c]`) and confederation-sequence
/// (`(a,b,c)`) hops. Set hops branch per element; confederation hops
/// append their elements in order to every existing branch. A path of
/// plain hops takes the fast single-branch path with no allocation of
/// alternatives.
fn decompose_path(hops: &[RawHop]) -> Result<Vec<Vec<u32>>, Error> {
    if hops.iter().all(|h| matches!(h, RawHop::Asn(_))) {
        return Ok(vec![hops
            .iter()
            .map(|h| match h {
                RawHop::Asn(asn) => *asn,
                RawHop::Expr(_) => unreachable!(),
            })
            .collect()]);
    }

    let mut branches: Vec<Vec<u32>> = vec![vec![]];
    for hop in hops {
        match hop {
            RawHop::Asn(asn) => {
                for branch in branches.iter_mut() {
                    branch.push(*asn);
                }
            }
            RawHop::Expr(s) => {
                let (inner, sequence) = strip_hop_markers(s)?;
                let elements = parse_hop_elements(s, inner)?;
                if sequence {
                    for branch in branches.iter_mut() {
                        branch.extend_from_slice(&elements);
                    }
                } else {
                    let mut split = Vec::with_capacity(
                        branches.len() * elements.len(),
                    );
                    for branch in &branches {
                        for &element in &elements {
                            let mut next = branch.clone();
                            next.push(element);
                            split.push(next);
                        }
                    }
                    branches = split;
                }
            }
        }
    }
    Ok(branches)
}

/// Strip the surrounding set/confederation markers from a hop
/// expression. Returns the inner element list and whether the hop is a
/// confederation sequence (append, not branch).
fn strip_hop_markers(s: &str) -> Result<(&str, bool), Error> {
    let trimmed = s.trim();
    if let Some(inner) =
        trimmed.strip_prefix('{').and_then(|r| r.strip_suffix('}'))
    {
        return Ok((inner, false));
    }
    if let Some(inner) =
        trimmed.strip_prefix('[').and_then(|r| r.strip_suffix(']'))
    {
        return Ok((inner, false));
    }
    if let Some(inner) =
        trimmed.strip_prefix('(').and_then(|r| r.strip_suffix(')'))
    {
        return Ok((inner, true));
    }
    Err(Error::InvalidPathHop(s.to_string()))
}

fn parse_hop_elements(hop: &str, inner: &str) -> Result<Vec<u32>, Error> {
    let mut elements = Vec::new();
    for part in inner.split(',') {
        let asn: u32 = part
            .trim()
            .parse()
            .map_err(|_| Error::InvalidPathHop(hop.to_string()))?;
        elements.push(asn);
    }
    if elements.is_empty() {
        return Err(Error::InvalidPathHop(hop.to_string()));
    }
    Ok(elements)
}
