// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration documents and their compiled, immutable snapshots.
//!
//! A configuration arrives as a JSON document carrying a monotonically
//! increasing timestamp. Loading compiles it into a [`ConfigSnapshot`]
//! (prefix trees plus settings) off to the side; the [`ConfigManager`]
//! swaps the snapshot in atomically so readers never observe a
//! half-built tree. A document whose timestamp is not newer than the
//! live one is a no-op, never an error.

use crate::error::Error;
use crate::log::hijack_log;
use crate::tree::PrefixTree;
use crate::types::Prefix;
use hd_common::{read_lock, write_lock};
use schemars::JsonSchema;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Wildcard member of origin/neighbor sets meaning "any ASN".
pub const ASN_WILDCARD: i64 = -1;

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum Policy {
    #[serde(rename = "no-export")]
    NoExport,
}

/// What to do about a confirmed hijack: wait for an operator, or hand
/// an identifier to the external mitigation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MitigationAction {
    #[default]
    Manual,
    Action(String),
}

// On the wire a mitigation directive is the literal "manual" or an
// action identifier string.
impl Serialize for MitigationAction {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Manual => s.serialize_str("manual"),
            Self::Action(id) => s.serialize_str(id),
        }
    }
}

impl<'de> Deserialize<'de> for MitigationAction {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        match s.as_str() {
            "manual" => Ok(Self::Manual),
            "" => Err(D::Error::custom("empty mitigation action")),
            _ => Ok(Self::Action(s)),
        }
    }
}

impl JsonSchema for MitigationAction {
    fn schema_name() -> String {
        "MitigationAction".to_string()
    }

    fn json_schema(
        generator: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        String::json_schema(generator)
    }
}

/// One group of monitored prefixes sharing legitimacy rules, as it
/// appears in the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PrefixGroup {
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub origin_asns: Vec<i64>,
    #[serde(default)]
    pub neighbors: Vec<i64>,
    #[serde(default)]
    pub prepend_seq: Vec<Vec<u32>>,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub community_annotations: serde_json::Value,
    #[serde(default)]
    pub mitigation: MitigationAction,
}

/// Auto-ignore policy for low-impact hijacks on the named prefixes: a
/// record that stays below both thresholds for `interval` seconds is
/// silenced.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AutoIgnoreRule {
    pub prefixes: Vec<String>,
    pub thres_num_peers_seen: usize,
    pub thres_num_ases_infected: usize,
    pub interval: u64,
}

fn default_true() -> bool {
    true
}

fn default_realert_threshold() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DetectorSettings {
    /// Whether residual sub-prefix anomalies (origin legitimate, no
    /// specific path violation) are alerted on.
    #[serde(default = "default_true")]
    pub report_unresolved: bool,

    /// Historic mode: accept arbitrarily old timestamps for replay.
    #[serde(default)]
    pub historic: bool,

    /// Re-alert an ongoing hijack when its distinct-peer count first
    /// reaches this size.
    #[serde(default = "default_realert_threshold")]
    pub realert_peer_threshold: usize,

    /// Re-alert an ongoing hijack when its infected-AS count first
    /// reaches this size.
    #[serde(default = "default_realert_threshold")]
    pub realert_asn_threshold: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            report_unresolved: true,
            historic: false,
            realert_peer_threshold: default_realert_threshold(),
            realert_asn_threshold: default_realert_threshold(),
        }
    }
}

/// The configuration document as pushed by the operational layer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConfigDoc {
    pub timestamp: f64,
    pub prefix_groups: Vec<PrefixGroup>,
    #[serde(default)]
    pub autoignore: Vec<AutoIgnoreRule>,
    #[serde(default)]
    pub settings: DetectorSettings,
}

/// A compiled legitimacy rule bound to a prefix-tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub origin_asns: BTreeSet<i64>,
    pub neighbors: BTreeSet<i64>,
    pub prepend_seq: Vec<Vec<u32>>,
    pub policies: BTreeSet<Policy>,
    pub mitigation: MitigationAction,
}

impl Rule {
    /// Whether `origin` is a legitimate origin under this rule. `-1`
    /// in the configured set matches any ASN.
    pub fn origin_ok(&self, origin: u32) -> bool {
        self.origin_asns.contains(&ASN_WILDCARD)
            || self.origin_asns.contains(&i64::from(origin))
    }

    /// Whether `hop` is a legitimate first hop. An empty neighbor set
    /// places no constraint; `-1` matches any ASN.
    pub fn neighbor_ok(&self, hop: u32) -> bool {
        self.neighbors.is_empty()
            || self.neighbors.contains(&ASN_WILDCARD)
            || self.neighbors.contains(&i64::from(hop))
    }

    pub fn no_export(&self) -> bool {
        self.policies.contains(&Policy::NoExport)
    }
}

/// Immutable compiled configuration generation. Workers hold an `Arc`
/// to whichever snapshot was live when they picked up an update.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub timestamp: f64,
    pub rules: PrefixTree<Vec<Arc<Rule>>>,
    pub autoignore: PrefixTree<Arc<AutoIgnoreRule>>,
    pub settings: DetectorSettings,
}

impl ConfigSnapshot {
    /// Compile a document, failing loudly on invariant violations so
    /// a bad configuration never silently mis-classifies.
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self, Error> {
        let mut rules: PrefixTree<Vec<Arc<Rule>>> = PrefixTree::new();
        for (i, group) in doc.prefix_groups.iter().enumerate() {
            if group.prefixes.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "prefix group {i} has an empty prefix list"
                )));
            }
            for seq in &group.prepend_seq {
                if seq.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "prefix group {i} has an empty prepend sequence"
                    )));
                }
            }
            let rule = Arc::new(Rule {
                origin_asns: group.origin_asns.iter().copied().collect(),
                neighbors: group.neighbors.iter().copied().collect(),
                prepend_seq: group.prepend_seq.clone(),
                policies: group.policies.iter().copied().collect(),
                mitigation: group.mitigation.clone(),
            });
            for p in &group.prefixes {
                let prefix: Prefix = p.parse()?;
                let for_init = rule.clone();
                let for_merge = rule.clone();
                rules.insert_with(
                    prefix,
                    move || vec![for_init],
                    move |list| list.push(for_merge),
                );
            }
        }

        let mut autoignore: PrefixTree<Arc<AutoIgnoreRule>> =
            PrefixTree::new();
        for (i, rule) in doc.autoignore.iter().enumerate() {
            if rule.prefixes.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "auto-ignore rule {i} has an empty prefix list"
                )));
            }
            if rule.interval == 0 {
                return Err(Error::InvalidConfig(format!(
                    "auto-ignore rule {i} has a zero interval"
                )));
            }
            let rule = Arc::new(rule.clone());
            for p in &rule.prefixes {
                let prefix: Prefix = p.parse()?;
                let for_init = rule.clone();
                let for_merge = rule.clone();
                autoignore.insert_with(
                    prefix,
                    move || for_init,
                    move |existing| *existing = for_merge,
                );
            }
        }

        Ok(Self {
            timestamp: doc.timestamp,
            rules,
            autoignore,
            settings: doc.settings.clone(),
        })
    }

    /// Most specific configured covering node for `prefix`, if any.
    pub fn match_rules(
        &self,
        prefix: &Prefix,
    ) -> Option<(&Prefix, &Vec<Arc<Rule>>)> {
        self.rules.lookup(prefix)
    }
}

pub enum ReloadOutcome {
    Loaded,
    /// The document's timestamp was not newer than the live one.
    Stale,
}

/// Owns the live snapshot and serializes reloads. Readers take a
/// cheap `Arc` clone and keep classifying against it even while a
/// newer generation swaps in.
pub struct ConfigManager {
    current: RwLock<Arc<ConfigSnapshot>>,
    log: Logger,
}

impl ConfigManager {
    pub fn new(initial: ConfigSnapshot, log: Logger) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            log,
        }
    }

    /// Start with an empty configuration (everything classifies as
    /// squatting until the first document loads).
    pub fn empty(log: Logger) -> Self {
        let snapshot = ConfigSnapshot {
            timestamp: 0.0,
            rules: PrefixTree::new(),
            autoignore: PrefixTree::new(),
            settings: DetectorSettings::default(),
        };
        Self::new(snapshot, log)
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        read_lock!(self.current).clone()
    }

    /// Compile and swap in a new document. Reloads are last-writer-
    /// wins by document timestamp; a non-newer document is ignored.
    pub fn load(&self, doc: &ConfigDoc) -> Result<ReloadOutcome, Error> {
        if doc.timestamp <= self.current().timestamp {
            hijack_log!(
                self.log,
                debug,
                crate::MOD_CONFIG,
                "ignoring stale configuration";
                "timestamp" => doc.timestamp
            );
            return Ok(ReloadOutcome::Stale);
        }
        let snapshot = Arc::new(ConfigSnapshot::from_doc(doc)?);
        let mut current = write_lock!(self.current);
        // Re-check under the write lock; a racing newer load wins.
        if snapshot.timestamp <= current.timestamp {
            return Ok(ReloadOutcome::Stale);
        }
        hijack_log!(
            self.log,
            info,
            crate::MOD_CONFIG,
            "loaded configuration with {} monitored prefixes",
            snapshot.rules.len();
            "timestamp" => snapshot.timestamp
        );
        *current = snapshot;
        Ok(ReloadOutcome::Loaded)
    }
}
