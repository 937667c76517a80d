// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification of announcements against configured legitimacy
//! rules. Pure: no side effects, no shared state; the caller feeds
//! the resulting [`Classification`] to the lifecycle manager.
//!
//! A verdict is a four-dimension tag. The first dimension is prefix
//! scope (exact / sub-prefix / squatting), the second is the path
//! anomaly (illegal origin, illegal first hop, prepend-pattern
//! mismatch), the third is reserved for data-plane signals and always
//! `-` here, and the fourth is export policy (route leak). Only
//! combinations in the hijack table alert; anything else is benign.

use crate::cfg::{ConfigSnapshot, MitigationAction, Rule};
use crate::types::Prefix;
use crate::update::{clean_as_path, Update};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Reported offending ASN when no specific hop can be blamed.
pub const UNKNOWN_HIJACKER: i64 = -1;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum Scope {
    #[serde(rename = "E")]
    Exact,
    #[serde(rename = "S")]
    Sub,
    #[serde(rename = "Q")]
    Squat,
}

impl Scope {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Exact => "E",
            Self::Sub => "S",
            Self::Squat => "Q",
        }
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum PathDim {
    #[serde(rename = "0")]
    IllegalOrigin,
    #[serde(rename = "1")]
    IllegalFirstHop,
    #[serde(rename = "P")]
    PrependMismatch,
    #[serde(rename = "-")]
    Clean,
}

impl PathDim {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IllegalOrigin => "0",
            Self::IllegalFirstHop => "1",
            Self::PrependMismatch => "P",
            Self::Clean => "-",
        }
    }

    /// Tie-break rank across rules: illegal origin is the most
    /// specific failure, then illegal first hop, then a prepend
    /// mismatch, then nothing.
    fn rank(&self) -> u8 {
        match self {
            Self::IllegalOrigin => 0,
            Self::IllegalFirstHop => 1,
            Self::PrependMismatch => 2,
            Self::Clean => 3,
        }
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum PolicyDim {
    #[serde(rename = "L")]
    Leak,
    #[serde(rename = "-")]
    Clean,
}

impl PolicyDim {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Leak => "L",
            Self::Clean => "-",
        }
    }
}

/// The four-dimension hijack type tag. The data-plane dimension is a
/// placeholder and always renders as `-`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct HijackType {
    pub scope: Scope,
    pub path: PathDim,
    pub policy: PolicyDim,
}

impl HijackType {
    pub fn tag(&self) -> [&'static str; 4] {
        [self.scope.code(), self.path.code(), "-", self.policy.code()]
    }

    /// Whether this combination alerts at all. `report_unresolved`
    /// gates the residual sub-prefix rows (`S|-|-|-`, `S|-|-|L`).
    pub fn is_hijack(&self, report_unresolved: bool) -> bool {
        match (self.scope, self.path, self.policy) {
            (Scope::Sub, PathDim::Clean, _) => report_unresolved,
            (Scope::Sub, PathDim::PrependMismatch, PolicyDim::Leak) => false,
            (Scope::Sub, _, _) => true,
            (Scope::Exact, PathDim::Clean, PolicyDim::Leak) => true,
            (Scope::Exact, PathDim::Clean, PolicyDim::Clean) => false,
            (Scope::Exact, PathDim::PrependMismatch, PolicyDim::Leak) => {
                false
            }
            (Scope::Exact, _, _) => true,
            (Scope::Squat, PathDim::IllegalOrigin, _) => true,
            (Scope::Squat, _, _) => false,
        }
    }
}

impl fmt::Display for HijackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag().join("|"))
    }
}

/// A non-benign classification outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub hijack_type: HijackType,
    /// Offending ASN, `-1` when no specific hop can be blamed.
    pub hijack_as: i64,
    /// The configured prefix whose rules were applied; for squatting
    /// with no configured ancestor, the observed prefix itself.
    pub matched_prefix: Prefix,
    /// Timestamp of the configuration generation consulted.
    pub config_timestamp: f64,
    /// Upstream ASNs presumed polluted by this announcement.
    pub asns_inf: BTreeSet<u32>,
    pub mitigation: MitigationAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Benign. The matched configured prefix, when one exists, feeds
    /// the implicit-withdrawal check downstream.
    Clear { matched_prefix: Option<Prefix> },
    Hijack(Verdict),
}

struct RuleOutcome {
    hijack_type: HijackType,
    path_hijacker: i64,
    pol_hijacker: i64,
}

/// Classify an announcement against the live configuration snapshot.
///
/// Every rule on the matched node is evaluated independently; a single
/// fully-satisfied rule clears the update, otherwise the most specific
/// failing classification across rules is reported.
pub fn classify(update: &Update, snapshot: &ConfigSnapshot) -> Classification {
    let clean = clean_as_path(&update.path);

    let Some((matched_prefix, rules)) = snapshot.match_rules(&update.prefix)
    else {
        // No configured ancestor at all: squatting.
        let hijack_type = HijackType {
            scope: Scope::Squat,
            path: PathDim::IllegalOrigin,
            policy: PolicyDim::Clean,
        };
        return Classification::Hijack(Verdict {
            hijack_type,
            hijack_as: clean
                .last()
                .map(|&asn| i64::from(asn))
                .unwrap_or(UNKNOWN_HIJACKER),
            matched_prefix: update.prefix,
            config_timestamp: snapshot.timestamp,
            asns_inf: infected_asns(&clean, &hijack_type),
            mitigation: MitigationAction::Manual,
        });
    };

    let report_unresolved = snapshot.settings.report_unresolved;
    let mut best: Option<(RuleOutcome, &Rule)> = None;
    for rule in rules {
        let outcome = eval_rule(update, &clean, matched_prefix, rule);
        if !outcome.hijack_type.is_hijack(report_unresolved) {
            // A fully-satisfied rule clears the update outright.
            return Classification::Clear {
                matched_prefix: Some(*matched_prefix),
            };
        }
        let better = match &best {
            None => true,
            Some((current, _)) => {
                outcome.hijack_type.path.rank()
                    < current.hijack_type.path.rank()
            }
        };
        if better {
            best = Some((outcome, rule));
        }
    }

    match best {
        None => Classification::Clear {
            matched_prefix: Some(*matched_prefix),
        },
        Some((outcome, rule)) => {
            let hijack_as = if outcome.path_hijacker != UNKNOWN_HIJACKER {
                outcome.path_hijacker
            } else {
                outcome.pol_hijacker
            };
            Classification::Hijack(Verdict {
                hijack_type: outcome.hijack_type,
                hijack_as,
                matched_prefix: *matched_prefix,
                config_timestamp: snapshot.timestamp,
                asns_inf: infected_asns(&clean, &outcome.hijack_type),
                mitigation: rule.mitigation.clone(),
            })
        }
    }
}

fn eval_rule(
    update: &Update,
    clean: &[u32],
    matched_prefix: &Prefix,
    rule: &Rule,
) -> RuleOutcome {
    // Prefix scope. A rule with no legitimate origins at all marks the
    // space as unowned, so any announcement of it is squatting.
    let scope = if rule.origin_asns.is_empty() {
        Scope::Squat
    } else if matched_prefix.length() < update.prefix.length() {
        Scope::Sub
    } else {
        Scope::Exact
    };

    // Path dimension, on the cleaned path.
    let mut path_hijacker = UNKNOWN_HIJACKER;
    let mut path = PathDim::Clean;
    if let Some(&origin) = clean.last() {
        if !rule.origin_ok(origin) {
            path_hijacker = i64::from(origin);
            path = PathDim::IllegalOrigin;
        } else if clean.len() > 1 {
            let first_hop = clean[clean.len() - 2];
            if !rule.neighbor_ok(first_hop) {
                path_hijacker = i64::from(first_hop);
                path = PathDim::IllegalFirstHop;
            } else if let Some(hijacker) =
                prepend_mismatch(&update.path, rule)
            {
                path_hijacker = i64::from(hijacker);
                path = PathDim::PrependMismatch;
            }
        }
    }

    // Policy dimension, independent of the path outcome.
    let mut pol_hijacker = UNKNOWN_HIJACKER;
    let mut policy = PolicyDim::Clean;
    if clean.len() > 3 && rule.no_export() {
        pol_hijacker = i64::from(clean[clean.len() - 2]);
        policy = PolicyDim::Leak;
    }

    RuleOutcome {
        hijack_type: HijackType {
            scope,
            path,
            policy,
        },
        path_hijacker,
        pol_hijacker,
    }
}

/// Prepend-pattern check against the raw (uncleaned) path, which
/// preserves the prepending the configured sequences describe. Returns
/// the offending hop on a mismatch: the first AS breaking the longest
/// origin-anchored match across all configured sequences.
fn prepend_mismatch(raw: &[u32], rule: &Rule) -> Option<u32> {
    if rule.prepend_seq.is_empty() || raw.len() < 2 {
        return None;
    }
    let n = raw.len();
    let mut best_match_len = 0usize;
    for seq in &rule.prepend_seq {
        if n < seq.len() + 1 {
            continue;
        }
        // The window immediately preceding the origin.
        let window = &raw[n - seq.len() - 1..n - 1];
        if window == seq.as_slice() {
            return None;
        }
        let run = window
            .iter()
            .rev()
            .zip(seq.iter().rev())
            .take_while(|(observed, configured)| observed == configured)
            .count();
        best_match_len = best_match_len.max(run);
    }
    Some(raw[n - best_match_len - 2])
}

/// The set of upstream ASNs presumed to route through the hijacker.
/// For a clear origin or first-hop violation everything above the
/// violation is polluted; a leak pollutes everything above the leaker;
/// anything else, prepend mismatches included, assumes the worst case
/// of an unseen hop two places up.
fn infected_asns(clean: &[u32], hijack_type: &HijackType) -> BTreeSet<u32> {
    let n = clean.len();
    let upto = match (hijack_type.path, hijack_type.policy) {
        (PathDim::IllegalOrigin, _) if n > 0 => n - 1,
        (PathDim::IllegalFirstHop, _) if n > 1 => n - 2,
        (PathDim::Clean, PolicyDim::Leak) if n > 1 => n - 2,
        _ if n > 2 => n - 3,
        _ => 0,
    };
    clean[..upto].iter().copied().collect()
}
