// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ongoing-hijack tracking: deterministic hijack keys, alert dedup,
//! implicit withdrawals, resolution on full withdrawal, and the
//! auto-ignore sweep for stale low-impact records.
//!
//! Locking discipline: the map lock covers only lookup/insert of the
//! per-record handle; all mutation happens under the record's own
//! lock so two workers observing the same hijack in the same instant
//! merge into one record.

use crate::cache::{CacheFront, DedupCache};
use crate::cfg::{ConfigSnapshot, DetectorSettings, MitigationAction};
use crate::classifier::{HijackType, Scope, Verdict};
use crate::log::hijack_log;
use crate::types::Prefix;
use crate::update::{content_digest, OrigPath, Update, UpdateType};
use hd_common::lock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Service tag carried by synthesized withdrawals.
pub const IMPLICIT_WITHDRAWAL_SERVICE: &str = "implicit-withdrawal";

/// TTL on dedup markers in the external cache, refreshed on every
/// touch. A hijack silent for longer than this loses suppression but
/// nothing else.
pub const MARKER_TTL: Duration = Duration::from_secs(24 * 3600);

/// Deterministic hijack identity: a pure function of the observed
/// prefix, the offending ASN and the type tag, stable across process
/// restarts.
pub fn hijack_key(prefix: &Prefix, hijack_as: i64, type_tag: &str) -> String {
    content_digest(&format!("{prefix}|{hijack_as}|{type_tag}"))
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum HijackState {
    Active,
    Resolved,
    Ignored,
    /// The configuration no longer monitors the configured prefix the
    /// verdict was issued under.
    Outdated,
}

/// Mutable record for one ongoing hijack key.
#[derive(Debug, Clone)]
pub struct OngoingHijack {
    pub key: String,
    pub prefix: Prefix,
    pub configured_prefix: Prefix,
    pub hijack_as: i64,
    pub hijack_type: HijackType,
    pub time_started: f64,
    pub time_last: f64,
    pub time_detected: f64,
    pub peers_seen: BTreeSet<u32>,
    pub peers_withdrawn: BTreeSet<u32>,
    pub asns_inf: BTreeSet<u32>,
    pub state: HijackState,
    pub config_timestamp: f64,
    pub mitigation: MitigationAction,
}

/// The alert wire record, one per classification or state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Alert {
    pub key: String,
    pub prefix: Prefix,
    pub hijack_as: i64,
    #[serde(rename = "type")]
    pub type_tag: [String; 4],
    pub time_detected: f64,
    pub num_peers_seen: usize,
    pub num_asns_inf: usize,
}

impl Alert {
    fn from_record(rec: &OngoingHijack) -> Self {
        Self {
            key: rec.key.clone(),
            prefix: rec.prefix,
            hijack_as: rec.hijack_as,
            type_tag: rec
                .hijack_type
                .tag()
                .map(|dimension| dimension.to_string()),
            time_detected: rec.time_detected,
            num_peers_seen: rec.peers_seen.len(),
            num_asns_inf: rec.asns_inf.len(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// First sighting of this hijack key.
    New,
    /// Peer or infected-AS count crossed a materiality threshold.
    Escalated,
    Resolved,
    Ignored,
    /// A reconfiguration removed the rule the verdict was issued
    /// under.
    Outdated,
}

/// Request handed to the external mitigation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct MitigationRequest {
    pub hijack_info: Alert,
    pub mitigation_action: MitigationAction,
}

/// Everything the lifecycle manager hands downstream. Alert events go
/// to the sink; implicit withdrawals are fed back into the update
/// pipeline by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Hijack(AlertKind, Alert),
    ImplicitWithdrawal(Update),
    Mitigation(MitigationRequest),
}

pub struct LifecycleManager<C: DedupCache> {
    cache: CacheFront<C>,
    ongoing: Mutex<HashMap<String, Arc<Mutex<OngoingHijack>>>>,
    events: Sender<Event>,
    log: Logger,
}

fn peer_marker(prefix: &Prefix, peer_asn: u32) -> String {
    format!("prefix_{prefix}_peer_{peer_asn}_hijacks")
}

fn hijack_marker(key: &str) -> String {
    format!("hijack_{key}_prefixes_peers")
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl<C: DedupCache> LifecycleManager<C> {
    pub fn new(cache: CacheFront<C>, events: Sender<Event>, log: Logger) -> Self {
        Self {
            cache,
            ongoing: Mutex::new(HashMap::new()),
            events,
            log,
        }
    }

    /// Health signal: cache operations that exhausted their retry
    /// budget since startup.
    pub fn cache_failures(&self) -> u64 {
        self.cache.failures()
    }

    /// Snapshot of a record, mainly for inspection and tests.
    pub fn record(&self, key: &str) -> Option<OngoingHijack> {
        let arc = lock!(self.ongoing).get(key).cloned()?;
        let rec = lock!(arc);
        Some(rec.clone())
    }

    pub fn active_count(&self) -> usize {
        let map = lock!(self.ongoing);
        map.values()
            .filter(|arc| lock!(arc).state == HijackState::Active)
            .count()
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            // Sink gone, e.g. during shutdown.
            hijack_log!(
                self.log,
                warn,
                crate::MOD_LIFECYCLE,
                "event sink closed, dropping event"
            );
        }
    }

    /// Record the (prefix, peer) → hijack-key associations for a
    /// sighting. Markers go under both the observed prefix and the
    /// configured prefix it matched, so a withdrawal of either form
    /// reaches the record; synthesized implicit withdrawals carry the
    /// configured prefix.
    fn mark_seen(&self, update: &Update, configured: &Prefix, key: &str) {
        let mut prefixes = vec![update.prefix];
        if *configured != update.prefix {
            prefixes.push(*configured);
        }
        let reverse = hijack_marker(key);
        for prefix in prefixes {
            let marker = peer_marker(&prefix, update.peer_asn);
            self.cache.set_add(&marker, key);
            self.cache.expire_in(&marker, MARKER_TTL);
            self.cache
                .set_add(&reverse, &format!("{}_{}", prefix, update.peer_asn));
        }
        self.cache.expire_in(&reverse, MARKER_TTL);
    }

    fn purge_markers(&self, key: &str) {
        let reverse = hijack_marker(key);
        for entry in self.cache.set_members(&reverse) {
            if let Some((prefix, peer)) = entry.rsplit_once('_') {
                if let (Ok(prefix), Ok(peer)) =
                    (prefix.parse::<Prefix>(), peer.parse::<u32>())
                {
                    self.cache.set_remove(&peer_marker(&prefix, peer), key);
                }
            }
        }
        self.cache.remove(&reverse);
    }

    /// Handle a non-benign classification. Creates the record and
    /// alerts on first sighting, merges and re-alerts only across
    /// materiality thresholds on repeats. Ignored records absorb
    /// repeat sightings silently; resolved records start over.
    pub fn on_verdict(
        &self,
        update: &Update,
        verdict: &Verdict,
        settings: &DetectorSettings,
    ) {
        let type_tag = verdict.hijack_type.to_string();
        let key = hijack_key(&update.prefix, verdict.hijack_as, &type_tag);

        let fresh = OngoingHijack {
            key: key.clone(),
            prefix: update.prefix,
            configured_prefix: verdict.matched_prefix,
            hijack_as: verdict.hijack_as,
            hijack_type: verdict.hijack_type,
            time_started: update.timestamp,
            time_last: update.timestamp,
            time_detected: now_ts(),
            peers_seen: [update.peer_asn].into_iter().collect(),
            peers_withdrawn: BTreeSet::new(),
            asns_inf: verdict.asns_inf.clone(),
            state: HijackState::Active,
            config_timestamp: verdict.config_timestamp,
            mitigation: verdict.mitigation.clone(),
        };

        let (arc, created) = {
            let mut map = lock!(self.ongoing);
            match map.get(&key) {
                Some(arc) => (arc.clone(), false),
                None => {
                    let arc = Arc::new(Mutex::new(fresh.clone()));
                    map.insert(key.clone(), arc.clone());
                    (arc, true)
                }
            }
        };

        self.mark_seen(update, &verdict.matched_prefix, &key);

        if created {
            let rec = lock!(arc);
            hijack_log!(
                self.log,
                info,
                crate::MOD_LIFECYCLE,
                "new hijack {} on {}",
                rec.hijack_type,
                rec.prefix;
                "key" => rec.key.clone(),
                "hijack_as" => rec.hijack_as
            );
            self.emit(Event::Hijack(AlertKind::New, Alert::from_record(&rec)));
            if rec.mitigation != MitigationAction::Manual {
                self.emit(Event::Mitigation(MitigationRequest {
                    hijack_info: Alert::from_record(&rec),
                    mitigation_action: rec.mitigation.clone(),
                }));
            }
            return;
        }

        let mut rec = lock!(arc);
        match rec.state {
            HijackState::Ignored => {
                // Silenced; track activity but never reactivate
                // without a fresh record.
                rec.time_last = rec.time_last.max(update.timestamp);
            }
            HijackState::Resolved | HijackState::Outdated => {
                *rec = fresh;
                self.emit(Event::Hijack(
                    AlertKind::New,
                    Alert::from_record(&rec),
                ));
            }
            HijackState::Active => {
                let peers_before = rec.peers_seen.len();
                let asns_before = rec.asns_inf.len();
                rec.time_started = rec.time_started.min(update.timestamp);
                rec.time_last = rec.time_last.max(update.timestamp);
                rec.peers_seen.insert(update.peer_asn);
                rec.asns_inf.extend(verdict.asns_inf.iter().copied());
                let crossed = |before: usize, after: usize, thr: usize| {
                    before < thr && after >= thr
                };
                if crossed(
                    peers_before,
                    rec.peers_seen.len(),
                    settings.realert_peer_threshold,
                ) || crossed(
                    asns_before,
                    rec.asns_inf.len(),
                    settings.realert_asn_threshold,
                ) {
                    self.emit(Event::Hijack(
                        AlertKind::Escalated,
                        Alert::from_record(&rec),
                    ));
                }
            }
        }
    }

    /// Handle a benign announcement. If this (prefix, peer) pair, or
    /// its immediate parent, has an active hijack on record, the fix
    /// arrived as a legitimate re-announcement rather than an explicit
    /// withdrawal; synthesize one so downstream consumers resolve the
    /// hijack.
    pub fn on_clear(&self, update: &Update, matched_prefix: Option<Prefix>) {
        let peer = update.peer_asn;
        let direct = self
            .cache
            .exists(&peer_marker(&update.prefix, peer));
        let parent = update.prefix.parent();
        let via_parent = !direct
            && parent
                .map(|p| self.cache.exists(&peer_marker(&p, peer)))
                .unwrap_or(false);
        if !direct && !via_parent {
            return;
        }

        // Withdraw the configured prefix: collectors often never emit
        // an explicit withdrawal for the hijacked more-specific.
        let prefix = matched_prefix.unwrap_or(if via_parent {
            // parent is present when via_parent holds
            parent.unwrap_or(update.prefix)
        } else {
            update.prefix
        });

        let withdrawal = Update {
            service: IMPLICIT_WITHDRAWAL_SERVICE.to_string(),
            update_type: UpdateType::Withdraw,
            prefix,
            path: vec![],
            communities: vec![],
            timestamp: update.timestamp + 1.0,
            peer_asn: peer,
            orig_path: Some(OrigPath::Trigger {
                triggering_bgp_update: Box::new(update.clone()),
            }),
        };
        hijack_log!(
            self.log,
            info,
            crate::MOD_LIFECYCLE,
            "synthesizing implicit withdrawal for {} via peer {}",
            prefix,
            peer
        );
        self.emit(Event::ImplicitWithdrawal(withdrawal));
    }

    /// Handle a withdrawal, explicit or synthesized. Every hijack this
    /// (prefix, peer) pair was seen for loses that peer; a record whose
    /// observers have all withdrawn is resolved. Ignored records
    /// resolve too, without an alert, so their markers do not outlive
    /// the hijack.
    pub fn on_withdrawal(&self, update: &Update) {
        let peer = update.peer_asn;
        let keys = self
            .cache
            .set_members(&peer_marker(&update.prefix, peer));
        for key in keys {
            let Some(arc) = lock!(self.ongoing).get(&key).cloned() else {
                continue;
            };
            let resolved = {
                let mut rec = lock!(arc);
                if matches!(
                    rec.state,
                    HijackState::Resolved | HijackState::Outdated
                ) {
                    continue;
                }
                let was_active = rec.state == HijackState::Active;
                rec.peers_withdrawn.insert(peer);
                rec.time_last = rec.time_last.max(update.timestamp);
                if rec.peers_seen.is_subset(&rec.peers_withdrawn) {
                    rec.state = HijackState::Resolved;
                    hijack_log!(
                        self.log,
                        info,
                        crate::MOD_LIFECYCLE,
                        "hijack {} resolved, all {} peers withdrew",
                        rec.key,
                        rec.peers_seen.len()
                    );
                    if was_active {
                        self.emit(Event::Hijack(
                            AlertKind::Resolved,
                            Alert::from_record(&rec),
                        ));
                    }
                    true
                } else {
                    false
                }
            };
            if resolved {
                self.purge_markers(&key);
            }
        }
    }

    /// Apply a freshly loaded configuration generation: active records
    /// whose configured prefix is no longer monitored are outdated and
    /// their markers purged. Squatting records are exempt; they never
    /// had a configured prefix to lose.
    pub fn outdate(&self, snapshot: &ConfigSnapshot) {
        let records: Vec<Arc<Mutex<OngoingHijack>>> =
            lock!(self.ongoing).values().cloned().collect();
        for arc in records {
            let outdated = {
                let mut rec = lock!(arc);
                if rec.state != HijackState::Active
                    || rec.hijack_type.scope == Scope::Squat
                    || rec.config_timestamp >= snapshot.timestamp
                    || snapshot.rules.get(&rec.configured_prefix).is_some()
                {
                    continue;
                }
                rec.state = HijackState::Outdated;
                hijack_log!(
                    self.log,
                    info,
                    crate::MOD_LIFECYCLE,
                    "outdating hijack {}, prefix {} no longer monitored",
                    rec.key,
                    rec.configured_prefix
                );
                self.emit(Event::Hijack(
                    AlertKind::Outdated,
                    Alert::from_record(&rec),
                ));
                rec.key.clone()
            };
            self.purge_markers(&outdated);
        }
    }

    /// Periodic sweep applying the configured auto-ignore rules:
    /// an active record below both thresholds with no activity for
    /// the rule's interval is silenced, never deleted.
    pub fn auto_ignore(&self, snapshot: &ConfigSnapshot) {
        self.auto_ignore_at(snapshot, now_ts());
    }

    fn auto_ignore_at(&self, snapshot: &ConfigSnapshot, now: f64) {
        let records: Vec<Arc<Mutex<OngoingHijack>>> =
            lock!(self.ongoing).values().cloned().collect();
        for arc in records {
            let mut rec = lock!(arc);
            if rec.state != HijackState::Active {
                continue;
            }
            let Some((_, rule)) = snapshot.autoignore.lookup(&rec.prefix)
            else {
                continue;
            };
            if now - rec.time_last < rule.interval as f64 {
                continue;
            }
            if rec.peers_seen.len() < rule.thres_num_peers_seen
                && rec.asns_inf.len() < rule.thres_num_ases_infected
            {
                rec.state = HijackState::Ignored;
                hijack_log!(
                    self.log,
                    info,
                    crate::MOD_LIFECYCLE,
                    "auto-ignoring stale low-impact hijack {}",
                    rec.key;
                    "peers_seen" => rec.peers_seen.len(),
                    "asns_inf" => rec.asns_inf.len()
                );
                self.emit(Event::Hijack(
                    AlertKind::Ignored,
                    Alert::from_record(&rec),
                ));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hijack_key_is_pure() {
        let prefix: Prefix = "10.0.0.0/25".parse().unwrap();
        let a = hijack_key(&prefix, 100, "S|0|-|-");
        let b = hijack_key(&prefix, 100, "S|0|-|-");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, hijack_key(&prefix, 101, "S|0|-|-"));
        assert_ne!(a, hijack_key(&prefix, 100, "E|0|-|-"));
    }

    #[test]
    fn marker_key_shapes() {
        let prefix: Prefix = "10.0.0.0/24".parse().unwrap();
        assert_eq!(
            peer_marker(&prefix, 4),
            "prefix_10.0.0.0/24_peer_4_hijacks"
        );
        assert_eq!(hijack_marker("abc"), "hijack_abc_prefixes_peers");
    }
}
