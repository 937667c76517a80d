// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests over the whole pipeline: normalize, classify,
//! lifecycle. Unit tests for the individual pieces live next to them.

use crate::cache::{CacheFront, MemCache};
use crate::cfg::{
    AutoIgnoreRule, ConfigDoc, ConfigSnapshot, DetectorSettings,
    MitigationAction, PrefixGroup,
};
use crate::classifier::{classify, Classification};
use crate::lifecycle::{
    AlertKind, Event, HijackState, LifecycleManager,
    IMPLICIT_WITHDRAWAL_SERVICE,
};
use crate::update::{
    Normalizer, OrigPath, RawHop, RawUpdate, Update, UpdateType,
};
use pretty_assertions::assert_eq;
use slog::Logger;
use std::sync::mpsc::{channel, Receiver};

fn logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

fn group(prefixes: &[&str], origins: &[i64], neighbors: &[i64]) -> PrefixGroup {
    PrefixGroup {
        prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
        origin_asns: origins.to_vec(),
        neighbors: neighbors.to_vec(),
        prepend_seq: vec![],
        policies: vec![],
        community_annotations: serde_json::Value::Null,
        mitigation: MitigationAction::Manual,
    }
}

fn snapshot_with(
    groups: Vec<PrefixGroup>,
    autoignore: Vec<AutoIgnoreRule>,
) -> ConfigSnapshot {
    ConfigSnapshot::from_doc(&ConfigDoc {
        timestamp: 1.0,
        prefix_groups: groups,
        autoignore,
        settings: DetectorSettings::default(),
    })
    .expect("compile config")
}

fn snapshot(groups: Vec<PrefixGroup>) -> ConfigSnapshot {
    snapshot_with(groups, vec![])
}

fn engine() -> (LifecycleManager<MemCache>, Receiver<Event>) {
    let (tx, rx) = channel();
    let front = CacheFront::new(MemCache::new(), logger());
    (LifecycleManager::new(front, tx, logger()), rx)
}

fn announce(prefix: &str, path: &[u32], peer_asn: u32, ts: f64) -> Update {
    Update {
        service: "test-collector".into(),
        update_type: UpdateType::Announce,
        prefix: prefix.parse().expect("parse prefix"),
        path: path.to_vec(),
        communities: vec![],
        timestamp: ts,
        peer_asn,
        orig_path: None,
    }
}

fn withdraw(prefix: &str, peer_asn: u32, ts: f64) -> Update {
    Update {
        service: "test-collector".into(),
        update_type: UpdateType::Withdraw,
        prefix: prefix.parse().expect("parse prefix"),
        path: vec![],
        communities: vec![],
        timestamp: ts,
        peer_asn,
        orig_path: None,
    }
}

/// Route one canonical update through the pipeline the way the daemon
/// worker does.
fn process(
    update: &Update,
    snap: &ConfigSnapshot,
    mgr: &LifecycleManager<MemCache>,
) {
    match update.update_type {
        UpdateType::Announce => match classify(update, snap) {
            Classification::Hijack(v) => {
                mgr.on_verdict(update, &v, &snap.settings)
            }
            Classification::Clear { matched_prefix } => {
                mgr.on_clear(update, matched_prefix)
            }
        },
        UpdateType::Withdraw => mgr.on_withdrawal(update),
    }
}

fn drain(rx: &Receiver<Event>) -> Vec<Event> {
    let mut out = vec![];
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[test]
fn subprefix_hijack_alerts_once() {
    let snap = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    let (mgr, rx) = engine();

    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, 10.0), &snap, &mgr);
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    let Event::Hijack(kind, alert) = &events[0] else {
        panic!("expected a hijack alert");
    };
    assert_eq!(*kind, AlertKind::New);
    assert_eq!(alert.hijack_as, 100);
    assert_eq!(alert.type_tag, ["S", "0", "-", "-"]);
    assert_eq!(alert.num_peers_seen, 1);
    assert_eq!(alert.num_asns_inf, 3);

    // same hijack from another peer: merged, below thresholds, silent
    process(&announce("10.0.0.0/25", &[7, 3, 2, 100], 5, 11.0), &snap, &mgr);
    assert!(drain(&rx).is_empty());

    let rec = mgr.record(&alert.key).expect("record");
    assert_eq!(rec.peers_seen.len(), 2);
    assert_eq!(rec.time_started, 10.0);
    assert_eq!(rec.time_last, 11.0);
    assert_eq!(rec.state, HijackState::Active);
    assert_eq!(
        rec.configured_prefix.to_string(),
        "10.0.0.0/24"
    );
}

#[test]
fn escalation_crosses_peer_threshold() {
    let mut snap = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    snap.settings.realert_peer_threshold = 3;
    let (mgr, rx) = engine();

    for peer in [4, 5] {
        process(
            &announce("10.0.0.0/25", &[4, 3, 2, 100], peer, 10.0),
            &snap,
            &mgr,
        );
    }
    // one New alert, second peer below threshold
    assert_eq!(drain(&rx).len(), 1);

    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 6, 12.0), &snap, &mgr);
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    let Event::Hijack(kind, alert) = &events[0] else {
        panic!("expected a hijack alert");
    };
    assert_eq!(*kind, AlertKind::Escalated);
    assert_eq!(alert.num_peers_seen, 3);
}

#[test]
fn clear_announcement_synthesizes_implicit_withdrawal() {
    let mut snap = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    // let the legitimate re-announcement of the more-specific clear
    // instead of tripping the residual sub-prefix row
    snap.settings.report_unresolved = false;
    let (mgr, rx) = engine();

    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, 10.0), &snap, &mgr);
    drain(&rx);

    // the origin corrects itself with a legitimate announcement of
    // the same more-specific
    let trigger = announce("10.0.0.0/25", &[4, 3, 2, 1], 4, 20.0);
    process(&trigger, &snap, &mgr);

    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    let Event::ImplicitWithdrawal(w) = &events[0] else {
        panic!("expected an implicit withdrawal");
    };
    assert_eq!(w.service, IMPLICIT_WITHDRAWAL_SERVICE);
    assert_eq!(w.update_type, UpdateType::Withdraw);
    // carries the configured parent prefix, not the hijacked /25
    assert_eq!(w.prefix.to_string(), "10.0.0.0/24");
    assert!(w.path.is_empty());
    assert!(w.communities.is_empty());
    assert_eq!(w.timestamp, 21.0);
    assert_eq!(w.peer_asn, 4);
    match &w.orig_path {
        Some(OrigPath::Trigger {
            triggering_bgp_update,
        }) => assert_eq!(**triggering_bgp_update, trigger),
        other => panic!("expected trigger provenance, got {other:?}"),
    }

    // a clear update for an untouched (prefix, peer) pair stays quiet
    process(&announce("10.0.0.0/24", &[9, 2, 1], 9, 22.0), &snap, &mgr);
    assert!(drain(&rx).is_empty());
}

#[test]
fn looped_back_implicit_withdrawal_resolves_subprefix_hijack() {
    let mut snap = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    snap.settings.report_unresolved = false;
    let (mgr, rx) = engine();

    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, 10.0), &snap, &mgr);
    let events = drain(&rx);
    let Event::Hijack(AlertKind::New, alert) = &events[0] else {
        panic!("expected a new-hijack alert");
    };
    let key = alert.key.clone();

    // the origin re-announces legitimately; the synthesized
    // withdrawal carries the configured /24
    process(&announce("10.0.0.0/25", &[4, 3, 2, 1], 4, 20.0), &snap, &mgr);
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    let Event::ImplicitWithdrawal(w) = &events[0] else {
        panic!("expected an implicit withdrawal");
    };
    assert_eq!(w.prefix.to_string(), "10.0.0.0/24");

    // feed it back through the pipeline like the daemon forwarder
    process(w, &snap, &mgr);
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::Hijack(AlertKind::Resolved, _)));
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Resolved);
}

#[test]
fn withdrawal_from_all_peers_resolves() {
    let snap = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    let (mgr, rx) = engine();

    for peer in [4, 5] {
        process(
            &announce("10.0.0.0/25", &[4, 3, 2, 100], peer, 10.0),
            &snap,
            &mgr,
        );
    }
    let events = drain(&rx);
    let Event::Hijack(_, alert) = &events[0] else {
        panic!("expected a hijack alert");
    };
    let key = alert.key.clone();

    process(&withdraw("10.0.0.0/25", 4, 30.0), &snap, &mgr);
    assert!(drain(&rx).is_empty());
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Active);

    process(&withdraw("10.0.0.0/25", 5, 31.0), &snap, &mgr);
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        Event::Hijack(AlertKind::Resolved, _)
    ));
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Resolved);

    // a fresh verdict for the same key starts a new active record
    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, 40.0), &snap, &mgr);
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::Hijack(AlertKind::New, _)));
    let rec = mgr.record(&key).unwrap();
    assert_eq!(rec.state, HijackState::Active);
    assert_eq!(rec.time_started, 40.0);
    assert_eq!(rec.peers_seen.len(), 1);
}

#[test]
fn auto_ignore_fires_only_after_interval() {
    let snap = snapshot_with(
        vec![group(&["10.0.0.0/24"], &[1], &[2])],
        vec![AutoIgnoreRule {
            prefixes: vec!["10.0.0.0/24".into()],
            thres_num_peers_seen: 5,
            thres_num_ases_infected: 5,
            interval: 600,
        }],
    );
    let (mgr, rx) = engine();

    let now = chrono::Utc::now().timestamp() as f64;

    // recent activity: the interval has not elapsed
    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, now), &snap, &mgr);
    let events = drain(&rx);
    let Event::Hijack(_, fresh_alert) = &events[0] else {
        panic!("expected a hijack alert");
    };
    mgr.auto_ignore(&snap);
    assert!(drain(&rx).is_empty());
    assert_eq!(
        mgr.record(&fresh_alert.key).unwrap().state,
        HijackState::Active
    );

    // stale low-impact record: silenced
    process(
        &announce("10.0.0.0/26", &[4, 3, 2, 100], 4, now - 3600.0),
        &snap,
        &mgr,
    );
    let events = drain(&rx);
    let Event::Hijack(_, stale_alert) = &events[0] else {
        panic!("expected a hijack alert");
    };
    mgr.auto_ignore(&snap);
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::Hijack(AlertKind::Ignored, _)));
    let key = stale_alert.key.clone();
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Ignored);

    // repeat sightings never reactivate a silenced record
    process(
        &announce("10.0.0.0/26", &[4, 3, 2, 100], 4, now - 3600.0),
        &snap,
        &mgr,
    );
    assert!(drain(&rx).is_empty());
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Ignored);
}

#[test]
fn withdrawal_resolves_ignored_record_silently() {
    let snap = snapshot_with(
        vec![group(&["10.0.0.0/24"], &[1], &[2])],
        vec![AutoIgnoreRule {
            prefixes: vec!["10.0.0.0/24".into()],
            thres_num_peers_seen: 5,
            thres_num_ases_infected: 5,
            interval: 600,
        }],
    );
    let (mgr, rx) = engine();

    let old = chrono::Utc::now().timestamp() as f64 - 3600.0;
    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, old), &snap, &mgr);
    let events = drain(&rx);
    let Event::Hijack(_, alert) = &events[0] else {
        panic!("expected a hijack alert");
    };
    let key = alert.key.clone();

    mgr.auto_ignore(&snap);
    drain(&rx);
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Ignored);

    // all observing peers withdraw: the record resolves without an
    // alert and its markers go with it
    process(&withdraw("10.0.0.0/25", 4, old + 3700.0), &snap, &mgr);
    assert!(drain(&rx).is_empty());
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Resolved);

    // a fresh sighting starts a new alert cycle
    process(
        &announce("10.0.0.0/25", &[4, 3, 2, 100], 4, old + 3800.0),
        &snap,
        &mgr,
    );
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::Hijack(AlertKind::New, _)));
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Active);
}

#[test]
fn high_impact_record_is_never_auto_ignored() {
    let snap = snapshot_with(
        vec![group(&["10.0.0.0/24"], &[1], &[2])],
        vec![AutoIgnoreRule {
            prefixes: vec!["10.0.0.0/24".into()],
            thres_num_peers_seen: 2,
            thres_num_ases_infected: 100,
            interval: 600,
        }],
    );
    let (mgr, rx) = engine();

    let old = chrono::Utc::now().timestamp() as f64 - 3600.0;
    for peer in [4, 5, 6] {
        process(
            &announce("10.0.0.0/25", &[4, 3, 2, 100], peer, old),
            &snap,
            &mgr,
        );
    }
    let events = drain(&rx);
    let Event::Hijack(_, alert) = &events[0] else {
        panic!("expected a hijack alert");
    };

    mgr.auto_ignore(&snap);
    assert!(drain(&rx).is_empty());
    assert_eq!(mgr.record(&alert.key).unwrap().state, HijackState::Active);
}

#[test]
fn reload_outdates_hijacks_on_removed_prefixes() {
    let snap = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    let (mgr, rx) = engine();

    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, 10.0), &snap, &mgr);
    let events = drain(&rx);
    let Event::Hijack(_, alert) = &events[0] else {
        panic!("expected a hijack alert");
    };
    let key = alert.key.clone();

    // a newer generation that still monitors the prefix changes
    // nothing
    let mut same = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    same.timestamp = 2.0;
    mgr.outdate(&same);
    assert!(drain(&rx).is_empty());
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Active);

    // a generation that dropped the prefix closes the record out
    let mut dropped = snapshot(vec![group(&["192.0.2.0/24"], &[1], &[2])]);
    dropped.timestamp = 3.0;
    mgr.outdate(&dropped);
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::Hijack(AlertKind::Outdated, _)));
    assert_eq!(mgr.record(&key).unwrap().state, HijackState::Outdated);

    // with the markers purged, a later withdrawal finds nothing
    process(&withdraw("10.0.0.0/25", 4, 30.0), &snap, &mgr);
    assert!(drain(&rx).is_empty());
}

#[test]
fn set_path_branches_classify_independently() {
    let snap = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    let (mgr, rx) = engine();
    let normalizer = Normalizer::new(logger()).historic(true);

    let raw = RawUpdate {
        service: "test-collector".into(),
        update_type: UpdateType::Announce,
        prefix: "10.0.0.0/24".into(),
        path: Some(vec![
            RawHop::Asn(4),
            RawHop::Expr("{2,200}".into()),
            RawHop::Asn(1),
        ]),
        communities: vec![],
        timestamp: 10.0,
        peer_asn: 4,
    };

    let updates = normalizer.normalize(&raw).expect("normalize");
    assert_eq!(updates.len(), 2);
    for update in &updates {
        process(update, &snap, &mgr);
    }

    // the branch via 2 is benign, the branch via 200 is a type-1
    // hijack; only the latter alerts
    let events = drain(&rx);
    assert_eq!(events.len(), 1);
    let Event::Hijack(AlertKind::New, alert) = &events[0] else {
        panic!("expected a new-hijack alert");
    };
    assert_eq!(alert.type_tag, ["E", "1", "-", "-"]);
    assert_eq!(alert.hijack_as, 200);
}

#[test]
fn mitigation_request_for_non_manual_directive() {
    let mut g = group(&["10.0.0.0/24"], &[1], &[2]);
    g.mitigation = MitigationAction::Action("deaggregate".into());
    let snap = snapshot(vec![g]);
    let (mgr, rx) = engine();

    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, 10.0), &snap, &mgr);
    let events = drain(&rx);
    assert_eq!(events.len(), 2);
    let Event::Mitigation(req) = &events[1] else {
        panic!("expected a mitigation request");
    };
    assert_eq!(
        req.mitigation_action,
        MitigationAction::Action("deaggregate".into())
    );
    assert_eq!(req.hijack_info.hijack_as, 100);
}

#[test]
fn alert_wire_shape() {
    let snap = snapshot(vec![group(&["10.0.0.0/24"], &[1], &[2])]);
    let (mgr, rx) = engine();
    process(&announce("10.0.0.0/25", &[4, 3, 2, 100], 4, 10.0), &snap, &mgr);
    let events = drain(&rx);
    let Event::Hijack(_, alert) = &events[0] else {
        panic!("expected a hijack alert");
    };

    let value = serde_json::to_value(alert).expect("serialize alert");
    assert_eq!(value["prefix"], "10.0.0.0/25");
    assert_eq!(value["hijack_as"], 100);
    assert_eq!(
        value["type"],
        serde_json::json!(["S", "0", "-", "-"])
    );
    assert_eq!(value["num_peers_seen"], 1);
    assert_eq!(value["key"].as_str().unwrap().len(), 32);
}
