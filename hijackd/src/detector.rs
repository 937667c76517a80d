// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The detection pipeline: feed threads push normalized updates into
//! an ingestion channel, a dispatcher shards them to classifier
//! workers by (service, peer) so each peer's stream stays ordered,
//! and lifecycle events flow out through a forwarder to a buffered
//! alert sink. Implicit withdrawals loop back into ingestion.

use crate::RunArgs;
use anyhow::{anyhow, Context, Result};
use hd_common::log::{init_file_logger, init_logger};
use hijack::cache::{CacheFront, MemCache};
use hijack::cfg::{ConfigDoc, ConfigManager, ConfigSnapshot, ReloadOutcome};
use hijack::classifier::{classify, Classification};
use hijack::feed::{JsonLinesSource, UpdateSource};
use hijack::lifecycle::{Event, LifecycleManager};
use hijack::update::{Normalizer, Update, UpdateType};
use slog::{debug, error, info, warn, Logger};
use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

const COMPONENT: &str = "hijackd";

/// How long after the last replay source finishes we keep the
/// pipeline open so looped-back implicit withdrawals drain.
const REPLAY_DRAIN_GRACE: Duration = Duration::from_secs(1);

fn read_config(path: &Path) -> Result<ConfigDoc> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let doc: ConfigDoc = serde_json::from_str(&data)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(doc)
}

/// Sleep in small steps so shutdown is observed promptly. Returns
/// false when shutdown was requested mid-sleep.
fn sleep_unless_shutdown(shutdown: &AtomicBool, total: Duration) -> bool {
    let step = Duration::from_millis(250);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let chunk = remaining.min(step);
        sleep(chunk);
        remaining -= chunk;
    }
    !shutdown.load(Ordering::Relaxed)
}

fn worker_shard(update: &Update, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    update.service.hash(&mut hasher);
    update.peer_asn.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

fn handle_update(
    update: &Update,
    snapshot: &ConfigSnapshot,
    lifecycle: &LifecycleManager<MemCache>,
) {
    match update.update_type {
        UpdateType::Announce => match classify(update, snapshot) {
            Classification::Hijack(verdict) => {
                lifecycle.on_verdict(update, &verdict, &snapshot.settings)
            }
            Classification::Clear { matched_prefix } => {
                lifecycle.on_clear(update, matched_prefix)
            }
        },
        UpdateType::Withdraw => lifecycle.on_withdrawal(update),
    }
}

fn spawn_worker(
    index: usize,
    rx: Receiver<Update>,
    config: Arc<ConfigManager>,
    lifecycle: Arc<LifecycleManager<MemCache>>,
    log: Logger,
) -> JoinHandle<()> {
    spawn(move || {
        // Drains remaining updates after the dispatcher hangs up.
        while let Ok(update) = rx.recv() {
            // Each update completes against whichever configuration
            // generation was live when it was picked up.
            let snapshot = config.current();
            handle_update(&update, &snapshot, &lifecycle);
        }
        debug!(log, "classifier worker {} done", index;
            "component" => COMPONENT);
    })
}

fn spawn_dispatcher(
    rx: Receiver<Update>,
    worker_txs: Vec<Sender<Update>>,
    shutdown: Arc<AtomicBool>,
    log: Logger,
) -> JoinHandle<()> {
    spawn(move || {
        let workers = worker_txs.len();
        let dispatch = |update: Update| {
            let shard = worker_shard(&update, workers);
            if worker_txs[shard].send(update).is_err() {
                error!(log, "worker {} channel closed", shard;
                    "component" => COMPONENT);
            }
        };
        loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(update) => dispatch(update),
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Let queued updates finish rather than aborting mid-stream.
        while let Ok(update) = rx.try_recv() {
            dispatch(update);
        }
        // Dropping the worker channels lets the workers drain and
        // exit.
    })
}

fn spawn_forwarder(
    events: Receiver<Event>,
    ingest: Sender<Update>,
    sink: Sender<String>,
    log: Logger,
) -> JoinHandle<()> {
    spawn(move || {
        while let Ok(event) = events.recv() {
            match event {
                Event::ImplicitWithdrawal(withdrawal) => {
                    if ingest.send(withdrawal).is_err() {
                        warn!(
                            log,
                            "pipeline closed, dropping implicit withdrawal";
                            "component" => COMPONENT
                        );
                    }
                }
                Event::Hijack(kind, alert) => {
                    info!(log, "hijack alert";
                        "component" => COMPONENT,
                        "kind" => format!("{kind:?}"),
                        "key" => alert.key.clone(),
                        "prefix" => alert.prefix.to_string());
                    match serde_json::to_string(&alert) {
                        Ok(line) => {
                            let _ = sink.send(line);
                        }
                        Err(e) => error!(log, "serialize alert: {}", e;
                            "component" => COMPONENT),
                    }
                }
                Event::Mitigation(request) => {
                    match serde_json::to_string(&request) {
                        Ok(line) => {
                            let _ = sink.send(line);
                        }
                        Err(e) => {
                            error!(log,
                                "serialize mitigation request: {}", e;
                                "component" => COMPONENT)
                        }
                    }
                }
            }
        }
    })
}

fn spawn_sink(
    rx: Receiver<String>,
    out: Option<File>,
    log: Logger,
) -> JoinHandle<()> {
    spawn(move || {
        let mut writer: Box<dyn Write + Send> = match out {
            Some(f) => Box::new(BufWriter::new(f)),
            None => Box::new(std::io::stdout()),
        };
        while let Ok(line) = rx.recv() {
            if writeln!(writer, "{line}").and_then(|_| writer.flush()).is_err()
            {
                error!(log, "alert sink write failed";
                    "component" => COMPONENT);
            }
        }
    })
}

fn spawn_feed(
    path: std::path::PathBuf,
    ingest: Sender<Update>,
    normalizer: Arc<Normalizer>,
    shutdown: Arc<AtomicBool>,
    log: Logger,
) -> Result<JoinHandle<()>> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "replay".to_string());
    let mut source = JsonLinesSource::open(&name, &path, log.clone())
        .with_context(|| format!("open replay feed {}", path.display()))?;
    Ok(spawn(move || {
        let mut accepted = 0u64;
        let mut dropped = 0u64;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let raw = match source.next_update() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    error!(log, "feed read failed: {}", e;
                        "component" => COMPONENT,
                        "source" => source.name().to_string());
                    break;
                }
            };
            match normalizer.normalize(&raw) {
                Ok(updates) => {
                    accepted += updates.len() as u64;
                    for update in updates {
                        if ingest.send(update).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    dropped += 1;
                    warn!(log, "dropping invalid update: {}", e;
                        "component" => COMPONENT,
                        "source" => source.name().to_string());
                }
            }
        }
        info!(log, "feed finished";
            "component" => COMPONENT,
            "source" => source.name().to_string(),
            "accepted" => accepted,
            "dropped" => dropped);
    }))
}

fn spawn_config_watcher(
    path: std::path::PathBuf,
    config: Arc<ConfigManager>,
    lifecycle: Arc<LifecycleManager<MemCache>>,
    poll: Duration,
    shutdown: Arc<AtomicBool>,
    log: Logger,
) -> JoinHandle<()> {
    spawn(move || {
        while sleep_unless_shutdown(&shutdown, poll) {
            match read_config(&path) {
                // Stale documents are a silent no-op inside load.
                Ok(doc) => match config.load(&doc) {
                    Ok(ReloadOutcome::Loaded) => {
                        // Hijacks whose rule vanished are closed out.
                        lifecycle.outdate(&config.current());
                    }
                    Ok(ReloadOutcome::Stale) => {}
                    Err(e) => {
                        error!(log, "configuration rejected: {}", e;
                            "component" => COMPONENT);
                    }
                },
                Err(e) => warn!(log, "configuration read failed: {}", e;
                    "component" => COMPONENT),
            }
        }
    })
}

fn spawn_autoignore_timer(
    config: Arc<ConfigManager>,
    lifecycle: Arc<LifecycleManager<MemCache>>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    spawn(move || {
        while sleep_unless_shutdown(&shutdown, interval) {
            lifecycle.auto_ignore(&config.current());
        }
    })
}

pub fn run(args: RunArgs) -> Result<()> {
    let log = match &args.log_file {
        Some(path) => init_file_logger(path),
        None => init_logger(),
    };

    let doc = read_config(&args.config)?;
    let initial = ConfigSnapshot::from_doc(&doc)
        .map_err(|e| anyhow!("initial configuration invalid: {e}"))?;
    info!(log, "loaded configuration";
        "component" => COMPONENT,
        "monitored_prefixes" => initial.rules.len(),
        "timestamp" => initial.timestamp);
    let historic = args.historic || initial.settings.historic;
    let config = Arc::new(ConfigManager::new(initial, log.clone()));

    if args.workers == 0 {
        return Err(anyhow!("at least one worker is required"));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let log = log.clone();
        ctrlc::set_handler(move || {
            info!(log, "shutdown requested, draining";
                "component" => COMPONENT);
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("install signal handler")?;
    }

    let (ingest_tx, ingest_rx) = channel::<Update>();
    let (event_tx, event_rx) = channel::<Event>();
    let (sink_tx, sink_rx) = channel::<String>();

    let lifecycle = Arc::new(LifecycleManager::new(
        CacheFront::new(MemCache::new(), log.clone()),
        event_tx,
        log.clone(),
    ));

    let sink_out = match &args.alerts_out {
        Some(path) => Some(
            File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| {
                    format!("open alert sink {}", path.display())
                })?,
        ),
        None => None,
    };
    let sink = spawn_sink(sink_rx, sink_out, log.clone());
    let forwarder = spawn_forwarder(
        event_rx,
        ingest_tx.clone(),
        sink_tx,
        log.clone(),
    );

    let mut worker_txs = Vec::with_capacity(args.workers);
    let mut workers = Vec::with_capacity(args.workers);
    for index in 0..args.workers {
        let (tx, rx) = channel::<Update>();
        worker_txs.push(tx);
        workers.push(spawn_worker(
            index,
            rx,
            config.clone(),
            lifecycle.clone(),
            log.clone(),
        ));
    }
    let dispatcher =
        spawn_dispatcher(ingest_rx, worker_txs, shutdown.clone(), log.clone());

    let watcher = spawn_config_watcher(
        args.config.clone(),
        config.clone(),
        lifecycle.clone(),
        Duration::from_secs(args.config_poll_secs.max(1)),
        shutdown.clone(),
        log.clone(),
    );
    let timer = spawn_autoignore_timer(
        config.clone(),
        lifecycle.clone(),
        Duration::from_secs(args.autoignore_secs.max(1)),
        shutdown.clone(),
    );

    let normalizer = Arc::new(Normalizer::new(log.clone()).historic(historic));
    let mut feeds = Vec::new();
    for path in &args.replay {
        feeds.push(spawn_feed(
            path.clone(),
            ingest_tx.clone(),
            normalizer.clone(),
            shutdown.clone(),
            log.clone(),
        )?);
    }

    let replay_mode = !feeds.is_empty();
    for feed in feeds {
        let _ = feed.join();
    }
    if replay_mode {
        // Give looped-back implicit withdrawals a moment to land.
        sleep(REPLAY_DRAIN_GRACE);
        shutdown.store(true, Ordering::Relaxed);
    } else {
        while !shutdown.load(Ordering::Relaxed) {
            sleep(Duration::from_millis(250));
        }
    }

    // Teardown order matters: close ingestion, let the dispatcher and
    // workers drain, then close the event path behind them.
    drop(ingest_tx);
    let _ = dispatcher.join();
    for worker in workers {
        let _ = worker.join();
    }
    info!(log, "pipeline drained";
        "component" => COMPONENT,
        "active_hijacks" => lifecycle.active_count(),
        "cache_failures" => lifecycle.cache_failures());
    drop(lifecycle);
    let _ = forwarder.join();
    let _ = sink.join();
    let _ = watcher.join();
    let _ = timer.join();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn update(service: &str, peer_asn: u32) -> Update {
        Update {
            service: service.to_string(),
            update_type: UpdateType::Announce,
            prefix: "10.0.0.0/24".parse().unwrap(),
            path: vec![4, 3, 2, 1],
            communities: Vec::new(),
            timestamp: 1.0,
            peer_asn,
            orig_path: None,
        }
    }

    #[test]
    fn shard_is_stable_per_peer() {
        let a = update("ris", 4);
        for workers in 1..8 {
            let shard = worker_shard(&a, workers);
            assert!(shard < workers);
            assert_eq!(shard, worker_shard(&a, workers));
        }
        // Timestamp and prefix must not influence placement.
        let mut b = update("ris", 4);
        b.timestamp = 99.0;
        b.prefix = "10.0.0.0/25".parse().unwrap();
        assert_eq!(worker_shard(&a, 7), worker_shard(&b, 7));
    }

    #[test]
    fn shutdown_cuts_sleep_short() {
        let shutdown = AtomicBool::new(false);
        assert!(sleep_unless_shutdown(&shutdown, Duration::from_millis(1)));
        shutdown.store(true, Ordering::Relaxed);
        assert!(!sleep_unless_shutdown(&shutdown, Duration::from_secs(60)));
    }

    #[test]
    fn config_file_round_trip() {
        let path = std::env::temp_dir().join("hijackd-config-test.json");
        std::fs::write(
            &path,
            r#"{
                "timestamp": 7.0,
                "prefix_groups": [
                    {
                        "prefixes": ["10.0.0.0/24"],
                        "origin_asns": [1],
                        "neighbors": [2]
                    }
                ]
            }"#,
        )
        .unwrap();
        let doc = read_config(&path).expect("read config");
        assert_eq!(doc.timestamp, 7.0);
        assert_eq!(doc.prefix_groups.len(), 1);
        std::fs::remove_file(&path).ok();
    }
}
