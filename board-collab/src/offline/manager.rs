//! Offline queue manager.
//!
//! Pending changes live in two places: the [`LocalStore`] (so they survive a
//! restart) and an in-memory FIFO mirror. A change is written to disk before
//! it enters the mirror, and removed from both only after it was published
//! or folded into a resolved version.
//!
//! Draining walks the queue from the front without taking items out of it.
//! When a publish fails the failed item and everything behind it are still in
//! place, in their original order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pending::{PendingChange, SyncReport, SyncState};
use crate::broadcaster::OperationBroadcaster;
use crate::clock::now_millis;
use crate::config::OfflineConfig;
use crate::conflict::{is_merge_of, Resolution};
use crate::error::{CollabError, StoreError};
use crate::protocol::Operation;
use crate::replica::ReplicaSet;
use crate::storage::LocalStore;
use crate::subscription::lock;

/// What to do with one queued change.
enum Plan {
    Publish(Operation),
    Merge(Operation),
    Drop,
}

pub struct OfflineQueueManager {
    store: Arc<LocalStore>,
    broadcaster: Arc<OperationBroadcaster>,
    replicas: Arc<ReplicaSet>,
    config: OfflineConfig,
    network: watch::Receiver<bool>,
    forced_offline: AtomicBool,
    queue: Mutex<VecDeque<(u64, PendingChange)>>,
    /// Milliseconds of the last completed drain; 0 when never synced.
    last_sync: AtomicU64,
    evicted: AtomicU64,
    state: watch::Sender<SyncState>,
    drain: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl OfflineQueueManager {
    /// Load the persisted queue and last sync time.
    ///
    /// `network` reports link-level connectivity, usually
    /// [`crate::transport::Transport::connection_status`].
    pub fn open(
        store: Arc<LocalStore>,
        broadcaster: Arc<OperationBroadcaster>,
        replicas: Arc<ReplicaSet>,
        config: OfflineConfig,
        network: watch::Receiver<bool>,
    ) -> Result<Self, StoreError> {
        let queue: VecDeque<_> = store.load_pending()?.into();
        let last_sync = store.last_sync()?.unwrap_or_default();
        let online = *network.borrow();
        let initial = if online {
            SyncState::OnlineIdle
        } else {
            SyncState::OfflineBuffering
        };
        if !queue.is_empty() {
            log::info!("Recovered {} pending changes from local store", queue.len());
        }
        let (state, _) = watch::channel(initial);

        Ok(Self {
            store,
            broadcaster,
            replicas,
            config,
            network,
            forced_offline: AtomicBool::new(false),
            queue: Mutex::new(queue),
            last_sync: AtomicU64::new(last_sync),
            evicted: AtomicU64::new(0),
            state,
            drain: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        })
    }

    /// Network signal and the manual override, combined.
    pub fn is_online(&self) -> bool {
        *self.network.borrow() && !self.forced_offline.load(Ordering::SeqCst)
    }

    /// Force offline mode regardless of the network signal.
    pub fn set_forced_offline(&self, forced: bool) {
        let was = self.forced_offline.swap(forced, Ordering::SeqCst);
        if was == forced {
            return;
        }
        log::info!("Offline override {}", if forced { "enabled" } else { "cleared" });
        if forced {
            self.state.send_replace(SyncState::OfflineBuffering);
        } else {
            self.wake.notify_one();
        }
    }

    /// Persist `change` and append it to the queue.
    ///
    /// Beyond `max_queue_len` the oldest change is evicted.
    pub fn add_pending_change(&self, change: PendingChange) -> Result<(), CollabError> {
        change.to_operation()?;
        let seq = self.store.append_pending(&change)?;
        log::debug!("Queued {:?} {} for board {}", change.op_type, change.id, change.board_id);

        let evicted = {
            let mut queue = lock(&self.queue);
            queue.push_back((seq, change));
            let mut evicted = Vec::new();
            while queue.len() > self.config.max_queue_len.max(1) {
                if let Some(entry) = queue.pop_front() {
                    evicted.push(entry);
                }
            }
            evicted
        };
        if !evicted.is_empty() {
            let seqs: Vec<u64> = evicted.iter().map(|(seq, _)| *seq).collect();
            for (_, change) in &evicted {
                log::warn!("Offline queue full; evicted oldest change {}", change.id);
            }
            self.evicted.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            self.store.remove_pending_batch(&seqs)?;
        }

        if !self.is_online() {
            self.state.send_replace(SyncState::OfflineBuffering);
        }
        Ok(())
    }

    /// Publish queued changes in order, reconciling each against the current
    /// version of its element.
    ///
    /// Stops at the first transient publish failure and returns it; that
    /// change and every later one stay queued. Changes that can never be
    /// published are dropped and logged so they cannot block the queue.
    pub async fn sync_pending_changes(&self) -> Result<SyncReport, CollabError> {
        let _guard = self.drain.lock().await;
        let mut report = SyncReport::default();

        if !self.is_online() {
            self.state.send_replace(SyncState::OfflineBuffering);
            report.remaining = self.get_pending_changes_count();
            return Ok(report);
        }
        if self.get_pending_changes_count() == 0 {
            self.state.send_replace(SyncState::OnlineIdle);
            return Ok(report);
        }

        self.state.send_replace(SyncState::Draining);
        log::info!("Draining {} pending changes", self.get_pending_changes_count());

        loop {
            let front = lock(&self.queue).front().cloned();
            let Some((seq, change)) = front else { break };

            if !self.is_online() {
                self.state.send_replace(SyncState::OfflineBuffering);
                report.remaining = self.get_pending_changes_count();
                log::info!("Went offline mid-drain; {} changes left", report.remaining);
                return Ok(report);
            }

            let plan = match change.to_operation() {
                Ok(op) => self.plan(op),
                Err(e) => {
                    log::error!("Dropping unpublishable pending change {}: {e}", change.id);
                    report.rejected += 1;
                    self.forget(seq);
                    continue;
                }
            };

            let (op, merged) = match plan {
                Plan::Publish(op) => (op, false),
                Plan::Merge(op) => (op, true),
                Plan::Drop => {
                    log::debug!("Pending change {} superseded by a newer version", change.id);
                    report.superseded += 1;
                    self.forget(seq);
                    continue;
                }
            };

            match self.broadcaster.publish_operation(&op).await {
                Ok(()) => {
                    if let Err(e) = self.replicas.apply(&op) {
                        log::warn!("Published change {} not applied locally: {e}", op.id);
                    }
                    self.forget(seq);
                    if merged {
                        report.merged += 1;
                    } else {
                        report.published += 1;
                    }
                }
                Err(e) if e.is_transient() => {
                    report.remaining = self.get_pending_changes_count();
                    self.state.send_replace(SyncState::OfflineBuffering);
                    log::warn!("Drain stopped at {}: {e}; {} changes requeued", change.id, report.remaining);
                    return Err(e.into());
                }
                Err(e) => {
                    report.rejected += 1;
                    log::error!("Dropping pending change {} rejected by broadcaster: {e}", change.id);
                    self.forget(seq);
                }
            }
        }

        let now = now_millis();
        self.last_sync.store(now, Ordering::SeqCst);
        if let Err(e) = self.store.set_last_sync(now) {
            log::error!("Failed to persist last sync time: {e}");
        }
        self.state.send_replace(SyncState::OnlineIdle);
        log::info!(
            "Drain complete: {} published, {} merged, {} superseded",
            report.published,
            report.merged,
            report.superseded
        );
        Ok(report)
    }

    fn plan(&self, op: Operation) -> Plan {
        let Some(current) = self.replicas.current(&op.board_id, &op.element_id) else {
            return Plan::Publish(op);
        };
        // Our own history for the element replays in order.
        if current.id == op.id || current.actor_id == op.actor_id {
            return Plan::Publish(op);
        }
        // A remote edit was already merged with this change locally; peers
        // only have the remote half.
        if is_merge_of(&current, &op.id) {
            return Plan::Merge(self.restamp(current.clone(), &op, &current));
        }
        match self.replicas.resolver().resolve(&op, &current) {
            Resolution::KeepLocal => Plan::Publish(op),
            Resolution::KeepRemote => Plan::Drop,
            Resolution::Merged(merged) => Plan::Merge(self.restamp(merged, &op, &current)),
        }
    }

    /// Re-issue a merged version as our own operation, ordered after both
    /// inputs so a peer holding either one adopts it under plain
    /// last-writer-wins.
    fn restamp(&self, merged: Operation, local: &Operation, current: &Operation) -> Operation {
        let clock = self.broadcaster.clock();
        clock.observe(local.timestamp.max(current.timestamp));
        let timestamp = clock.tick();
        Operation {
            id: format!("{}@{timestamp}", merged.id),
            actor_id: local.actor_id.clone(),
            timestamp,
            ..merged
        }
    }

    /// Remove a reconciled change from memory and disk.
    fn forget(&self, seq: u64) {
        lock(&self.queue).retain(|(queued, _)| *queued != seq);
        if let Err(e) = self.store.remove_pending(seq) {
            log::error!("Failed to remove pending change {seq} from store: {e}");
        }
    }

    pub fn get_pending_changes_count(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Milliseconds since the epoch of the last completed drain.
    pub fn get_last_sync_timestamp(&self) -> Option<u64> {
        match self.last_sync.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Queued changes in FIFO order.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        lock(&self.queue).iter().map(|(_, change)| change.clone()).collect()
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn sync_state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Ask the background task for a drain attempt.
    pub fn request_sync(&self) {
        self.wake.notify_one();
    }

    /// Drain on reconnect, on request and periodically while changes remain.
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut network = manager.network.clone();
            let mut tick = tokio::time::interval(manager.config.sync_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *network.borrow_and_update();
                        if !online {
                            log::info!("Network lost; buffering changes offline");
                            manager.state.send_replace(SyncState::OfflineBuffering);
                            continue;
                        }
                        log::info!("Network restored");
                        manager.drain_quietly().await;
                    }

                    _ = manager.wake.notified() => {
                        manager.drain_quietly().await;
                    }

                    _ = tick.tick() => {
                        if manager.is_online() && manager.get_pending_changes_count() > 0 {
                            manager.drain_quietly().await;
                        }
                    }
                }
            }
            log::debug!("Offline sync task stopped");
        })
    }

    async fn drain_quietly(&self) {
        if let Err(e) = self.sync_pending_changes().await {
            log::debug!("Background drain deferred: {e}");
        }
    }
}

impl std::fmt::Debug for OfflineQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueueManager")
            .field("pending", &self.get_pending_changes_count())
            .field("state", &self.sync_state())
            .finish()
    }
}
