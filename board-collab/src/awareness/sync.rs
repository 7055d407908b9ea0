//! Wires an [`AwarenessStore`] to a board channel.
//!
//! Outbound: one task takes the latest scheduled snapshot, waits out the
//! quality-derived throttle, and publishes it. The same task re-stamps the
//! local snapshot as a heartbeat and sweeps stale remote entries.
//!
//! Inbound: awareness and leave events are applied to the store. A client
//! only speaks for itself, so frames naming another client are dropped.
//!
//! Awareness is perishable, so a failed publish is logged and forgotten.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::store::AwarenessStore;
use crate::broadcaster::OperationBroadcaster;
use crate::config::AwarenessConfig;
use crate::protocol::{EventKind, EventPayload};
use crate::quality::QualityMonitor;
use crate::subscription::Subscription;

pub struct AwarenessSync {
    board_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
}

impl AwarenessSync {
    pub fn start(
        store: Arc<AwarenessStore>,
        broadcaster: Arc<OperationBroadcaster>,
        board_id: impl Into<String>,
        config: &AwarenessConfig,
        quality: Arc<QualityMonitor>,
    ) -> Self {
        let board_id = board_id.into();

        let inbound = store.clone();
        let on_update = broadcaster.subscribe(&board_id, EventKind::Awareness, move |delivery| {
            if let EventPayload::Awareness(update) = &delivery.payload {
                if update.state.client_id != delivery.envelope.actor_id {
                    log::warn!(
                        "Dropping awareness for {} sent by {}",
                        update.state.client_id,
                        delivery.envelope.actor_id
                    );
                    return Ok(());
                }
                inbound.apply_remote(update.clone());
            }
            Ok(())
        });
        let inbound = store.clone();
        let on_leave = broadcaster.subscribe(&board_id, EventKind::AwarenessLeave, move |delivery| {
            if let EventPayload::Leave { client_id } = &delivery.payload {
                if *client_id != delivery.envelope.actor_id {
                    log::warn!("Dropping leave for {client_id} sent by {}", delivery.envelope.actor_id);
                    return Ok(());
                }
                inbound.remove_client(client_id);
            }
            Ok(())
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_outbound(
            store,
            broadcaster,
            board_id.clone(),
            config.clone(),
            quality,
            cancel.clone(),
        ));
        log::debug!("Awareness sync started for board {board_id}");

        Self {
            board_id,
            cancel,
            task: Some(task),
            subscriptions: vec![on_update, on_leave],
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Stop listening, announce the leave and wait for the task. Idempotent.
    pub async fn stop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for AwarenessSync {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_outbound(
    store: Arc<AwarenessStore>,
    broadcaster: Arc<OperationBroadcaster>,
    board_id: String,
    config: AwarenessConfig,
    quality: Arc<QualityMonitor>,
    cancel: CancellationToken,
) {
    let mut outbound = store.outbound();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval().max(Duration::from_millis(1)));
    let mut sweep = tokio::time::interval(config.sweep_interval().max(Duration::from_millis(1)));
    let mut last_sent: Option<Instant> = None;

    // Announce ourselves right away.
    outbound.mark_changed();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            changed = outbound.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(sent) = last_sent {
                    let interval = quality.recommended_interval().max(config.min_broadcast_interval());
                    let ready = sent + interval;
                    if ready > Instant::now() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep_until(ready) => {}
                        }
                    }
                }
                // Whatever arrived during the wait supersedes the trigger.
                let update = outbound.borrow_and_update().clone();
                let payload = EventPayload::Awareness(update);
                if let Err(e) = broadcaster.publish(&board_id, EventKind::Awareness, &payload).await {
                    log::trace!("Awareness publish dropped: {e}");
                }
                last_sent = Some(Instant::now());
            }

            _ = heartbeat.tick() => {
                store.heartbeat();
            }

            _ = sweep.tick() => {
                store.sweep_stale();
            }
        }
    }

    let leave = EventPayload::Leave {
        client_id: store.client_id().to_string(),
    };
    if let Err(e) = broadcaster.publish(&board_id, EventKind::AwarenessLeave, &leave).await {
        log::debug!("Awareness leave for board {board_id} not sent: {e}");
    }
    log::debug!("Awareness sync stopped for board {board_id}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{AwarenessState, AwarenessUpdate, UserIdentity};
    use crate::clock::MonotonicClock;
    use crate::config::CollabConfig;
    use crate::protocol::Envelope;
    use crate::transport::LocalHub;

    const BOARD: &str = "board-1";

    fn awareness_frame(sender: &str, client_id: &str, clock: u64, x: f64) -> Vec<u8> {
        let mut state = AwarenessState::new(client_id, UserIdentity::new(client_id, client_id), 1);
        state.cursor.x = x;
        let payload = EventPayload::Awareness(AwarenessUpdate { clock, state });
        Envelope::new(format!("{sender}-{clock}"), BOARD, EventKind::Awareness, sender, clock, &payload)
            .unwrap()
            .encode()
            .unwrap()
    }

    fn leave_frame(sender: &str, client_id: &str) -> Vec<u8> {
        let payload = EventPayload::Leave {
            client_id: client_id.into(),
        };
        Envelope::new(format!("{sender}-leave"), BOARD, EventKind::AwarenessLeave, sender, 1, &payload)
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_frames_for_another_client_are_dropped() {
        let hub = LocalHub::new(16);
        let config = CollabConfig::for_testing();
        let quality = Arc::new(QualityMonitor::new(config.awareness.min_broadcast_interval()));
        let broadcaster = Arc::new(OperationBroadcaster::new(
            Arc::new(hub.endpoint()),
            "bob",
            Arc::new(MonotonicClock::new()),
        ));
        let store = Arc::new(AwarenessStore::new(
            "bob",
            UserIdentity::new("bob", "Bob"),
            config.awareness.timeout(),
            quality.clone(),
        ));
        let mut sync = AwarenessSync::start(store.clone(), broadcaster.clone(), BOARD, &config.awareness, quality);

        broadcaster.dispatch_frame(&awareness_frame("alice", "alice", 1, 10.0));
        assert_eq!(store.remote_cursors().len(), 1);

        // mallory forges a newer snapshot and a leave for alice
        broadcaster.dispatch_frame(&awareness_frame("mallory", "alice", 99, 666.0));
        broadcaster.dispatch_frame(&leave_frame("mallory", "alice"));
        let cursors = store.remote_cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].client_id, "alice");
        assert_eq!(cursors[0].x, 10.0);

        broadcaster.dispatch_frame(&leave_frame("alice", "alice"));
        assert!(store.remote_cursors().is_empty());

        sync.stop().await;
    }
}
