//! Event bridge: forwards the scheduler's lifecycle events to every viewer.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use conduit_core::HubEvent;

use super::broadcast::BroadcastManager;

/// Drains the emitter and fans out through the [`BroadcastManager`].
pub struct EventBridge {
    rx: broadcast::Receiver<HubEvent>,
    broadcast: Arc<BroadcastManager>,
    cancel: CancellationToken,
}

impl EventBridge {
    /// Bridge `rx` to `broadcast` until `cancel` fires or the sender closes.
    pub fn new(
        rx: broadcast::Receiver<HubEvent>,
        broadcast: Arc<BroadcastManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            broadcast,
            cancel,
        }
    }

    /// Run the bridge loop.
    #[tracing::instrument(skip_all, name = "event_bridge")]
    pub async fn run(mut self) {
        loop {
            let received = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::debug!("event bridge cancelled");
                    break;
                }
                received = self.rx.recv() => received,
            };
            match received {
                Ok(event) => {
                    let _ = self.broadcast.broadcast_all(&event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event bridge lagged, events lost");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bridge: emitter closed, exiting");
                    break;
                }
            }
        }
    }
}
