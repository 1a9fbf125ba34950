//! Result bridge
//!
//! The one-shot message channel by which the isolated context hands its
//! final structured payload back to the orchestrator. The sender is
//! installed into the context only once the lifecycle observer reaches
//! `Ready`, which is the trusted installation point; nothing else can
//! reach it.

use loggest_common::LogPayload;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// One-shot payload channel between the context and the controller.
pub struct ResultBridge;

impl ResultBridge {
    /// Create a connected sender/receiver pair for one run.
    pub fn channel() -> (BridgeSender, BridgeReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            BridgeSender {
                inner: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }
}

/// Capability handed into the isolated context. Cloneable so the host
/// can hold it alongside the controller's teardown bookkeeping; the
/// underlying channel still fires at most once.
#[derive(Clone)]
pub struct BridgeSender {
    inner: Arc<Mutex<Option<oneshot::Sender<LogPayload>>>>,
}

/// Controller-side completion of the bridge.
pub type BridgeReceiver = oneshot::Receiver<LogPayload>;

impl BridgeSender {
    /// Deliver the final payload. The first delivery wins; any later
    /// one is an idempotent no-op (the duplicate is not reported as an
    /// error, matching the bridge protocol).
    pub fn deliver(&self, payload: LogPayload) -> bool {
        let sender = self.inner.lock().take();
        match sender {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    debug!("bridge receiver already gone, payload dropped");
                    return false;
                }
                true
            }
            None => {
                debug!("duplicate bridge delivery ignored");
                false
            }
        }
    }

    /// Drop the send capability without delivering. The receiver
    /// observes this as the context going away mid-run.
    pub fn abandon(&self) {
        self.inner.lock().take();
    }

    /// True once a payload has been delivered (or the channel spent).
    pub fn is_spent(&self) -> bool {
        self.inner.lock().is_none()
    }
}
