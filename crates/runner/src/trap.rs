//! Diagnostic trap
//!
//! Subscribes to the host's global diagnostic stream so that errors the
//! test module itself never sees (style-engine errors, unchecked
//! platform warnings surfacing as errors) are still recorded against
//! the active run. Installed once per process at startup; uninstalled
//! on the process-quit signal.
//!
//! Filtering policy, applied before anything is recorded: entries in
//! the CSS parser category are discarded, as are entries flagged
//! warning or strict. Everything else becomes an [`ErrorRecord`].
//!
//! A failure while processing one entry is contained at the trap
//! boundary and reported through the last-resort tracing channel; it
//! never terminates the trap and never crashes the host.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use loggest_common::{DiagnosticEntry, ErrorRecord, Result};

use crate::context::UncaughtSink;

/// Diagnostic category discarded wholesale.
pub const CSS_PARSER_CATEGORY: &str = "CSS Parser";

/// Destination for normalized error records.
///
/// Cloneable handle shared between the trap task and the run
/// controller. The controller activates it when a run starts and
/// deactivates it when the bridge fires; records arriving while no run
/// is active are dropped. The forward slot points at the current
/// context's uncaught-exception hook, when one exists.
#[derive(Clone)]
pub struct ErrorSink {
    active: Arc<AtomicBool>,
    forward: Arc<Mutex<Option<Arc<dyn UncaughtSink>>>>,
    tx: mpsc::UnboundedSender<ErrorRecord>,
}

impl ErrorSink {
    /// Create a sink and the receiving side the controller drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ErrorRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                active: Arc::new(AtomicBool::new(false)),
                forward: Arc::new(Mutex::new(None)),
                tx,
            },
            rx,
        )
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Point the forward slot at the current context's uncaught hook.
    pub fn set_forward(&self, sink: Arc<dyn UncaughtSink>) {
        *self.forward.lock() = Some(sink);
    }

    /// Detach the forward target (part of per-run observer teardown).
    pub fn clear_forward(&self) {
        *self.forward.lock() = None;
    }

    fn forward_target(&self) -> Option<Arc<dyn UncaughtSink>> {
        self.forward.lock().clone()
    }

    fn record(&self, record: ErrorRecord) {
        // Receiver gone means the run already completed; nothing to do.
        let _ = self.tx.send(record);
    }
}

/// The installed trap, subscribed to the host diagnostic stream.
pub struct DiagnosticTrap;

impl DiagnosticTrap {
    /// Subscribe to `stream` and start processing. Returns the
    /// subscription handle used to uninstall on process quit.
    pub fn install(
        stream: mpsc::UnboundedReceiver<DiagnosticEntry>,
        sink: ErrorSink,
    ) -> TrapHandle {
        let (quit_tx, quit_rx) = oneshot::channel();
        let task = tokio::spawn(Self::run(stream, sink, quit_rx));
        TrapHandle {
            quit: Some(quit_tx),
            task,
        }
    }

    async fn run(
        mut stream: mpsc::UnboundedReceiver<DiagnosticEntry>,
        sink: ErrorSink,
        mut quit: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut quit => {
                    // Entries delivered before the quit signal are
                    // still recorded, not discarded.
                    Self::drain(&mut stream, &sink);
                    break;
                }
                entry = stream.recv() => match entry {
                    Some(entry) => {
                        if let Err(e) = Self::process(&sink, entry) {
                            // Last-resort channel: error-handling code
                            // must never take the host down.
                            error!("diagnostic trap self-error: {e}");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("diagnostic trap uninstalled");
    }

    fn drain(stream: &mut mpsc::UnboundedReceiver<DiagnosticEntry>, sink: &ErrorSink) {
        while let Ok(entry) = stream.try_recv() {
            if let Err(e) = Self::process(sink, entry) {
                error!("diagnostic trap self-error: {e}");
            }
        }
    }

    fn process(sink: &ErrorSink, entry: DiagnosticEntry) -> Result<()> {
        if entry.category == CSS_PARSER_CATEGORY {
            return Ok(());
        }
        if entry.warning || entry.strict {
            return Ok(());
        }

        let record = ErrorRecord::from_diagnostic(&entry);
        error!(
            source = %record.source_name,
            line = record.line_number,
            "{}",
            record.message
        );

        if sink.is_active() {
            sink.record(record.clone());
        }

        // Best-effort: hand the record to the context's own uncaught
        // hook so in-page tooling sees it too.
        if let Some(target) = sink.forward_target() {
            if let Err(e) = target.deliver(&record) {
                warn!("forward to uncaught hook failed: {e}");
            }
        }

        Ok(())
    }
}

/// Subscription handle; dropping it without `uninstall` leaves the
/// task draining the stream until the host side closes it.
pub struct TrapHandle {
    quit: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TrapHandle {
    /// Unhook from the diagnostic stream (process-quit signal).
    pub async fn uninstall(mut self) {
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
        let _ = self.task.await;
    }
}
