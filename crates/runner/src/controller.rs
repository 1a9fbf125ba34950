//! Run control
//!
//! The run controller owns the single [`TestRun`] end to end: launch,
//! wait for the context to become ready, install the result bridge and
//! control proxy, wait for the one-shot result, tear down, persist the
//! log and complete. All event sources are serialized through
//! `tokio::select!` on one control flow, so diagnostic records can
//! interleave with every suspension point without locking.
//!
//! There is deliberately no timeout anywhere in this sequence: a run
//! that never becomes ready, or never delivers a result, suspends
//! indefinitely.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use loggest_common::{Error, ErrorRecord, LogPayload, Result, RunState, TestParams};

use crate::bridge::ResultBridge;
use crate::context::{ContextHandle, ContextHost, Launcher};
use crate::lifecycle::LifecycleObserver;
use crate::logwriter::LogWriter;
use crate::proxy::{ControlProxy, TeardownList};
use crate::shims::ShimConfig;
use crate::trap::ErrorSink;

/// Static configuration for one runner invocation.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root of the persisted log tree.
    pub log_root: PathBuf,
    /// Platform shims applied to the created context.
    pub shims: ShimConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("test-logs"),
            shims: ShimConfig::default(),
        }
    }
}

/// State of the one active test run.
pub struct TestRun {
    pub test_id: String,
    pub params: TestParams,
    /// Append-only; the diagnostic trap feeds this at any time while
    /// the run is active.
    pub errors: Vec<ErrorRecord>,
    /// Present only after the result bridge fired.
    pub result_payload: Option<LogPayload>,
    observer: LifecycleObserver,
}

impl TestRun {
    fn new(test_id: &str, params: TestParams) -> Self {
        Self {
            test_id: test_id.to_string(),
            params,
            errors: Vec::new(),
            result_payload: None,
            observer: LifecycleObserver::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.observer.state()
    }

    fn absorb(&mut self, record: ErrorRecord) {
        debug!(category = %record.category, "error recorded against run");
        self.errors.push(record);
    }
}

/// Completed-run summary handed back to the binary.
#[derive(Debug)]
pub struct RunOutcome {
    pub test_id: String,
    pub params: TestParams,
    pub errors: Vec<ErrorRecord>,
    pub result_payload: LogPayload,
    /// `None` when the log write failed (log loss is non-fatal).
    pub log_path: Option<PathBuf>,
}

/// Sequences one test run. Exactly one controller exists per process
/// invocation; [`RunController::execute`] consumes it, and its future
/// is the run's completion signal: it resolves only after the log
/// write attempt has finished.
pub struct RunController {
    config: RunnerConfig,
    host: Arc<dyn ContextHost>,
    sink: ErrorSink,
    errors_rx: mpsc::UnboundedReceiver<ErrorRecord>,
}

impl RunController {
    pub fn new(
        host: Arc<dyn ContextHost>,
        config: RunnerConfig,
        sink: ErrorSink,
        errors_rx: mpsc::UnboundedReceiver<ErrorRecord>,
    ) -> Self {
        Self {
            config,
            host,
            sink,
            errors_rx,
        }
    }

    /// Run the test module to completion.
    pub async fn execute(mut self, test_id: &str, params: TestParams) -> Result<RunOutcome> {
        info!(test_id, account_type = %params.account_type, "running test module");
        let mut run = TestRun::new(test_id, params.clone());

        // Configuration errors (grant or navigation failure) propagate
        // before any run state is observable.
        let launcher = Launcher::new(self.host.clone(), self.config.shims.clone());
        let mut handle = launcher.launch(test_id, &params).await?;
        run.observer.navigation_started()?;

        self.sink.activate();
        self.sink.set_forward(handle.uncaught_sink());

        let mut nav = handle
            .take_navigation_events()
            .ok_or_else(|| Error::Context("navigation events already taken".to_string()))?;

        // Phase 1: wait for the top-level load to stop, absorbing
        // diagnostic records as they arrive.
        loop {
            tokio::select! {
                event = nav.recv() => match event {
                    Some(event) => {
                        if run.observer.observe(event) {
                            break;
                        }
                    }
                    None => {
                        return Err(self
                            .abort(
                                handle,
                                Error::Context(
                                    "context went away before becoming ready".to_string(),
                                ),
                            )
                            .await);
                    }
                },
                record = self.errors_rx.recv() => {
                    if let Some(record) = record {
                        run.absorb(record);
                    }
                }
            }
        }

        // Ready: install the bridge and the control proxy, register
        // the proxy for teardown. This happens exactly once.
        let (bridge_tx, mut bridge_rx) = ResultBridge::channel();
        handle.install_bridge(bridge_tx)?;

        let mut teardowns = TeardownList::new();
        let proxy = ControlProxy::shared();
        handle.expose_control(proxy.clone())?;
        teardowns.register(Box::new(proxy));
        info!("result bridge installed, waiting for test completion");

        // Phase 2: wait for the one-shot result.
        let payload = loop {
            tokio::select! {
                result = &mut bridge_rx => match result {
                    Ok(payload) => break payload,
                    Err(_) => {
                        drop(nav);
                        return Err(self
                            .abort(
                                handle,
                                Error::Bridge(
                                    "context went away without delivering a result".to_string(),
                                ),
                            )
                            .await);
                    }
                },
                record = self.errors_rx.recv() => {
                    if let Some(record) = record {
                        run.absorb(record);
                    }
                }
            }
        };

        // Bridge fired: detach the per-run observers first, then run
        // every registered teardown once, in registration order.
        self.sink.deactivate();
        self.sink.clear_forward();
        drop(nav);
        teardowns.run();

        run.result_payload = Some(payload.clone());
        run.observer.finish()?;

        // Drain records that were queued before deactivation.
        while let Ok(record) = self.errors_rx.try_recv() {
            run.absorb(record);
        }

        // Persist; a failed write is reported and abandoned, the run
        // still completes.
        let writer = LogWriter::new(&self.config.log_root);
        let log_path = match writer.write(&params.account_type, test_id, &payload).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("error trying to write test log to disk: {e}");
                None
            }
        };

        if let Err(e) = handle.destroy().await {
            warn!("context teardown failed: {e}");
        }

        info!(
            errors = run.errors.len(),
            state = %run.state(),
            "test run completed"
        );

        Ok(RunOutcome {
            test_id: run.test_id,
            params: run.params,
            errors: run.errors,
            result_payload: payload,
            log_path,
        })
    }

    /// Failed-run exit: detach the per-run observers and destroy the
    /// context through the same teardown as a completed run.
    async fn abort(&self, mut handle: Box<dyn ContextHandle>, err: Error) -> Error {
        self.sink.deactivate();
        self.sink.clear_forward();
        if let Err(e) = handle.destroy().await {
            warn!("context teardown failed: {e}");
        }
        err
    }
}
