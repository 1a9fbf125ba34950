//! End-to-end run orchestration against a scripted context host.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use loggest_common::{
    DiagnosticEntry, Error, ErrorRecord, NavEvent, Result, TestParams,
};
use loggest_runner::bridge::BridgeSender;
use loggest_runner::context::{ContextHandle, ContextHost, PermissionGrant, UncaughtSink};
use loggest_runner::controller::{RunController, RunnerConfig};
use loggest_runner::proxy::SharedControlProxy;
use loggest_runner::shims::ShimConfig;
use loggest_runner::trap::{DiagnosticTrap, ErrorSink, TrapHandle};

/// Scripted host: the test keeps the sending halves of every channel
/// and drives the run from outside.
struct ScriptedHost {
    nav_rx: Mutex<Option<mpsc::UnboundedReceiver<NavEvent>>>,
    bridge_slot: Arc<Mutex<Option<BridgeSender>>>,
    grants: Mutex<Vec<(String, String)>>,
    navigated: Arc<Mutex<Vec<String>>>,
    destroyed: Arc<AtomicBool>,
    uncaught: Arc<Mutex<Vec<ErrorRecord>>>,
    fail_grants: bool,
}

impl ScriptedHost {
    fn new(nav_rx: mpsc::UnboundedReceiver<NavEvent>) -> Arc<Self> {
        Arc::new(Self {
            nav_rx: Mutex::new(Some(nav_rx)),
            bridge_slot: Arc::new(Mutex::new(None)),
            grants: Mutex::new(Vec::new()),
            navigated: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(AtomicBool::new(false)),
            uncaught: Arc::new(Mutex::new(Vec::new())),
            fail_grants: false,
        })
    }

    fn failing_grants() -> Arc<Self> {
        let (_, nav_rx) = mpsc::unbounded_channel();
        let mut host = Self::new(nav_rx);
        Arc::get_mut(&mut host).unwrap().fail_grants = true;
        host
    }
}

#[async_trait]
impl ContextHost for ScriptedHost {
    async fn grant_permission(&self, origin: &str, grant: &PermissionGrant) -> Result<()> {
        if self.fail_grants {
            return Err(Error::Context("permission service offline".to_string()));
        }
        self.grants
            .lock()
            .push((origin.to_string(), grant.name.to_string()));
        Ok(())
    }

    async fn create_context(
        &self,
        _origin: &str,
        _shims: &ShimConfig,
    ) -> Result<Box<dyn ContextHandle>> {
        Ok(Box::new(ScriptedHandle {
            nav_rx: self.nav_rx.lock().take(),
            bridge_slot: self.bridge_slot.clone(),
            navigated: self.navigated.clone(),
            destroyed: self.destroyed.clone(),
            uncaught: self.uncaught.clone(),
        }))
    }

    fn take_diagnostics(&self) -> Option<mpsc::UnboundedReceiver<DiagnosticEntry>> {
        None
    }
}

struct ScriptedHandle {
    nav_rx: Option<mpsc::UnboundedReceiver<NavEvent>>,
    bridge_slot: Arc<Mutex<Option<BridgeSender>>>,
    navigated: Arc<Mutex<Vec<String>>>,
    destroyed: Arc<AtomicBool>,
    uncaught: Arc<Mutex<Vec<ErrorRecord>>>,
}

#[async_trait]
impl ContextHandle for ScriptedHandle {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.navigated.lock().push(url.to_string());
        Ok(())
    }

    fn take_navigation_events(&mut self) -> Option<mpsc::UnboundedReceiver<NavEvent>> {
        self.nav_rx.take()
    }

    fn install_bridge(&mut self, bridge: BridgeSender) -> Result<()> {
        *self.bridge_slot.lock() = Some(bridge);
        Ok(())
    }

    fn expose_control(&mut self, _proxy: SharedControlProxy) -> Result<()> {
        Ok(())
    }

    fn uncaught_sink(&self) -> Arc<dyn UncaughtSink> {
        Arc::new(RecordingHook {
            records: self.uncaught.clone(),
        })
    }

    async fn destroy(&mut self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct RecordingHook {
    records: Arc<Mutex<Vec<ErrorRecord>>>,
}

impl UncaughtSink for RecordingHook {
    fn deliver(&self, record: &ErrorRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

struct Fixture {
    host: Arc<ScriptedHost>,
    nav_tx: mpsc::UnboundedSender<NavEvent>,
    diag_tx: mpsc::UnboundedSender<DiagnosticEntry>,
    sink: ErrorSink,
    trap: TrapHandle,
    controller: RunController,
    log_root: TempDir,
}

fn fixture() -> Fixture {
    let (nav_tx, nav_rx) = mpsc::unbounded_channel();
    let host = ScriptedHost::new(nav_rx);

    let (sink, errors_rx) = ErrorSink::channel();
    let (diag_tx, diag_rx) = mpsc::unbounded_channel();
    let trap = DiagnosticTrap::install(diag_rx, sink.clone());

    let log_root = TempDir::new().unwrap();
    let config = RunnerConfig {
        log_root: log_root.path().to_path_buf(),
        shims: ShimConfig::default(),
    };
    let controller = RunController::new(host.clone(), config, sink.clone(), errors_rx);

    Fixture {
        host,
        nav_tx,
        diag_tx,
        sink,
        trap,
        controller,
        log_root,
    }
}

fn js_error(message: &str) -> DiagnosticEntry {
    DiagnosticEntry {
        message: message.to_string(),
        category: "JS".to_string(),
        source_name: "testfile://x/".to_string(),
        line_number: 13,
        warning: false,
        strict: false,
    }
}

async fn wait_for_bridge(slot: &Arc<Mutex<Option<BridgeSender>>>) -> BridgeSender {
    loop {
        if let Some(sender) = slot.lock().clone() {
            return sender;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn run_reaches_ready_only_on_top_level_stop() {
    let fx = fixture();
    let nav_tx = fx.nav_tx.clone();
    let slot = fx.host.bridge_slot.clone();

    let driver = tokio::spawn(async move {
        // Subframe stop and ancillary events must not trigger readiness.
        nav_tx
            .send(NavEvent::StateChange {
                stopped: true,
                top_level: false,
            })
            .unwrap();
        nav_tx.send(NavEvent::LocationChange).unwrap();
        nav_tx.send(NavEvent::ProgressChange).unwrap();
        nav_tx
            .send(NavEvent::StateChange {
                stopped: false,
                top_level: true,
            })
            .unwrap();
        nav_tx
            .send(NavEvent::StateChange {
                stopped: true,
                top_level: true,
            })
            .unwrap();

        let bridge = wait_for_bridge(&slot).await;
        assert!(bridge.deliver(json!({"passed": 4, "failed": 0})));
    });

    let outcome = fx
        .controller
        .execute("test_compose", TestParams::default())
        .await
        .unwrap();
    driver.await.unwrap();

    assert_eq!(outcome.test_id, "test_compose");
    assert_eq!(outcome.result_payload, json!({"passed": 4, "failed": 0}));
    assert!(outcome.errors.is_empty());
    assert!(fx.host.destroyed.load(Ordering::SeqCst));

    // All eight capabilities granted against the isolation origin.
    {
        let grants = fx.host.grants.lock();
        assert_eq!(grants.len(), 8);
        assert!(grants
            .iter()
            .all(|(origin, _)| origin == "testfile://test_compose/"));

        let navigated = fx.host.navigated.lock();
        assert_eq!(navigated.len(), 1);
        assert!(navigated[0].starts_with(
            "testfile://test_compose/test/loggest-runner.html?testName=test_compose"
        ));
    }

    let path = outcome.log_path.unwrap();
    assert_eq!(
        path,
        fx.log_root.path().join("imap").join("test_compose.log")
    );
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("##### LOGGEST-TEST-RUN-BEGIN #####\n"));
    assert!(content.ends_with("\n##### LOGGEST-TEST-RUN-END #####\n"));

    fx.trap.uninstall().await;
}

#[tokio::test]
async fn diagnostics_during_both_wait_phases_are_recorded() {
    let fx = fixture();
    let nav_tx = fx.nav_tx.clone();
    let diag_tx = fx.diag_tx.clone();
    let sink = fx.sink.clone();
    let slot = fx.host.bridge_slot.clone();

    let driver = tokio::spawn(async move {
        while !sink.is_active() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Phase 1: one real error plus two filtered entries.
        diag_tx.send(js_error("early crash")).unwrap();
        diag_tx
            .send(DiagnosticEntry {
                category: "CSS Parser".to_string(),
                ..js_error("ugly stylesheet")
            })
            .unwrap();
        diag_tx
            .send(DiagnosticEntry {
                warning: true,
                ..js_error("deprecation")
            })
            .unwrap();

        nav_tx
            .send(NavEvent::StateChange {
                stopped: true,
                top_level: true,
            })
            .unwrap();

        let bridge = wait_for_bridge(&slot).await;

        // Phase 2: another error before the result lands.
        diag_tx.send(js_error("late crash")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        bridge.deliver(json!({"passed": 0, "failed": 1}));
    });

    let outcome = fx
        .controller
        .execute("test_errors", TestParams::default())
        .await
        .unwrap();
    driver.await.unwrap();

    let messages: Vec<&str> = outcome.errors.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, ["early crash [JS]", "late crash [JS]"]);

    // Both records were also forwarded into the context's own hook.
    {
        let forwarded = fx.host.uncaught.lock();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].line_number, 13);
    }

    fx.trap.uninstall().await;
}

#[tokio::test]
async fn duplicate_result_delivery_is_ignored() {
    let fx = fixture();
    let nav_tx = fx.nav_tx.clone();
    let slot = fx.host.bridge_slot.clone();

    let driver = tokio::spawn(async move {
        nav_tx
            .send(NavEvent::StateChange {
                stopped: true,
                top_level: true,
            })
            .unwrap();
        let bridge = wait_for_bridge(&slot).await;
        assert!(bridge.deliver(json!({"attempt": 1})));
        assert!(!bridge.deliver(json!({"attempt": 2})));
    });

    let outcome = fx
        .controller
        .execute("test_once", TestParams::default())
        .await
        .unwrap();
    driver.await.unwrap();

    assert_eq!(outcome.result_payload, json!({"attempt": 1}));
    let content = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
    assert!(content.contains("{\"attempt\":1}"));

    fx.trap.uninstall().await;
}

#[tokio::test]
async fn log_write_failure_still_completes_the_run() {
    let fx = fixture();
    // Occupy the account-type directory with a plain file.
    std::fs::write(fx.log_root.path().join("imap"), b"in the way").unwrap();

    let nav_tx = fx.nav_tx.clone();
    let slot = fx.host.bridge_slot.clone();
    let driver = tokio::spawn(async move {
        nav_tx
            .send(NavEvent::StateChange {
                stopped: true,
                top_level: true,
            })
            .unwrap();
        let bridge = wait_for_bridge(&slot).await;
        bridge.deliver(json!({"ok": true}));
    });

    let outcome = fx
        .controller
        .execute("test_diskless", TestParams::default())
        .await
        .unwrap();
    driver.await.unwrap();

    assert!(outcome.log_path.is_none());
    assert_eq!(outcome.result_payload, json!({"ok": true}));
    assert!(fx.host.destroyed.load(Ordering::SeqCst));

    fx.trap.uninstall().await;
}

#[tokio::test]
async fn context_loss_before_ready_fails_the_run() {
    let fx = fixture();
    drop(fx.nav_tx);

    let err = fx
        .controller
        .execute("test_gone", TestParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Context(_)));
    // The failed run still tears its context down.
    assert!(fx.host.destroyed.load(Ordering::SeqCst));

    fx.trap.uninstall().await;
}

#[tokio::test]
async fn context_loss_after_ready_is_a_bridge_error() {
    let fx = fixture();
    let nav_tx = fx.nav_tx.clone();
    let slot = fx.host.bridge_slot.clone();

    let driver = tokio::spawn(async move {
        nav_tx
            .send(NavEvent::StateChange {
                stopped: true,
                top_level: true,
            })
            .unwrap();
        // Simulate the context dying: drop the send capability without
        // ever delivering.
        let bridge = wait_for_bridge(&slot).await;
        bridge.abandon();
    });

    let err = fx
        .controller
        .execute("test_hung", TestParams::default())
        .await
        .unwrap_err();
    driver.await.unwrap();
    assert!(matches!(err, Error::Bridge(_)));
    assert!(fx.host.destroyed.load(Ordering::SeqCst));

    fx.trap.uninstall().await;
}

#[tokio::test]
async fn grant_failure_is_a_fatal_configuration_error() {
    let host = ScriptedHost::failing_grants();
    let (sink, errors_rx) = ErrorSink::channel();
    let log_root = TempDir::new().unwrap();
    let config = RunnerConfig {
        log_root: log_root.path().to_path_buf(),
        shims: ShimConfig::default(),
    };

    let controller = RunController::new(host, config, sink, errors_rx);
    let err = controller
        .execute("test_denied", TestParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PermissionGrant { .. }));
    assert!(err.is_configuration());
}
