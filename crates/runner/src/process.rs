//! Process-backed execution host
//!
//! Realizes the [`ContextHost`] seam by running each isolated context
//! as a child process: a per-origin profile directory keeps storage
//! apart, capability grants and shim switches travel as `LOGGEST_*`
//! environment variables, and the context talks back over a
//! line-oriented pipe protocol:
//!
//! ```text
//! stdout  ##### LOGGEST-RUNNER-READY #####     top-level load stopped
//! stdout  LOGGEST-RESULT <json>                result bridge delivery
//! stdout  LOGGEST-CONTROL <json>               control proxy invocation
//! stdin   LOGGEST-CONTROL-RESULT <json>        control proxy answer
//! stdin   LOGGEST-UNCAUGHT <json>              forwarded error record
//! stderr  <json DiagnosticEntry> | free text   diagnostic stream
//! ```
//!
//! Teardown sends SIGTERM, waits half a second, then kills.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use loggest_common::{DiagnosticEntry, Error, ErrorRecord, NavEvent, Result};

use crate::bridge::BridgeSender;
use crate::context::{ContextHandle, ContextHost, PermissionGrant, UncaughtSink};
use crate::proxy::SharedControlProxy;
use crate::shims::ShimConfig;

/// Emitted by the context once its top-level load has stopped.
pub const READY_LINE: &str = "##### LOGGEST-RUNNER-READY #####";

/// Prefix of a result bridge delivery line.
pub const RESULT_PREFIX: &str = "LOGGEST-RESULT ";

/// Prefix of a control proxy invocation line.
pub const CONTROL_PREFIX: &str = "LOGGEST-CONTROL ";

/// Prefix of a control proxy answer line (host to context).
pub const CONTROL_RESULT_PREFIX: &str = "LOGGEST-CONTROL-RESULT ";

/// Prefix of a forwarded error record line (host to context).
pub const UNCAUGHT_PREFIX: &str = "LOGGEST-UNCAUGHT ";

/// Configuration for spawning context processes.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Executable hosting the context (receives the navigation URL as
    /// its final argument).
    pub command: PathBuf,
    /// Arguments placed before the navigation URL.
    pub args: Vec<String>,
    /// Root under which per-origin profile directories are created.
    pub profile_root: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("loggest-context"),
            args: Vec::new(),
            profile_root: PathBuf::from("test-profile"),
        }
    }
}

/// Subprocess-backed context host.
pub struct ProcessHost {
    config: HostConfig,
    diag_tx: mpsc::UnboundedSender<DiagnosticEntry>,
    diag_rx: Mutex<Option<mpsc::UnboundedReceiver<DiagnosticEntry>>>,
    grants: Mutex<HashMap<String, Vec<String>>>,
}

impl ProcessHost {
    pub fn new(config: HostConfig) -> Self {
        let (diag_tx, diag_rx) = mpsc::unbounded_channel();
        Self {
            config,
            diag_tx,
            diag_rx: Mutex::new(Some(diag_rx)),
            grants: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ContextHost for ProcessHost {
    async fn grant_permission(&self, origin: &str, grant: &PermissionGrant) -> Result<()> {
        self.grants
            .lock()
            .entry(origin.to_string())
            .or_default()
            .push(format!("{}:{}", grant.name, grant.access.as_str()));
        Ok(())
    }

    async fn create_context(
        &self,
        origin: &str,
        shims: &ShimConfig,
    ) -> Result<Box<dyn ContextHandle>> {
        let profile_dir = self.config.profile_root.join(origin_dir_name(origin));
        tokio::fs::create_dir_all(&profile_dir).await?;
        if shims.redirect_device_storage {
            tokio::fs::create_dir_all(profile_dir.join("device-storage")).await?;
        }

        let permissions = self
            .grants
            .lock()
            .get(origin)
            .map(|list| list.join(","))
            .unwrap_or_default();

        debug!(origin, profile = %profile_dir.display(), "context created");
        Ok(Box::new(ProcessContext {
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            origin: origin.to_string(),
            profile_dir,
            permissions,
            shims: shims.clone(),
            diag_tx: self.diag_tx.clone(),
            child: None,
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            nav_rx: None,
            bridge: Arc::new(Mutex::new(None)),
            control: Arc::new(Mutex::new(None)),
        }))
    }

    fn take_diagnostics(&self) -> Option<mpsc::UnboundedReceiver<DiagnosticEntry>> {
        self.diag_rx.lock().take()
    }
}

/// One spawned context process.
pub struct ProcessContext {
    command: PathBuf,
    args: Vec<String>,
    origin: String,
    profile_dir: PathBuf,
    permissions: String,
    shims: ShimConfig,
    diag_tx: mpsc::UnboundedSender<DiagnosticEntry>,
    child: Option<Child>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    nav_rx: Option<mpsc::UnboundedReceiver<NavEvent>>,
    bridge: Arc<Mutex<Option<BridgeSender>>>,
    control: Arc<Mutex<Option<SharedControlProxy>>>,
}

#[async_trait]
impl ContextHandle for ProcessContext {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(url)
            .env("LOGGEST_ORIGIN", &self.origin)
            .env("LOGGEST_PROFILE_DIR", &self.profile_dir)
            .env("LOGGEST_PERMISSIONS", &self.permissions)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in self.shims.env_vars() {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Context(format!("failed to spawn {}: {e}", self.command.display()))
        })?;

        let (nav_tx, nav_rx) = mpsc::unbounded_channel();
        self.nav_rx = Some(nav_rx);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Context("context stdout pipe missing".to_string()))?;
        tokio::spawn(read_stdout(
            stdout,
            nav_tx,
            self.bridge.clone(),
            self.control.clone(),
            self.stdin.clone(),
        ));

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Context("context stderr pipe missing".to_string()))?;
        tokio::spawn(read_stderr(stderr, self.diag_tx.clone(), self.origin.clone()));

        *self.stdin.lock().await = child.stdin.take();
        self.child = Some(child);
        Ok(())
    }

    fn take_navigation_events(&mut self) -> Option<mpsc::UnboundedReceiver<NavEvent>> {
        self.nav_rx.take()
    }

    fn install_bridge(&mut self, bridge: BridgeSender) -> Result<()> {
        *self.bridge.lock() = Some(bridge);
        Ok(())
    }

    fn expose_control(&mut self, proxy: SharedControlProxy) -> Result<()> {
        *self.control.lock() = Some(proxy);
        Ok(())
    }

    fn uncaught_sink(&self) -> Arc<dyn UncaughtSink> {
        Arc::new(ProcessUncaughtSink {
            stdin: self.stdin.clone(),
        })
    }

    async fn destroy(&mut self) -> Result<()> {
        if let Some(child) = self.child.take() {
            terminate(child).await;
        }
        Ok(())
    }
}

/// Forwards error records to the context over its stdin.
struct ProcessUncaughtSink {
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
}

impl UncaughtSink for ProcessUncaughtSink {
    fn deliver(&self, record: &ErrorRecord) -> Result<()> {
        let line = format!("{}{}\n", UNCAUGHT_PREFIX, serde_json::to_string(record)?);
        let stdin = self.stdin.clone();
        // Best-effort: the write happens off the trap's control flow.
        tokio::spawn(async move {
            let mut guard = stdin.lock().await;
            if let Some(pipe) = guard.as_mut() {
                if let Err(e) = pipe.write_all(line.as_bytes()).await {
                    warn!("uncaught forward write failed: {e}");
                }
            }
        });
        Ok(())
    }
}

async fn read_stdout(
    stdout: tokio::process::ChildStdout,
    nav_tx: mpsc::UnboundedSender<NavEvent>,
    bridge: Arc<Mutex<Option<BridgeSender>>>,
    control: Arc<Mutex<Option<SharedControlProxy>>>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line == READY_LINE {
            let _ = nav_tx.send(NavEvent::StateChange {
                stopped: true,
                top_level: true,
            });
        } else if let Some(json) = line.strip_prefix(RESULT_PREFIX) {
            match serde_json::from_str(json) {
                Ok(payload) => {
                    let sender = bridge.lock().clone();
                    match sender {
                        Some(sender) => {
                            sender.deliver(payload);
                        }
                        None => warn!("result arrived before bridge installation, dropped"),
                    }
                }
                Err(e) => warn!("malformed result line: {e}"),
            }
        } else if let Some(json) = line.strip_prefix(CONTROL_PREFIX) {
            let answer = dispatch_control(&control, json);
            let reply = format!("{}{}\n", CONTROL_RESULT_PREFIX, answer);
            let mut guard = stdin.lock().await;
            if let Some(pipe) = guard.as_mut() {
                if let Err(e) = pipe.write_all(reply.as_bytes()).await {
                    warn!("control answer write failed: {e}");
                }
            }
        } else {
            debug!("context stdout: {line}");
        }
    }
}

fn dispatch_control(control: &Mutex<Option<SharedControlProxy>>, json: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ControlCall {
        op: String,
        #[serde(default)]
        args: serde_json::Value,
    }

    let call: ControlCall = match serde_json::from_str(json) {
        Ok(call) => call,
        Err(e) => {
            return serde_json::json!({ "error": format!("malformed control call: {e}") })
                .to_string()
        }
    };
    let proxy = control.lock().clone();
    let outcome = match proxy {
        Some(proxy) => proxy.lock().invoke(&call.op, &call.args),
        None => Err(Error::ControlProxy("control proxy not exposed".to_string())),
    };
    match outcome {
        Ok(value) => serde_json::json!({ "ok": value }).to_string(),
        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
    }
}

async fn read_stderr(
    stderr: tokio::process::ChildStderr,
    diag_tx: mpsc::UnboundedSender<DiagnosticEntry>,
    origin: String,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let entry = serde_json::from_str::<DiagnosticEntry>(&line).unwrap_or_else(|_| {
            DiagnosticEntry {
                message: line.clone(),
                category: "runtime".to_string(),
                source_name: origin.clone(),
                line_number: 0,
                warning: false,
                strict: false,
            }
        });
        let _ = diag_tx.send(entry);
    }
}

async fn terminate(mut child: Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Directory name for one origin's profile.
fn origin_dir_name(origin: &str) -> String {
    let bare = origin.split("://").nth(1).unwrap_or(origin);
    bare.trim_end_matches('/').replace('/', "_")
}
