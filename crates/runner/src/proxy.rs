//! Auxiliary control proxy
//!
//! A synchronous control surface exposed into the isolated context so
//! a test can stand up and drive a mock backing server (create it, add
//! folder containers, populate them, attach request/response loggers).
//! Only the whitelisted operation names are reachable from the
//! context; everything else on the proxy stays host-private.
//!
//! For time/simplicity reasons this is a synchronous API rather than an
//! async proxying layer, matching how the tests consume it.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{debug, error, warn};

use loggest_common::{Error, Result};

/// Operation names reachable from inside the isolated context.
pub const CONTROL_OPS: &[&str] = &[
    "createServer",
    "addFolder",
    "addMessageToFolder",
    "addMessagesToFolder",
    "useLoggers",
];

/// Shared handle under which the proxy is exposed into the context and
/// simultaneously registered for teardown.
pub type SharedControlProxy = Arc<Mutex<ControlProxy>>;

/// Host-controlled mock services for one run.
pub struct ControlProxy {
    server: Option<MockBackingServer>,
}

impl ControlProxy {
    pub fn new() -> Self {
        Self { server: None }
    }

    pub fn shared() -> SharedControlProxy {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Dispatch one operation invoked from the isolated context.
    /// Non-whitelisted names are rejected before any dispatch happens.
    pub fn invoke(&mut self, op: &str, args: &Value) -> Result<Value> {
        if !CONTROL_OPS.contains(&op) {
            return Err(Error::ControlOpDenied(op.to_string()));
        }
        debug!(op, "control proxy invocation");
        match op {
            "createServer" => self.create_server(args),
            "addFolder" => self.add_folder(args),
            "addMessageToFolder" => self.add_message_to_folder(args),
            "addMessagesToFolder" => self.add_messages_to_folder(args),
            "useLoggers" => self.use_loggers(args),
            _ => unreachable!("whitelisted op without dispatch arm"),
        }
    }

    fn server_mut(&mut self) -> Result<&mut MockBackingServer> {
        self.server
            .as_mut()
            .ok_or_else(|| Error::ControlProxy("no backing server created".to_string()))
    }

    fn create_server(&mut self, args: &Value) -> Result<Value> {
        let server = MockBackingServer::start(args.get("useDate").cloned())?;
        let port = server.port();
        self.server = Some(server);
        Ok(json!({ "id": "only", "port": port }))
    }

    fn add_folder(&mut self, args: &Value) -> Result<Value> {
        let name = required_str(args, "name")?;
        let kind = args
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("mail")
            .to_string();
        let parent_id = args
            .get("parentId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = self.server_mut()?.add_folder(name, kind, parent_id);
        Ok(Value::String(id))
    }

    fn add_message_to_folder(&mut self, args: &Value) -> Result<Value> {
        let folder_id = required_str(args, "folderId")?;
        let message = args
            .get("message")
            .cloned()
            .ok_or_else(|| Error::ControlProxy("missing message definition".to_string()))?;
        self.server_mut()?.add_message(&folder_id, message)?;
        Ok(Value::Null)
    }

    fn add_messages_to_folder(&mut self, args: &Value) -> Result<Value> {
        let folder_id = required_str(args, "folderId")?;
        // Bulk add answers success without applying anything; single
        // message add is the supported population path.
        self.server_mut()?.folder(&folder_id)?;
        Ok(Value::Null)
    }

    fn use_loggers(&mut self, args: &Value) -> Result<Value> {
        let flag = |key: &str| args.get(key).map(|v| !v.is_null()).unwrap_or(false);
        let loggers = LoggerFlags {
            request: flag("request"),
            request_body: flag("requestBody"),
            response: flag("response"),
            response_error: flag("responseError"),
        };
        self.server_mut()?.loggers = loggers;
        Ok(Value::Null)
    }

    /// Stop the backing server if one is running. Shutdown problems
    /// are reported, never propagated.
    pub fn kill_server(&mut self) {
        if let Some(server) = self.server.take() {
            if let Err(e) = server.stop() {
                error!("problem shutting down mock backing server: {e}");
            }
        }
    }
}

impl Default for ControlProxy {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::ControlProxy(format!("missing argument: {key}")))
}

/// In-process mock backing server. Binds a real local port so the
/// address handed to the test is genuinely reserved for the run.
pub struct MockBackingServer {
    listener: TcpListener,
    port: u16,
    folders: HashMap<String, MockFolder>,
    next_folder: u32,
    seeded_date: Option<Value>,
    loggers: LoggerFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggerFlags {
    pub request: bool,
    pub request_body: bool,
    pub response: bool,
    pub response_error: bool,
}

/// Folder-like container on the mock server.
#[derive(Debug, Clone)]
pub struct MockFolder {
    pub name: String,
    pub kind: String,
    pub parent_id: Option<String>,
    pub messages: Vec<Value>,
}

impl MockBackingServer {
    fn start(seeded_date: Option<Value>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| Error::ControlProxy(format!("port reservation failed: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::ControlProxy(format!("port reservation failed: {e}")))?
            .port();
        debug!(port, "mock backing server started");
        Ok(Self {
            listener,
            port,
            folders: HashMap::new(),
            next_folder: 0,
            seeded_date,
            loggers: LoggerFlags::default(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn seeded_date(&self) -> Option<&Value> {
        self.seeded_date.as_ref()
    }

    pub fn folder(&self, id: &str) -> Result<&MockFolder> {
        self.folders
            .get(id)
            .ok_or_else(|| Error::ControlProxy(format!("no such folder: {id}")))
    }

    fn add_folder(&mut self, name: String, kind: String, parent_id: Option<String>) -> String {
        self.next_folder += 1;
        let id = format!("folder{}", self.next_folder);
        self.folders.insert(
            id.clone(),
            MockFolder {
                name,
                kind,
                parent_id,
                messages: Vec::new(),
            },
        );
        id
    }

    fn add_message(&mut self, folder_id: &str, message: Value) -> Result<()> {
        let folder = self
            .folders
            .get_mut(folder_id)
            .ok_or_else(|| Error::ControlProxy(format!("no such folder: {folder_id}")))?;
        folder.messages.push(message);
        Ok(())
    }

    fn stop(self) -> Result<()> {
        // Dropping the listener releases the reservation.
        drop(self.listener);
        Ok(())
    }
}

/// Something registered during `Ready` that must be torn down when the
/// bridge fires.
pub trait Teardown: Send {
    fn cleanup(&mut self) -> Result<()>;
}

impl Teardown for SharedControlProxy {
    fn cleanup(&mut self) -> Result<()> {
        self.lock().kill_server();
        Ok(())
    }
}

/// Per-run teardown registrations, executed in registration order,
/// each exactly once. A failing cleanup is logged and does not abort
/// the remaining ones.
#[derive(Default)]
pub struct TeardownList {
    items: Vec<Box<dyn Teardown>>,
}

impl TeardownList {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn register(&mut self, item: Box<dyn Teardown>) {
        self.items.push(item);
    }

    pub fn run(&mut self) {
        for mut item in self.items.drain(..) {
            if let Err(e) = item.cleanup() {
                warn!("teardown failed: {e}");
            }
        }
    }
}
