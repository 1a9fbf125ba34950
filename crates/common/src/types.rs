//! Core types for the loggest runner

use serde::{Deserialize, Serialize};

/// Structured value handed across the result bridge.
///
/// The orchestrator treats the test module's result schema as opaque;
/// it only serializes it into the log file.
pub type LogPayload = serde_json::Value;

/// Immutable per-invocation test parameters.
///
/// Built once by the parameter resolver before any run starts and never
/// mutated afterward. Field names on the wire match what the runner
/// page inside the isolated context expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestParams {
    /// Display name; has no override source.
    pub name: String,
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    pub password: String,
    /// Account type, also the log subdirectory. Overriding it alone
    /// does not disqualify "default" status.
    #[serde(rename = "type")]
    pub account_type: String,
    pub slow: bool,
    /// True only while no field other than `type` has been overridden.
    #[serde(rename = "defaultArgs")]
    pub used_defaults: bool,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            name: "Baron von Testendude".to_string(),
            email_address: "testy@localhost".to_string(),
            password: "testy".to_string(),
            account_type: "imap".to_string(),
            slow: false,
            used_defaults: true,
        }
    }
}

/// One raw entry from the platform's diagnostic/log stream, before the
/// trap's filtering policy has been applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub message: String,
    pub category: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub line_number: u32,
    #[serde(default)]
    pub warning: bool,
    #[serde(default)]
    pub strict: bool,
}

/// Normalized representation of one captured diagnostic or
/// uncaught-exception event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub category: String,
    pub source_name: String,
    pub line_number: u32,
    pub is_warning: bool,
    pub is_strict: bool,
}

impl ErrorRecord {
    /// Normalize a diagnostic entry. The category rides along in the
    /// message so the in-context error trapper sees it too.
    pub fn from_diagnostic(entry: &DiagnosticEntry) -> Self {
        Self {
            message: format!("{} [{}]", entry.message, entry.category),
            category: entry.category.clone(),
            source_name: entry.source_name.clone(),
            line_number: entry.line_number,
            is_warning: entry.warning,
            is_strict: entry.strict,
        }
    }
}

/// Navigation/progress notification from the execution context.
///
/// Mirrors the host's progress-listener callbacks; the lifecycle
/// observer only acts on a stopped top-level state change, everything
/// else is noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavEvent {
    StateChange { stopped: bool, top_level: bool },
    LocationChange,
    ProgressChange,
    SecurityChange,
    StatusChange,
}

/// Lifecycle state of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Context exists, navigation not started.
    Created,
    /// Navigation started, waiting for the top-level stop.
    Loading,
    /// Bridge and control proxy installed, waiting for the result.
    Ready,
    /// Result received and log write attempted. Terminal.
    Finished,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Created
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Created => "created",
            RunState::Loading => "loading",
            RunState::Ready => "ready",
            RunState::Finished => "finished",
        };
        f.write_str(s)
    }
}
