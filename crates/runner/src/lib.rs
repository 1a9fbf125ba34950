//! Loggest Runner
//!
//! Runs exactly one test module per invocation inside an isolated
//! execution context, observes that context's lifecycle, captures
//! errors the test itself cannot see, waits for the one-shot result
//! handoff and persists it atomically to disk.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Run Controller                           │
//! │   owns the single TestRun, serializes every event source     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  params::resolve()        defaults < env < command line      │
//! │  Launcher::launch()       testfile://<id>/ origin + grants   │
//! │  LifecycleObserver        Created -> Loading -> Ready        │
//! │  ResultBridge             one-shot payload handoff           │
//! │  ControlProxy             whitelisted mock-server surface    │
//! │  LogWriter                sentinel framing, atomic write     │
//! │                                                              │
//! │  DiagnosticTrap ──── appends ErrorRecords concurrently ────▶ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The platform itself sits behind the [`context::ContextHost`] trait;
//! [`process::ProcessHost`] is the subprocess-backed implementation the
//! binary uses, and tests drive the controller with scripted hosts.

pub mod bridge;
pub mod context;
pub mod controller;
pub mod lifecycle;
pub mod logwriter;
pub mod params;
pub mod process;
pub mod proxy;
pub mod shims;
pub mod trap;

pub use bridge::{BridgeReceiver, BridgeSender, ResultBridge};
pub use context::{ContextHandle, ContextHost, Launcher};
pub use controller::{RunController, RunOutcome, RunnerConfig};
pub use loggest_common::{Error, Result};
pub use trap::{DiagnosticTrap, ErrorSink, TrapHandle};
