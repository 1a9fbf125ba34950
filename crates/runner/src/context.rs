//! Test context launching and the platform seam
//!
//! Every test module runs under a distinct `testfile://<test_id>/`
//! origin so persisted state (databases and the like) from different
//! test files never collides and survives the run for inspection. The
//! launcher grants the fixed capability set to that origin before
//! navigation begins and then starts loading the runner page with the
//! test name and serialized parameters as query arguments.
//!
//! The platform itself is dependency-injected through [`ContextHost`] /
//! [`ContextHandle`]; the orchestration core never reaches into ambient
//! platform registries.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use loggest_common::{DiagnosticEntry, Error, ErrorRecord, NavEvent, Result, TestParams};

use crate::bridge::BridgeSender;
use crate::proxy::SharedControlProxy;
use crate::shims::ShimConfig;

/// Fixed scheme of the per-test isolation origin.
pub const ISOLATION_SCHEME: &str = "testfile";

/// Page loaded into the context; bootstraps the test module and the
/// result-bridge client side.
pub const RUNNER_PAGE: &str = "test/loggest-runner.html";

/// Access level attached to a capability grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Grant,
    ReadCreate,
    ReadOnly,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Grant => "grant",
            Access::ReadCreate => "readcreate",
            Access::ReadOnly => "readonly",
        }
    }
}

/// One named capability granted to the isolation origin.
#[derive(Debug, Clone, Copy)]
pub struct PermissionGrant {
    pub name: &'static str,
    pub access: Access,
}

/// Capability set required by the application under test, granted to
/// the origin before navigation. Mirrors the app manifest.
pub const EMAIL_PERMISSIONS: &[PermissionGrant] = &[
    PermissionGrant {
        name: "alarms",
        access: Access::Grant,
    },
    PermissionGrant {
        name: "audio-channel-notification",
        access: Access::Grant,
    },
    PermissionGrant {
        name: "contacts",
        access: Access::ReadCreate,
    },
    PermissionGrant {
        name: "desktop-notification",
        access: Access::Grant,
    },
    PermissionGrant {
        name: "device-storage:sdcard",
        access: Access::ReadCreate,
    },
    PermissionGrant {
        name: "systemXHR",
        access: Access::Grant,
    },
    PermissionGrant {
        name: "settings",
        access: Access::ReadOnly,
    },
    PermissionGrant {
        name: "tcp-socket",
        access: Access::Grant,
    },
];

// encodeURIComponent-equivalent set: everything but alphanumerics and
// - _ . ! ~ * ' ( ) gets percent-encoded.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// The unique isolation origin for one test file.
pub fn isolation_origin(test_id: &str) -> String {
    format!("{ISOLATION_SCHEME}://{test_id}/")
}

/// Build a query string with both keys and values percent-encoded.
pub fn build_query(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(key, URI_COMPONENT),
                utf8_percent_encode(value, URI_COMPONENT)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Navigation target for one test run: the runner page under the
/// test's own origin, with the test name and serialized params.
pub fn runner_url(test_id: &str, params: &TestParams) -> Result<String> {
    let serialized = serde_json::to_string(params)?;
    let query = build_query(&[("testName", test_id), ("testParams", &serialized)]);
    Ok(format!(
        "{}{}?{}",
        isolation_origin(test_id),
        RUNNER_PAGE,
        query
    ))
}

/// Best-effort delivery of captured error records into the isolated
/// context's own uncaught-exception hook.
pub trait UncaughtSink: Send + Sync {
    fn deliver(&self, record: &ErrorRecord) -> Result<()>;
}

/// The platform side of context creation.
#[async_trait]
pub trait ContextHost: Send + Sync {
    /// Grant one capability to an origin. Must complete before
    /// navigation; failure is a fatal configuration error.
    async fn grant_permission(&self, origin: &str, grant: &PermissionGrant) -> Result<()>;

    /// Create a fresh isolated context bound to `origin` with the
    /// requested platform shims applied.
    async fn create_context(
        &self,
        origin: &str,
        shims: &ShimConfig,
    ) -> Result<Box<dyn ContextHandle>>;

    /// Take the host-global diagnostic stream. Yields entries from the
    /// platform's log service, independent of any test's own console
    /// usage. Returns `None` after the first call.
    fn take_diagnostics(&self) -> Option<mpsc::UnboundedReceiver<DiagnosticEntry>>;
}

/// One owned isolated execution context.
#[async_trait]
pub trait ContextHandle: Send {
    /// Start loading `url` into the context.
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Take the navigation/progress event stream. Returns `None` after
    /// the first call.
    fn take_navigation_events(&mut self) -> Option<mpsc::UnboundedReceiver<NavEvent>>;

    /// Install the result bridge send capability into the context.
    /// Only the trusted installation point (the lifecycle observer at
    /// `Ready`) calls this.
    fn install_bridge(&mut self, bridge: BridgeSender) -> Result<()>;

    /// Expose the auxiliary control proxy into the context.
    fn expose_control(&mut self, proxy: SharedControlProxy) -> Result<()>;

    /// Sink forwarding error records to the context's uncaught hook.
    fn uncaught_sink(&self) -> Arc<dyn UncaughtSink>;

    /// Tear the context down.
    async fn destroy(&mut self) -> Result<()>;
}

/// Creates one isolated context per test and starts loading the test
/// module into it.
pub struct Launcher {
    host: Arc<dyn ContextHost>,
    shims: ShimConfig,
}

impl Launcher {
    pub fn new(host: Arc<dyn ContextHost>, shims: ShimConfig) -> Self {
        Self { host, shims }
    }

    /// Grant the capability set, create the context and start
    /// navigation. Both grant and navigation failures fail the launch
    /// fast, before any run state exists.
    pub async fn launch(
        &self,
        test_id: &str,
        params: &TestParams,
    ) -> Result<Box<dyn ContextHandle>> {
        let origin = isolation_origin(test_id);

        for grant in EMAIL_PERMISSIONS {
            self.host
                .grant_permission(&origin, grant)
                .await
                .map_err(|e| Error::PermissionGrant {
                    origin: origin.clone(),
                    reason: e.to_string(),
                })?;
            debug!(origin = %origin, permission = grant.name, "granted");
        }

        let mut handle = self.host.create_context(&origin, &self.shims).await?;

        let url = runner_url(test_id, params)?;
        info!(%url, "starting test module load");
        handle.navigate(&url).await.map_err(|e| Error::Navigation {
            url,
            reason: e.to_string(),
        })?;

        Ok(handle)
    }
}
