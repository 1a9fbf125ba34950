//! Test log persistence
//!
//! Serializes the payload handed over the result bridge, wraps it in
//! literal sentinel lines and writes it crash-safely: the full content
//! goes to a temporary sibling path first and is then renamed into
//! place, so a crash mid-write never leaves a partial log file.
//!
//! Log loss is non-fatal: an I/O failure here is reported and the
//! write abandoned, never retried.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use loggest_common::{LogPayload, Result};

/// First line of every persisted test log.
pub const LOG_BEGIN_SENTINEL: &str = "##### LOGGEST-TEST-RUN-BEGIN #####";

/// Last line of every persisted test log.
pub const LOG_END_SENTINEL: &str = "##### LOGGEST-TEST-RUN-END #####";

/// Writes one sentinel-framed log file per run.
#[derive(Debug, Clone)]
pub struct LogWriter {
    root: PathBuf,
}

impl LogWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Target path: `<root>/<account_type>/<test_id>.log`.
    pub fn log_path(&self, account_type: &str, test_id: &str) -> PathBuf {
        self.root.join(account_type).join(format!("{test_id}.log"))
    }

    /// Wrap serialized payload text in the sentinel lines.
    pub fn frame(payload_json: &str) -> String {
        format!("{LOG_BEGIN_SENTINEL}\n{payload_json}\n{LOG_END_SENTINEL}\n")
    }

    /// Recover the serialized payload from framed log text.
    pub fn extract_payload(text: &str) -> Option<&str> {
        let rest = text.strip_prefix(LOG_BEGIN_SENTINEL)?.strip_prefix('\n')?;
        let rest = rest.strip_suffix('\n')?;
        let rest = rest.strip_suffix(LOG_END_SENTINEL)?;
        rest.strip_suffix('\n')
    }

    /// Serialize `payload` and atomically persist it. Called at most
    /// once per run, after the bridge fires.
    pub async fn write(
        &self,
        account_type: &str,
        test_id: &str,
        payload: &LogPayload,
    ) -> Result<PathBuf> {
        let path = self.log_path(account_type, test_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let body = Self::frame(&serde_json::to_string(payload)?);

        // Write the sibling temp file, then rename into place.
        let tmp = tmp_path(&path);
        fs::write(&tmp, body.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;

        info!(path = %path.display(), "test log written");
        Ok(path)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}
