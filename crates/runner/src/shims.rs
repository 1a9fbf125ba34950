//! Platform shim configuration
//!
//! Mocked platform services the test environment needs so a test run is
//! deterministic: an idle service that never fires (idle-triggered
//! maintenance like database vacuums would randomize runs), device
//! storage redirected under the per-test profile directory, prompt
//! dialogs answered without blocking, and network state forced online.
//!
//! Supplied to the launcher as configuration rather than applied as
//! ambient process-wide mutation; the host decides how to realize each
//! shim inside the context it creates.

/// Mocked-service switches for one execution context.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Replace the idle service with one that never reports idle.
    pub mock_idle_service: bool,
    /// Point device-storage roots at a subdirectory of the per-test
    /// profile so tests never touch the real filesystem locations.
    pub redirect_device_storage: bool,
    /// Auto-answer confirmation/prompt dialogs (negatively) instead of
    /// blocking the run.
    pub auto_dismiss_prompts: bool,
    /// Disable automatic network detection and force online state so
    /// tests behave the same with no network attached.
    pub force_online: bool,
}

impl Default for ShimConfig {
    fn default() -> Self {
        // Everything shimmed by default; a test that needs a real
        // service opts out explicitly.
        Self {
            mock_idle_service: true,
            redirect_device_storage: true,
            auto_dismiss_prompts: true,
            force_online: true,
        }
    }
}

impl ShimConfig {
    /// Render the switches as environment variables for hosts that
    /// realize shims inside a child process.
    pub fn env_vars(&self) -> Vec<(&'static str, &'static str)> {
        fn flag(on: bool) -> &'static str {
            if on {
                "1"
            } else {
                "0"
            }
        }
        vec![
            ("LOGGEST_SHIM_IDLE", flag(self.mock_idle_service)),
            (
                "LOGGEST_SHIM_DEVICE_STORAGE",
                flag(self.redirect_device_storage),
            ),
            ("LOGGEST_SHIM_PROMPTS", flag(self.auto_dismiss_prompts)),
            ("LOGGEST_SHIM_FORCE_ONLINE", flag(self.force_online)),
        ]
    }
}
