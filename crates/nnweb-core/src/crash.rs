//! Persistent GPU crash tracking.
//!
//! A GPU compute context can take the whole process down without raising
//! anything catchable. The only signal left is whether the last run that
//! started ever reported completion, so the tracker persists a small state
//! machine around GPU runs:
//!
//! ```text
//! none --run_started--> running --run_completed--> completed
//!                          |
//!                (next session starts)
//!                          v
//!                       crashed
//! ```
//!
//! `crashed` keeps the GPU out of the backend order until [`CrashTracker::reset`].

use std::fmt;
use std::rc::Rc;

use nnweb_runtime::{BackendKind, ExecutionMonitor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StateError;
use crate::state::StateStore;

/// Key of the persisted GPU crash status.
pub const STATUS_KEY: &str = "nnweb.gpu.crash_status";

/// Key of the "crash notice already shown" flag.
pub const ALERT_KEY: &str = "nnweb.gpu.crash_alert_shown";

/// Persisted GPU run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashStatus {
    #[default]
    None,
    Running,
    Crashed,
    Completed,
}

impl CrashStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CrashStatus::None => "none",
            CrashStatus::Running => "running",
            CrashStatus::Crashed => "crashed",
            CrashStatus::Completed => "completed",
        }
    }

    /// Parse a persisted value; anything unrecognized reads as `None`.
    pub fn parse(value: &str) -> Self {
        match value {
            "running" => CrashStatus::Running,
            "crashed" => CrashStatus::Crashed,
            "completed" => CrashStatus::Completed,
            _ => CrashStatus::None,
        }
    }
}

impl fmt::Display for CrashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-time notice raised when a previous session's GPU run never finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashNotice {
    pub backend: BackendKind,
    pub message: String,
}

/// Tracks GPU runs across sessions.
pub struct CrashTracker {
    store: Rc<dyn StateStore>,
    gpu_eligible: bool,
    notice: Option<CrashNotice>,
}

impl CrashTracker {
    /// Start a session: read the persisted status and decide GPU eligibility.
    ///
    /// A status still `running` means the previous session died mid-run; it
    /// is rewritten to `crashed` and, once per installation, a notice is
    /// raised.
    pub fn begin_session(store: Rc<dyn StateStore>) -> Self {
        let mut tracker = Self {
            store,
            gpu_eligible: true,
            notice: None,
        };

        match tracker.status() {
            CrashStatus::Running => {
                warn!("GPU backend did not complete its last run; disabling it for this session");
                tracker.write(CrashStatus::Crashed);
                tracker.gpu_eligible = false;
                tracker.notice = tracker.take_alert();
            }
            CrashStatus::Crashed => {
                debug!("GPU backend is marked as crashed");
                tracker.gpu_eligible = false;
            }
            CrashStatus::None | CrashStatus::Completed => {}
        }

        tracker
    }

    /// Wrap `store` without starting a session.
    ///
    /// Nothing is written; a leftover `running` status stays as it is.
    pub fn attach(store: Rc<dyn StateStore>) -> Self {
        let mut tracker = Self {
            store,
            gpu_eligible: true,
            notice: None,
        };
        tracker.gpu_eligible = tracker.status() != CrashStatus::Crashed;
        tracker
    }

    /// Whether the one-time crash notice has been shown.
    pub fn alert_shown(&self) -> bool {
        matches!(self.store.get(ALERT_KEY), Ok(Some(_)))
    }

    /// Current persisted status. Unreadable state reads as `None`.
    pub fn status(&self) -> CrashStatus {
        match self.store.get(STATUS_KEY) {
            Ok(value) => value.as_deref().map(CrashStatus::parse).unwrap_or_default(),
            Err(e) => {
                warn!("Failed to read GPU crash status: {}", e);
                CrashStatus::None
            }
        }
    }

    /// Whether the GPU may be used this session.
    pub fn gpu_eligible(&self) -> bool {
        self.gpu_eligible
    }

    /// Notice raised at session start, if any.
    pub fn notice(&self) -> Option<&CrashNotice> {
        self.notice.as_ref()
    }

    /// Clear the persisted status so the next session tries the GPU again.
    ///
    /// The one-time alert flag is kept.
    pub fn reset(&self) -> Result<(), StateError> {
        self.store.set(STATUS_KEY, CrashStatus::None.as_str())
    }

    fn write(&self, status: CrashStatus) {
        if let Err(e) = self.store.set(STATUS_KEY, status.as_str()) {
            warn!("Failed to persist GPU crash status '{}': {}", status, e);
        }
    }

    fn take_alert(&self) -> Option<CrashNotice> {
        match self.store.get(ALERT_KEY) {
            Ok(Some(_)) => None,
            Ok(None) => {
                if let Err(e) = self.store.set(ALERT_KEY, "true") {
                    warn!("Failed to persist crash alert flag: {}", e);
                }
                Some(CrashNotice {
                    backend: BackendKind::Gpu,
                    message: "The GPU backend crashed during a previous session and has been \
                              disabled. A slower backend will be used instead."
                        .to_string(),
                })
            }
            Err(e) => {
                warn!("Failed to read crash alert flag: {}", e);
                None
            }
        }
    }
}

impl ExecutionMonitor for CrashTracker {
    fn run_started(&self, kind: BackendKind) {
        if kind == BackendKind::Gpu && self.status() == CrashStatus::None {
            self.write(CrashStatus::Running);
        }
    }

    fn run_completed(&self, kind: BackendKind) {
        if kind == BackendKind::Gpu && self.status() == CrashStatus::Running {
            self.write(CrashStatus::Completed);
        }
    }
}

impl fmt::Debug for CrashTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashTracker")
            .field("gpu_eligible", &self.gpu_eligible)
            .field("notice", &self.notice)
            .finish()
    }
}
