use serde::Serialize;
use std::fmt;

/// Error surfaced by every public operation. `code` is a stable machine
/// code for transport layers; `detail` carries raw stderr/exit context
/// from a failed tool invocation when there is any.
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AppError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.trim().is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    /// External binary was never located or does not respond. Degraded,
    /// never fatal to the process.
    pub fn tool_unavailable(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_TOOL_UNAVAILABLE", message, trace_id)
    }

    /// Serial is not in the current registry; the caller must re-discover.
    pub fn device_not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEVICE_NOT_FOUND", message, trace_id)
    }

    pub fn discovery(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DISCOVERY", message, trace_id)
    }

    pub fn command(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_COMMAND", message, trace_id)
    }

    /// Exclusivity violation: reject, never queue.
    pub fn operation_in_progress(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_OPERATION_IN_PROGRESS", message, trace_id)
    }

    /// A critical step of an orchestrated sequence failed; the remainder
    /// was aborted.
    pub fn critical_step(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_CRITICAL_STEP", message, trace_id)
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_VALIDATION", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
