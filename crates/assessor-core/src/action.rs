use serde::{Deserialize, Serialize};

/// Outcome of a user-triggered action, surfaced verbatim to the caller.
///
/// Exactly one of the two strings is non-empty. Failures are never raised as
/// errors past this point; they are reported through `error`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionResult {
    pub error: String,
    pub success: String,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            error: String::new(),
            success: message.into(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            success: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}
