use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure taxonomy shared by the retry policy table, the mode controller and
/// the structured error reports handed to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Server,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    Parse,
    Business,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 12] = [
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::RateLimit,
        ErrorCategory::Server,
        ErrorCategory::Authentication,
        ErrorCategory::Authorization,
        ErrorCategory::Validation,
        ErrorCategory::NotFound,
        ErrorCategory::Conflict,
        ErrorCategory::Parse,
        ErrorCategory::Business,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Server => "server",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Validation => "validation",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Parse => "parse",
            ErrorCategory::Business => "business",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Categories that are worth retrying locally before surfacing to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
                | ErrorCategory::Server
                | ErrorCategory::Conflict
                | ErrorCategory::Unknown
        )
    }

    /// Short headline suitable for a notification title.
    pub fn title(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "Connection problem",
            ErrorCategory::Timeout => "Request timed out",
            ErrorCategory::RateLimit => "Too many requests",
            ErrorCategory::Server => "Server error",
            ErrorCategory::Authentication => "Authentication required",
            ErrorCategory::Authorization => "Access denied",
            ErrorCategory::Validation => "Invalid data",
            ErrorCategory::NotFound => "Not found",
            ErrorCategory::Conflict => "Conflicting change",
            ErrorCategory::Parse => "Unreadable response",
            ErrorCategory::Business => "Operation not allowed",
            ErrorCategory::Unknown => "Unexpected error",
        }
    }

    pub fn recovery_suggestions(&self) -> &'static [&'static str] {
        match self {
            ErrorCategory::Network => &[
                "Check your internet connection",
                "The change will be retried automatically",
                "Switch to demo mode to keep working offline",
            ],
            ErrorCategory::Timeout => &[
                "The service is responding slowly, try again shortly",
                "The change will be retried automatically",
            ],
            ErrorCategory::RateLimit => &[
                "Wait a moment before trying again",
                "Pending changes are queued and sent later",
            ],
            ErrorCategory::Server => &[
                "The service is having problems, try again later",
                "The change will be retried automatically",
            ],
            ErrorCategory::Authentication => &[
                "Check the configured API token",
                "Sign in again",
            ],
            ErrorCategory::Authorization => &[
                "Make sure the integration has access to this workspace",
                "Ask the workspace owner for permission",
            ],
            ErrorCategory::Validation => &[
                "Review the highlighted fields",
                "Correct the data and submit again",
            ],
            ErrorCategory::NotFound => &[
                "The item may have been deleted",
                "Refresh the list and try again",
            ],
            ErrorCategory::Conflict => &[
                "Someone else changed this item",
                "Refresh to load the latest version",
            ],
            ErrorCategory::Parse => &[
                "The response could not be read",
                "Report the problem if it keeps happening",
            ],
            ErrorCategory::Business => &["This action is not allowed in the current state"],
            ErrorCategory::Unknown => &[
                "Try again",
                "Report the problem if it keeps happening",
            ],
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured description of a failure for the notification layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub queued_operation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names_match_display() {
        for category in ErrorCategory::ALL {
            let encoded = serde_json::to_string(&category).unwrap();
            assert_eq!(encoded, format!("\"{}\"", category));
        }
    }

    #[test]
    fn test_every_category_has_suggestions() {
        assert!(
            ErrorCategory::ALL
                .iter()
                .all(|category| !category.recovery_suggestions().is_empty())
        );
    }
}
