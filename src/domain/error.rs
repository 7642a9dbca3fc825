use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppError {
    InputInvalid(String),
    UpstreamUnavailable(String),
    RetrievalMiss(String),
    TemplateNotApplicable(String),
    UnsafeSql(String),
    ExecutionError(String),
    Busy(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InputInvalid(msg) => write!(f, "Invalid input: {}", msg),
            AppError::UpstreamUnavailable(msg) => write!(f, "Upstream unavailable: {}", msg),
            AppError::RetrievalMiss(msg) => write!(f, "Retrieval miss: {}", msg),
            AppError::TemplateNotApplicable(msg) => write!(f, "Template not applicable: {}", msg),
            AppError::UnsafeSql(msg) => write!(f, "Unsafe SQL: {}", msg),
            AppError::ExecutionError(msg) => write!(f, "Execution error: {}", msg),
            AppError::Busy(msg) => write!(f, "Busy: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Whether a retry against the same upstream can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamUnavailable(_) | AppError::Busy(_)
        )
    }

    /// User-facing message catalog. Never contains a SQL body or any
    /// upstream error detail.
    pub fn user_safe_message(&self) -> &'static str {
        match self {
            AppError::InputInvalid(_) => "I couldn't understand the question.",
            AppError::UpstreamUnavailable(_) => "The service is temporarily unavailable, please retry.",
            AppError::RetrievalMiss(_) => "No matching data found for your question.",
            AppError::TemplateNotApplicable(_) => "No matching data found for your question.",
            AppError::UnsafeSql(_) => "That question can't be answered safely.",
            AppError::ExecutionError(_) => "No matching data found for your question.",
            AppError::Busy(_) => "The service is busy, please retry in a moment.",
            AppError::Internal(_) => "Something went wrong, please try again.",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AppError::UpstreamUnavailable("timeout".into()).is_transient());
        assert!(AppError::Busy("rate limited".into()).is_transient());
        assert!(!AppError::UnsafeSql("drop".into()).is_transient());
        assert!(!AppError::ExecutionError("syntax".into()).is_transient());
    }

    #[test]
    fn test_user_safe_messages_never_leak_detail() {
        let err = AppError::ExecutionError("ERROR: relation \"providers\" does not exist".into());
        assert!(!err.user_safe_message().contains("providers"));
    }
}
