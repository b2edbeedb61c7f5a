//! Error types shared by the loader crates

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid dataset version '{0}': expected YYYY-MM")]
    InvalidVersion(String),

    #[error("Invalid {setting} value '{value}': {reason}")]
    InvalidSetting {
        setting: &'static str,
        value: String,
        reason: String,
    },

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl CommonError {
    pub fn invalid_setting(
        setting: &'static str,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSetting {
            setting,
            value: value.into(),
            reason: reason.into(),
        }
    }
}
