pub mod live;
pub mod quotation;
pub mod retry;

use reqwest::StatusCode;
use thiserror::Error;

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Error taxonomy for every remote call the bot makes. Recoverability drives
/// the retry combinator in [`retry`]; everything else propagates to the
/// lifecycle loop.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected status {status} during {operation}")]
    Status {
        status: StatusCode,
        operation: &'static str,
    },
    #[error("malformed response during {operation}: {detail}")]
    Malformed {
        operation: &'static str,
        detail: String,
    },
    #[error("session expired, re-login required")]
    AuthExpired,
    #[error("login rejected by the account service")]
    LoginRejected,
    #[error("invalid one-time-password secret")]
    BadOtpSecret,
    #[error("no eligible candidate survived selection")]
    SelectionExhausted,
    #[error("invalid endpoint url: {0}")]
    Endpoint(#[from] url::ParseError),
}

impl PlatformError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PlatformError::Network(_)
                | PlatformError::Status { .. }
                | PlatformError::AuthExpired
                | PlatformError::SelectionExhausted
        )
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, PlatformError::AuthExpired)
    }
}
