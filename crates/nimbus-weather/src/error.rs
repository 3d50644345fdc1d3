//! Error types for the forecast cache and refresh engine.

use reqwest::StatusCode;
use thiserror::Error;

/// Durable store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open weather cache: {0}")]
    Init(String),

    #[error("Failed to write weather cache: {0}")]
    Write(String),

    #[error("Failed to read weather cache: {0}")]
    Read(String),
}

/// Network-layer failures from the forecast fetch.
///
/// `Clone` so a single in-flight result can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Weather API rejected credentials")]
    Auth,

    #[error("Rate limited by weather API")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Weather API server error: {status}")]
    Server { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Weather request timed out")]
    Timeout,

    #[error("Invalid weather response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Map an unsuccessful HTTP status to a fetch error.
    pub fn from_status(status: StatusCode, retry_after_secs: Option<u64>) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Auth,
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited { retry_after_secs },
            StatusCode::REQUEST_TIMEOUT => Self::Timeout,
            s if s.is_server_error() => Self::Server { status: s.as_u16() },
            s => Self::InvalidResponse(format!("unexpected status {}", s)),
        }
    }

    /// Whether a retry (user or scheduler) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) | Self::Timeout
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else if let Some(status) = error.status() {
            Self::from_status(status, None)
        } else {
            Self::Network(error.to_string())
        }
    }
}

/// Top-level error for weather operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WeatherError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("No coordinates available for location: {0}")]
    LocationUnavailable(String),
}

impl WeatherError {
    /// Whether this error is retryable.
    ///
    /// Authentication failures and unresolvable locations are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_retryable(),
            Self::Storage(_) | Self::LocationUnavailable(_) => false,
        }
    }

    /// User-friendly error message for UI display.
    pub fn user_message(&self) -> String {
        match self {
            Self::Fetch(FetchError::Auth) => {
                "Weather service rejected the request. Check your settings.".to_string()
            }
            Self::Fetch(FetchError::RateLimited { retry_after_secs: Some(secs) }) => {
                format!("Too many requests. Please wait {} seconds.", secs)
            }
            Self::Fetch(FetchError::RateLimited { retry_after_secs: None }) => {
                "Too many requests. Please try again shortly.".to_string()
            }
            Self::Fetch(FetchError::Server { .. }) => {
                "Weather service unavailable. Please try again later.".to_string()
            }
            Self::Fetch(FetchError::Network(_)) => {
                "Network error. Check your connection.".to_string()
            }
            Self::Fetch(FetchError::Timeout) => {
                "The weather request timed out. Please try again.".to_string()
            }
            Self::Fetch(FetchError::InvalidResponse(_)) => {
                "Received unexpected weather data.".to_string()
            }
            Self::Storage(_) => "Local weather cache error".to_string(),
            Self::LocationUnavailable(_) => "Location unavailable".to_string(),
        }
    }
}
