use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MForbidden,
    MUnknownToken,
    MNotFound,
    MLimitExceeded,
    MTooLarge,
    #[serde(other)]
    MUnknown,
}

/// Error body returned by the homeserver alongside a non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{errcode:?}: {}", error.as_deref().unwrap_or("no detail"))]
pub struct ApiError {
    pub errcode: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiError {
    pub fn new(errcode: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            errcode,
            error: Some(error.into()),
        }
    }

    /// Parses the standard error body out of a response payload, if present.
    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(body.clone()).ok()
    }
}
