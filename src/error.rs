//! Terminal failures of a `/chat` request and their HTTP mapping.
//!
//! Every failure is turned into a response here and nowhere else. The caller
//! only ever sees a fixed, generic message; the cause goes to the log.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::token::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Body absent, malformed, or an empty JSON value. A caller fault.
    #[error("request body is not a non-empty JSON value")]
    InvalidJson,
    /// No backend address is configured. An operator fault.
    #[error("BACKEND_URL is not configured")]
    Misconfigured,
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The backend could not be reached or the exchange broke off.
    #[error("backend request failed")]
    Transport(#[from] reqwest::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidJson => StatusCode::BAD_REQUEST,
            Self::Misconfigured | Self::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidJson => "Invalid JSON body",
            Self::Misconfigured => "Server misconfiguration",
            Self::Auth(_) => "Failed to authenticate to backend",
            Self::Transport(_) => "Failed to reach backend",
        }
    }
}

/// `err: cause: cause...`, for logging.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            Self::InvalidJson => tracing::debug!("rejected request: {}", self),
            _ => tracing::error!(error = %error_chain(&self), "{}", self.public_message()),
        }

        (
            self.status(),
            Json(json!({ "error": self.public_message() })),
        )
            .into_response()
    }
}
