use std::any::Any;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use stork_pki::CertError;
use tracing::error;

use crate::configmgr::ConfigManagerError;
use crate::storage::DatabaseError;

const INTERNAL_MESSAGE: &str = "Internal server error";

/// Error returned by REST handlers, rendered as `{"message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 500 with an opaque body; the cause is only logged.
    pub fn internal(cause: &dyn std::fmt::Display) -> Self {
        error!(error = %cause, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
    }
}

/// Response for a handler that panicked; the payload is only logged.
pub(super) fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_default();
    error!(panic = %detail, "Request handler panicked");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(what) => Self::not_found(format!("{what} not found")),
            DatabaseError::Conflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            other => Self::internal(&other),
        }
    }
}

impl From<ConfigManagerError> for ApiError {
    fn from(err: ConfigManagerError) -> Self {
        match err {
            ConfigManagerError::SubnetNotFound(_)
            | ConfigManagerError::SharedNetworkNotFound(_)
            | ConfigManagerError::NoSubnetCmdsHook { .. }
            | ConfigManagerError::InvalidState { .. } => Self::bad_request(err.to_string()),
            ConfigManagerError::Locked { .. } => Self::new(StatusCode::LOCKED, err.to_string()),
            ConfigManagerError::TransactionExpired(_) => Self::not_found(err.to_string()),
            ConfigManagerError::Apply(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            // The daemon's text is passed through so operators can act on it.
            ConfigManagerError::Commit(commit) => {
                let status = if commit.is_daemon_error() {
                    StatusCode::CONFLICT
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                Self::new(status, commit.to_string())
            }
            ConfigManagerError::Database(db) => db.into(),
        }
    }
}

impl From<CertError> for ApiError {
    fn from(err: CertError) -> Self {
        match err {
            CertError::InvalidCsr(_) => Self::bad_request(err.to_string()),
            other => Self::internal(&other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::agentcomm::AgentError;
    use crate::configmgr::CommitError;

    fn commit_error(source: AgentError) -> ConfigManagerError {
        CommitError {
            daemon_id: 1,
            daemon_name: "dhcp4".into(),
            app_id: 1,
            command: "subnet4-del".into(),
            step: 0,
            sent: Vec::new(),
            source,
        }
        .into()
    }

    #[test]
    fn commit_errors_keep_daemon_text() {
        let err = ApiError::from(commit_error(AgentError::Daemon {
            code: 1,
            text: "subnet not found".into(),
        }));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.message.contains("subnet not found"));

        let err = ApiError::from(commit_error(AgentError::Connect("refused".into())));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("refused"));
    }

    #[test]
    fn database_failures_are_opaque() {
        let err = ApiError::from(DatabaseError::Query("no such column: secret".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, INTERNAL_MESSAGE);

        let err = ApiError::from(DatabaseError::NotFound("Machine 7".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "Machine 7 not found");
    }

    #[test]
    fn lock_maps_to_423() {
        let err = ApiError::from(ConfigManagerError::Locked {
            resource: "subnet",
            id: 42,
        });
        assert_eq!(err.status, StatusCode::LOCKED);
        assert_eq!(
            err.message,
            "Unable to edit the subnet with ID 42 because it may be currently edited by another user"
        );
    }
}
