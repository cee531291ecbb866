use std::time::Duration;

/// Typed error hierarchy for gateway actions.
/// Classifies failures as caller errors (never retried), transient
/// infrastructure errors (retried at the layer owning the budget), and
/// terminal session conditions.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ActionError {
    // Caller errors
    #[error("missing or invalid parameter: {0}")]
    InvalidRequest(String),
    #[error("session not found: {0}")]
    NotFound(String),

    // Session state
    #[error("session not resident: {0}")]
    NotAvailable(String),
    #[error("session did not reach connected within {0:?}")]
    NotConnected(Duration),

    // Transient infrastructure
    #[error("worker {0} unavailable")]
    WorkerUnavailable(usize),
    #[error("no worker reply within {0:?}")]
    IpcTimeout(Duration),
    #[error("send timed out after {attempts} attempts")]
    TransportTimeout { attempts: u32 },

    // Terminal
    #[error("recipient unreachable: {0}")]
    RecipientUnreachable(String),
    #[error("session is logged out")]
    LoggedOut,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ActionError {
    /// True for errors the caller produced; these are never retried anywhere.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WorkerUnavailable(_) | Self::IpcTimeout(_) | Self::TransportTimeout { .. }
        )
    }

    /// Short classification string; this is also the wire `error.kind` in
    /// worker replies and HTTP error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::NotAvailable(_) => "not_available",
            Self::NotConnected(_) => "not_connected",
            Self::WorkerUnavailable(_) => "worker_unavailable",
            Self::IpcTimeout(_) => "ipc_timeout",
            Self::TransportTimeout { .. } => "transport_timeout",
            Self::RecipientUnreachable(_) => "recipient_unreachable",
            Self::LoggedOut => "logged_out",
            Self::Internal(_) => "internal",
        }
    }

    /// Rebuild an error from its wire form. Used on the coordinator side when
    /// a worker reply carries `{kind, message}`.
    pub fn from_wire(kind: &str, message: &str) -> Self {
        match kind {
            "invalid_request" => Self::InvalidRequest(message.to_string()),
            "not_found" => Self::NotFound(message.to_string()),
            "not_available" => Self::NotAvailable(message.to_string()),
            "not_connected" => Self::NotConnected(Duration::ZERO),
            "worker_unavailable" => Self::WorkerUnavailable(0),
            "ipc_timeout" => Self::IpcTimeout(Duration::ZERO),
            "transport_timeout" => Self::TransportTimeout { attempts: 0 },
            "recipient_unreachable" => Self::RecipientUnreachable(message.to_string()),
            "logged_out" => Self::LoggedOut,
            _ => Self::Internal(message.to_string()),
        }
    }
}
