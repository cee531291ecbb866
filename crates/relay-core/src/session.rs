use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one protocol session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    QrReady,
    Connected,
    Reconnecting,
    Expired,
    LoggedOut,
    Terminated,
}

impl SessionStatus {
    /// Absorbing states: the session is gone and will not reconnect.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::LoggedOut | Self::Terminated)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::QrReady => "qr_ready",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Expired => "expired",
            Self::LoggedOut => "logged_out",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "qr_ready" => Ok(Self::QrReady),
            "connected" => Ok(Self::Connected),
            "reconnecting" => Ok(Self::Reconnecting),
            "expired" => Ok(Self::Expired),
            "logged_out" => Ok(Self::LoggedOut),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Point-in-time view of a session, as returned by `get_status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    /// Remote identity (phone number / account handle), set on connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Rendered pairing code; only meaningful while `qr_ready`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_expires_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// True only once the connection has held for the stability dwell.
    pub stable: bool,
}

impl SessionSnapshot {
    pub fn new(status: SessionStatus) -> Self {
        Self {
            status,
            identity: None,
            pairing_code: None,
            qr_expires_at: None,
            reconnect_attempts: 0,
            connected_at: None,
            stable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_and_parse_roundtrip() {
        for s in [
            SessionStatus::Initializing,
            SessionStatus::QrReady,
            SessionStatus::Connected,
            SessionStatus::Reconnecting,
            SessionStatus::Expired,
            SessionStatus::LoggedOut,
            SessionStatus::Terminated,
        ] {
            let parsed: SessionStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::LoggedOut.is_terminal());
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(!SessionStatus::Reconnecting.is_terminal());
        assert!(!SessionStatus::Connected.is_terminal());
    }

    #[test]
    fn snapshot_omits_empty_fields() {
        let snap = SessionSnapshot::new(SessionStatus::Initializing);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"status\":\"initializing\""));
        assert!(!json.contains("identity"));
        assert!(!json.contains("pairing_code"));
    }

    #[test]
    fn snapshot_serializes_identity_when_present() {
        let mut snap = SessionSnapshot::new(SessionStatus::Connected);
        snap.identity = Some("15551234".into());
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"identity\":\"15551234\""));
    }
}
