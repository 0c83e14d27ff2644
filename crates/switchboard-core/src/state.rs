use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CoordinatorError;

/// Connection state of one participant's endpoint on a media bridge, as
/// reported by the bridge. Transitions are not validated here; the bridge is
/// the authority.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Checking,
    Connecting,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    /// A failed endpoint no longer counts towards its bridge's load.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "checking" => Ok(Self::Checking),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "completed" => Ok(Self::Completed),
            "disconnected" => Ok(Self::Disconnected),
            "failed" => Ok(Self::Failed),
            "closed" => Ok(Self::Closed),
            other => Err(CoordinatorError::InvalidConnectionState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_reported_state() {
        for s in [
            "new",
            "checking",
            "connecting",
            "connected",
            "completed",
            "disconnected",
            "failed",
            "closed",
        ] {
            let state: ConnectionState = s.parse().unwrap();
            assert_eq!(state.as_str(), s);
        }
    }

    #[test]
    fn rejects_unknown_state() {
        let err = "exploded".parse::<ConnectionState>().unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidConnectionState(_)));
    }

    #[test]
    fn only_failed_is_failed() {
        assert!(ConnectionState::Failed.is_failed());
        assert!(!ConnectionState::Closed.is_failed());
        assert!(!ConnectionState::Disconnected.is_failed());
    }
}
