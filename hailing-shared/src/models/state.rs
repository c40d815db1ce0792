use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Trip request lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripState {
    Requested,
    DriverToDeparture,
    DriverToArrival,
    Done,
    UserCancelled,
    DriverCancelled,
    DriverNotAvailable,
    Failed,
}

impl TripState {
    pub const ALL: [TripState; 8] = [
        TripState::Requested,
        TripState::DriverToDeparture,
        TripState::DriverToArrival,
        TripState::Done,
        TripState::UserCancelled,
        TripState::DriverCancelled,
        TripState::DriverNotAvailable,
        TripState::Failed,
    ];

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TripState::Requested | TripState::DriverToDeparture | TripState::DriverToArrival
        )
    }

    pub fn is_complete(&self) -> bool {
        !self.is_active()
    }

    /// Legal edges of the trip state machine
    pub fn can_transition_to(&self, next: TripState) -> bool {
        use TripState::*;
        matches!(
            (self, next),
            (Requested, DriverToDeparture)
                | (Requested, UserCancelled)
                | (Requested, Failed)
                | (Requested, DriverNotAvailable)
                | (DriverToDeparture, DriverToArrival)
                | (DriverToDeparture, DriverCancelled)
                | (DriverToDeparture, UserCancelled)
                | (DriverToArrival, Done)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TripState::Requested => "REQUESTED",
            TripState::DriverToDeparture => "DRIVER_TO_DEPARTURE",
            TripState::DriverToArrival => "DRIVER_TO_ARRIVAL",
            TripState::Done => "DONE",
            TripState::UserCancelled => "USER_CANCELLED",
            TripState::DriverCancelled => "DRIVER_CANCELLED",
            TripState::DriverNotAvailable => "DRIVER_NOT_AVAILABLE",
            TripState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TripState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown trip state: {0}")]
pub struct UnknownTripState(pub String);

impl FromStr for TripState {
    type Err = UnknownTripState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TripState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownTripState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        let active: Vec<_> = TripState::ALL.iter().filter(|s| s.is_active()).collect();
        assert_eq!(active.len(), 3);
        assert!(TripState::Done.is_complete());
        assert!(TripState::DriverNotAvailable.is_complete());
    }

    #[test]
    fn test_transition_table() {
        assert!(TripState::Requested.can_transition_to(TripState::DriverToDeparture));
        assert!(TripState::DriverToDeparture.can_transition_to(TripState::UserCancelled));
        assert!(!TripState::Requested.can_transition_to(TripState::Done));
        assert!(!TripState::DriverToArrival.can_transition_to(TripState::UserCancelled));
        assert!(!TripState::Done.can_transition_to(TripState::Requested));
    }

    #[test]
    fn test_string_form_matches_serde() {
        for state in TripState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
            assert_eq!(state.as_str().parse::<TripState>().unwrap(), state);
        }
        let err = "PAID".parse::<TripState>().unwrap_err();
        assert_eq!(err, UnknownTripState("PAID".to_string()));
        assert_eq!(err.to_string(), "unknown trip state: PAID");
    }
}
