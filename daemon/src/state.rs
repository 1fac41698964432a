use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Lifecycle state reported by the recording pipeline.
///
/// Any state may follow any other; sequencing is the producer's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DashcamState {
    /// The producer disconnected or sent something unreadable.
    Dead,
    /// The producer reported an explicit failure.
    Error,
    Starting,
    Recording,
    /// Capture is running but the encoder cannot keep up.
    FallingBehind,
    Converting,
    Uploading,
}

/// Returned when a token on the wire is not exactly one of the state names.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognised dashcam state {0:?}")]
pub struct ParseStateError(pub String);

impl DashcamState {
    /// Every state, in declaration order.
    pub const ALL: [DashcamState; 7] = [
        DashcamState::Dead,
        DashcamState::Error,
        DashcamState::Starting,
        DashcamState::Recording,
        DashcamState::FallingBehind,
        DashcamState::Converting,
        DashcamState::Uploading,
    ];

    /// The exact name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            DashcamState::Dead => "DEAD",
            DashcamState::Error => "ERROR",
            DashcamState::Starting => "STARTING",
            DashcamState::Recording => "RECORDING",
            DashcamState::FallingBehind => "FALLING_BEHIND",
            DashcamState::Converting => "CONVERTING",
            DashcamState::Uploading => "UPLOADING",
        }
    }

    /// Parses a single token by exact, case-sensitive name match.
    pub fn parse(token: &str) -> Result<Self, ParseStateError> {
        Self::ALL
            .into_iter()
            .find(|state| state.name() == token)
            .ok_or_else(|| ParseStateError(token.to_string()))
    }
}

impl FromStr for DashcamState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DashcamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
