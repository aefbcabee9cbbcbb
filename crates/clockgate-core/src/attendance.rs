//! Attendance activity state machine.
//!
//! A staff member is always in exactly one [`AttendanceState`]. Activities move
//! them between states; the table below is the whole machine:
//!
//! | activity      | allowed from | result  |
//! |---------------|--------------|---------|
//! | `CLOCK_IN`    | `OUT`        | `IN`    |
//! | `CLOCK_OUT`   | `IN`         | `OUT`   |
//! | `BREAK_START` | `IN`         | `BREAK` |
//! | `BREAK_END`   | `BREAK`      | `IN`    |
//! | `LUNCH_START` | `IN`         | `LUNCH` |
//! | `LUNCH_END`   | `LUNCH`      | `IN`    |
//!
//! Time of day, location and identity are checked by the backend before a
//! transition is attempted; this module knows nothing about them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Work state of a staff member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceState {
    #[default]
    Out,
    In,
    Break,
    Lunch,
}

/// A discrete attendance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    ClockIn,
    ClockOut,
    BreakStart,
    BreakEnd,
    LunchStart,
    LunchEnd,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttendanceError {
    #[error("cannot {activity} while {state}")]
    InvalidTransition {
        state: AttendanceState,
        activity: ActivityType,
    },
    #[error("unknown attendance state: {0:?}")]
    UnknownState(String),
    #[error("unknown activity type: {0:?}")]
    UnknownActivity(String),
}

impl ActivityType {
    pub const ALL: [ActivityType; 6] = [
        Self::ClockIn,
        Self::ClockOut,
        Self::BreakStart,
        Self::BreakEnd,
        Self::LunchStart,
        Self::LunchEnd,
    ];

    /// Canonical upper-case name (`CLOCK_IN`, …).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClockIn => "CLOCK_IN",
            Self::ClockOut => "CLOCK_OUT",
            Self::BreakStart => "BREAK_START",
            Self::BreakEnd => "BREAK_END",
            Self::LunchStart => "LUNCH_START",
            Self::LunchEnd => "LUNCH_END",
        }
    }

    /// Short code used on the clock submission wire (`in`, `out`, `break_start`, …).
    pub fn legacy_code(&self) -> &'static str {
        match self {
            Self::ClockIn => "in",
            Self::ClockOut => "out",
            Self::BreakStart => "break_start",
            Self::BreakEnd => "break_end",
            Self::LunchStart => "lunch_start",
            Self::LunchEnd => "lunch_end",
        }
    }

    /// The state a staff member is in after this activity is accepted.
    pub fn resulting_state(&self) -> AttendanceState {
        match self {
            Self::ClockIn | Self::BreakEnd | Self::LunchEnd => AttendanceState::In,
            Self::ClockOut => AttendanceState::Out,
            Self::BreakStart => AttendanceState::Break,
            Self::LunchStart => AttendanceState::Lunch,
        }
    }

    /// Whether this activity may be performed from `state`.
    pub fn allowed_from(&self, state: AttendanceState) -> bool {
        use AttendanceState::*;
        matches!(
            (self, state),
            (Self::ClockIn, Out)
                | (Self::ClockOut, In)
                | (Self::BreakStart, In)
                | (Self::LunchStart, In)
                | (Self::BreakEnd, Break)
                | (Self::LunchEnd, Lunch)
        )
    }
}

impl AttendanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Out => "OUT",
            Self::In => "IN",
            Self::Break => "BREAK",
            Self::Lunch => "LUNCH",
        }
    }

    /// Activities that are legal from this state.
    pub fn allowed_activities(&self) -> Vec<ActivityType> {
        ActivityType::ALL
            .into_iter()
            .filter(|a| a.allowed_from(*self))
            .collect()
    }
}

/// Apply `activity` to `state`.
///
/// Returns the resulting state, or [`AttendanceError::InvalidTransition`]
/// naming both the current state and the attempted activity.
pub fn transition(
    state: AttendanceState,
    activity: ActivityType,
) -> Result<AttendanceState, AttendanceError> {
    if activity.allowed_from(state) {
        Ok(activity.resulting_state())
    } else {
        Err(AttendanceError::InvalidTransition { state, activity })
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AttendanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = AttendanceError;

    /// Accepts both canonical (`CLOCK_IN`) and legacy (`in`) forms, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        ActivityType::ALL
            .into_iter()
            .find(|a| {
                a.as_str().eq_ignore_ascii_case(needle) || a.legacy_code().eq_ignore_ascii_case(needle)
            })
            .ok_or_else(|| AttendanceError::UnknownActivity(s.to_string()))
    }
}

impl FromStr for AttendanceState {
    type Err = AttendanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OUT" => Ok(Self::Out),
            "IN" => Ok(Self::In),
            "BREAK" => Ok(Self::Break),
            "LUNCH" => Ok(Self::Lunch),
            _ => Err(AttendanceError::UnknownState(s.to_string())),
        }
    }
}
