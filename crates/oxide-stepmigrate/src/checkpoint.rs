//! Persisted position of a database and its audit log entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Human-readable name of the position before the first migration.
pub const INITIAL_STATE: &str = "initial";

/// Symbolic target naming the newest loaded migration.
pub const LAST_STATE: &str = "last";

/// How far a database instance has progressed.
///
/// `state` is `None` before the first migration. For `Some(name)`,
/// `substate` counts the steps of that migration not yet applied (going up)
/// or already reverted (going down); `0` means fully applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Current migration name, `None` for the initial position.
    pub state: Option<String>,
    /// Steps remaining within `state`.
    pub substate: i64,
}

impl Checkpoint {
    /// Creates a checkpoint. The substate of the initial position is always 0.
    #[must_use]
    pub fn new(state: Option<String>, substate: i64) -> Self {
        let substate = if state.is_some() { substate } else { 0 };
        Self { state, substate }
    }

    /// The position before the first migration.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            state: None,
            substate: 0,
        }
    }

    /// A position inside the named migration.
    #[must_use]
    pub fn at(state: impl Into<String>, substate: i64) -> Self {
        Self {
            state: Some(state.into()),
            substate,
        }
    }

    /// Returns true for the initial position.
    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.state.is_none()
    }

    /// Returns the state name, using `initial` for `None`.
    #[must_use]
    pub fn human_state(&self) -> &str {
        self.state.as_deref().unwrap_or(INITIAL_STATE)
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => write!(f, "{}/{}", state, self.substate),
            None => f.write_str(INITIAL_STATE),
        }
    }
}

/// Direction in which a step moves the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Applying a step.
    Up,
    /// Reverting a step.
    Down,
}

impl Direction {
    /// Returns the lowercase tag stored in history tables.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    /// Returns true for [`Direction::Up`].
    #[must_use]
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("up") {
            Ok(Self::Up)
        } else if s.eq_ignore_ascii_case("down") {
            Ok(Self::Down)
        } else {
            Err(format!("unknown direction '{s}'"))
        }
    }
}

/// One row of the append-only history log.
///
/// An `Up` entry names the checkpoint its step produced. A `Down` entry names
/// the checkpoint that was current before the step was reverted, which is the
/// `Up` entry it cancels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the step was recorded.
    pub applied_at: DateTime<Utc>,
    /// Migration the step belongs to.
    pub state: String,
    /// Substate identifying the step.
    pub substate: i64,
    /// Whether the step was applied or reverted.
    pub direction: Direction,
}

impl HistoryEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn now(state: impl Into<String>, substate: i64, direction: Direction) -> Self {
        Self {
            applied_at: Utc::now(),
            state: state.into(),
            substate,
            direction,
        }
    }

    /// Returns true when both entries name the same step.
    #[must_use]
    pub fn same_step(&self, other: &Self) -> bool {
        self.state == other.state && self.substate == other.substate
    }
}
