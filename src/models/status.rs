use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    #[default]
    Ok,
    Warn,
    Error,
    Nodata,
    Exception,
    Test,
}

impl State {
    /// Severity used to tell degradations from recoveries.
    pub fn weight(&self) -> i64 {
        match self {
            State::Ok => 0,
            State::Warn => 1,
            State::Error => 100,
            State::Nodata => 1000,
            State::Exception => 100_000,
            State::Test => 0,
        }
    }

    pub fn needs_ack(&self) -> bool {
        matches!(self, State::Warn | State::Error)
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            State::Ok => write!(f, "OK"),
            State::Warn => write!(f, "WARN"),
            State::Error => write!(f, "ERROR"),
            State::Nodata => write!(f, "NODATA"),
            State::Exception => write!(f, "EXCEPTION"),
            State::Test => write!(f, "TEST"),
        }
    }
}

/// Global kill switch stored alongside the notifier data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierState {
    Ok,
    Disabled,
}

impl NotifierState {
    pub fn from_string(s: &str) -> Self {
        match s {
            "ERROR" | "DISABLED" => NotifierState::Disabled,
            _ => NotifierState::Ok,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NotifierState::Ok => "OK",
            NotifierState::Disabled => "ERROR",
        }
    }
}
