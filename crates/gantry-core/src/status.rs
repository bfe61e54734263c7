//! Job and run status model.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status shared by runs, jobs, tasks and steps.
///
/// The discriminants are persisted and must not change.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Sentinel for aggregation inputs that should not exist.
    #[default]
    Unknown = 0,
    Success = 1,
    Failure = 2,
    Cancelled = 3,
    Skipped = 4,
    Waiting = 5,
    Running = 6,
    Blocked = 7,
}

impl Status {
    /// Terminal statuses: success, failure, cancelled and skipped.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Cancelled | Status::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }

    pub fn is_running(&self) -> bool {
        *self == Status::Running
    }

    pub fn is_waiting(&self) -> bool {
        *self == Status::Waiting
    }

    pub fn is_blocked(&self) -> bool {
        *self == Status::Blocked
    }

    /// A dependency in this status prevents its dependents from being
    /// considered "all succeeded".
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, Status::Failure | Status::Cancelled | Status::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Blocked => "blocked",
        }
    }

    /// Persisted numeric representation.
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    /// Inverse of [`Status::as_i16`]; unrecognised codes map to `Unknown`.
    pub fn from_i16(code: i16) -> Self {
        match code {
            1 => Status::Success,
            2 => Status::Failure,
            3 => Status::Cancelled,
            4 => Status::Skipped,
            5 => Status::Waiting,
            6 => Status::Running,
            7 => Status::Blocked,
            _ => Status::Unknown,
        }
    }

    /// All terminal statuses, in persisted order.
    pub const DONE: [Status; 4] = [
        Status::Success,
        Status::Failure,
        Status::Cancelled,
        Status::Skipped,
    ];

    /// All non-terminal statuses a run can be in.
    pub const NOT_DONE: [Status; 3] = [Status::Waiting, Status::Running, Status::Blocked];
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Status::Unknown),
            "success" => Ok(Status::Success),
            "failure" => Ok(Status::Failure),
            "cancelled" => Ok(Status::Cancelled),
            "skipped" => Ok(Status::Skipped),
            "waiting" => Ok(Status::Waiting),
            "running" => Ok(Status::Running),
            "blocked" => Ok(Status::Blocked),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Aggregate job statuses into a run status.
///
/// Precedence, first match wins: all skipped, all success-or-skipped,
/// any cancelled, any failure, any running, any waiting, any blocked.
/// An empty input is neither "all skipped" nor "all success" and yields
/// `Unknown`, as does a list made only of `Unknown` statuses.
pub fn aggregate<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut seen_any = false;
    let mut all_skipped = true;
    let mut all_success_or_skipped = true;
    let (mut cancelled, mut failure, mut running, mut waiting, mut blocked) =
        (false, false, false, false, false);

    for status in statuses {
        seen_any = true;
        all_skipped &= status == Status::Skipped;
        all_success_or_skipped &= matches!(status, Status::Success | Status::Skipped);
        match status {
            Status::Cancelled => cancelled = true,
            Status::Failure => failure = true,
            Status::Running => running = true,
            Status::Waiting => waiting = true,
            Status::Blocked => blocked = true,
            Status::Success | Status::Skipped | Status::Unknown => {}
        }
    }

    if !seen_any {
        return Status::Unknown;
    }

    if all_skipped {
        Status::Skipped
    } else if all_success_or_skipped {
        Status::Success
    } else if cancelled {
        Status::Cancelled
    } else if failure {
        Status::Failure
    } else if running {
        Status::Running
    } else if waiting {
        Status::Waiting
    } else if blocked {
        Status::Blocked
    } else {
        Status::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Status::*;

    #[test]
    fn test_done_classification() {
        for status in Status::DONE {
            assert!(status.is_done(), "{status} should be done");
        }
        for status in [Blocked, Waiting, Running, Unknown] {
            assert!(!status.is_done(), "{status} should not be done");
        }
    }

    #[test]
    fn test_aggregate_precedence() {
        assert_eq!(aggregate([Skipped, Skipped]), Skipped);
        assert_eq!(aggregate([Success, Skipped]), Success);
        assert_eq!(aggregate([Success, Cancelled]), Cancelled);
        assert_eq!(aggregate([Success, Failure, Running]), Failure);
        assert_eq!(aggregate([Failure, Running]), Failure);
        assert_eq!(aggregate([Cancelled, Failure]), Cancelled);
        assert_eq!(aggregate([Success, Running, Waiting]), Running);
        assert_eq!(aggregate([Waiting, Blocked]), Waiting);
        assert_eq!(aggregate([Blocked, Success]), Blocked);
    }

    #[test]
    fn test_aggregate_degenerate_inputs() {
        assert_eq!(aggregate(Vec::<Status>::new()), Unknown);
        assert_eq!(aggregate([Unknown]), Unknown);
        assert_eq!(aggregate([Success, Unknown]), Unknown);
    }

    #[test]
    fn test_persisted_codes_are_stable() {
        let codes: Vec<i16> = [Unknown, Success, Failure, Cancelled, Skipped, Waiting, Running, Blocked]
            .iter()
            .map(Status::as_i16)
            .collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        for code in 0..8 {
            assert_eq!(Status::from_i16(code).as_i16(), code);
        }
        assert_eq!(Status::from_i16(99), Unknown);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("blocked".parse::<Status>().unwrap(), Blocked);
        assert!("pending".parse::<Status>().is_err());
    }
}
