//! Strongly-typed identifiers for persisted rows.
//!
//! Rows are keyed by database-assigned 64-bit integers. The value `0` means
//! "not assigned yet" and is never a valid identity of a stored row.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }

            pub const fn is_unset(&self) -> bool {
                self.0 == 0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(raw.parse()?))
            }
        }
    };
}

define_id!(RunId, "run");
define_id!(JobId, "job");
define_id!(TaskId, "tsk");
define_id!(RunnerId, "rnr");
define_id!(RepoId, "repo");
define_id!(OwnerId, "own");
define_id!(UserId, "usr");
define_id!(PullRequestId, "pr");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_display() {
        let id = RunId::new(42);
        assert_eq!(id.to_string(), "run_42");
    }

    #[test]
    fn test_task_id_parse() {
        let parsed: TaskId = "tsk_7".parse().unwrap();
        assert_eq!(parsed, TaskId::new(7));

        let bare: TaskId = "7".parse().unwrap();
        assert_eq!(bare, parsed);
    }

    #[test]
    fn test_default_is_unset() {
        assert!(JobId::default().is_unset());
        assert!(!JobId::new(1).is_unset());
    }
}
