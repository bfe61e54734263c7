//! Trust model for runs triggered from pull requests.

use crate::ids::{PullRequestId, RepoId, UserId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The pull request a run was triggered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PullRequest {
    pub id: PullRequestId,
    /// Repository the pull request targets.
    pub repo_id: RepoId,
    pub poster_id: Option<UserId>,
    /// Head branch lives in another repository.
    pub is_fork: bool,
}

/// A user acting on the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Actor {
    pub id: UserId,
    /// Restricted users are never explicitly trusted.
    #[serde(default)]
    pub is_restricted: bool,
}

/// Durable per-repository trust grant for a pull request poster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TrustGrant {
    pub user_id: UserId,
    pub repo_id: RepoId,
    pub trusted_with_pull_requests: bool,
    pub last_access: DateTime<Utc>,
}

/// Why a user is or is not trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UserTrust {
    NotTrusted,
    /// Holds a trust grant for the repository.
    Explicitly,
    /// Can write to the CI capability of the repository, or the pull
    /// request does not come from a fork.
    Implicitly,
}

impl UserTrust {
    pub fn is_trusted(&self) -> bool {
        *self != UserTrust::NotTrusted
    }
}

/// Which commit a pull request run reads its workflows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommitSource {
    Head,
    Base,
}

/// Outcome of the trust gate for a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TrustDecision {
    pub commit: CommitSource,
    pub need_approval: bool,
}

impl TrustDecision {
    pub const HEAD: TrustDecision = TrustDecision {
        commit: CommitSource::Head,
        need_approval: false,
    };
}

/// A maintainer's decision about a pull request poster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrustUpdate {
    /// Cancel the pull request's unfinished runs.
    Deny,
    /// Grant durable trust and approve the poster's pending runs.
    Always,
    /// Approve the pull request's runs waiting for approval.
    Once,
    /// Remove durable trust and cancel the poster's unfinished runs.
    Revoke,
}

impl TrustUpdate {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustUpdate::Deny => "deny",
            TrustUpdate::Always => "always",
            TrustUpdate::Once => "once",
            TrustUpdate::Revoke => "revoke",
        }
    }
}

impl fmt::Display for TrustUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustUpdate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny" => Ok(TrustUpdate::Deny),
            "always" => Ok(TrustUpdate::Always),
            "once" => Ok(TrustUpdate::Once),
            "revoke" => Ok(TrustUpdate::Revoke),
            other => Err(format!("unknown trust update: {other}")),
        }
    }
}
