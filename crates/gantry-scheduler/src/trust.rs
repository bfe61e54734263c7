//! Approval gate for runs triggered from fork pull requests.

use crate::runs::{approve_run, kill_run, load_run, RunService};
use chrono::Utc;
use gantry_core::ports::{PermissionChecker, Transaction};
use gantry_core::run::{RunFilter, TriggerEvent};
use gantry_core::trust::{
    Actor, CommitSource, PullRequest, TrustDecision, TrustGrant, TrustUpdate, UserTrust,
};
use gantry_core::{Error, RepoId, Result, RunId, Status, UserId};
use std::sync::Arc;
use tracing::{debug, info};

/// Decides whether pull request runs may execute unattended, and applies
/// maintainers' trust decisions.
pub struct TrustGate {
    runs: Arc<RunService>,
    permissions: Arc<dyn PermissionChecker>,
}

impl TrustGate {
    pub fn new(runs: Arc<RunService>, permissions: Arc<dyn PermissionChecker>) -> Self {
        Self { runs, permissions }
    }

    /// Which commit a new run reads its workflows from and whether it must
    /// wait for approval. `doer` is the user whose action triggered the
    /// run.
    pub async fn decide(
        &self,
        repo_id: RepoId,
        pr: Option<&PullRequest>,
        doer: &Actor,
        event: &TriggerEvent,
    ) -> Result<TrustDecision> {
        let Some(pr) = pr else {
            return Ok(TrustDecision::HEAD);
        };
        if !pr.is_fork || event.is_default_branch_workflow() {
            return Ok(TrustDecision::HEAD);
        }

        let poster = self.poster(pr).await?;
        if self.user_trust(repo_id, pr, &poster).await?.is_trusted() {
            return Ok(TrustDecision::HEAD);
        }

        if self.user_trust(repo_id, pr, doer).await?.is_trusted() {
            // the doer only vouches for code they just pushed
            let commit = if *event == TriggerEvent::PullRequestSync {
                CommitSource::Head
            } else {
                CommitSource::Base
            };
            return Ok(TrustDecision {
                commit,
                need_approval: false,
            });
        }

        debug!(repo_id = %repo_id, pull_request = %pr.id, "Run needs approval");
        Ok(TrustDecision {
            commit: CommitSource::Head,
            need_approval: true,
        })
    }

    /// How far `user` is trusted with runs of `pr`. Using an explicit grant
    /// refreshes its last access time.
    pub async fn user_trust(
        &self,
        repo_id: RepoId,
        pr: &PullRequest,
        user: &Actor,
    ) -> Result<UserTrust> {
        if !pr.is_fork || self.permissions.can_write_actions(repo_id, user).await? {
            return Ok(UserTrust::Implicitly);
        }
        if user.is_restricted {
            return Ok(UserTrust::NotTrusted);
        }

        let mut tx = self.runs.store().begin().await?;
        let Some(mut grant) = tx.get_trust_grant(user.id, repo_id).await? else {
            return Ok(UserTrust::NotTrusted);
        };
        if !grant.trusted_with_pull_requests {
            return Ok(UserTrust::NotTrusted);
        }
        grant.last_access = Utc::now();
        tx.upsert_trust_grant(&grant).await?;
        tx.commit().await?;
        Ok(UserTrust::Explicitly)
    }

    /// Apply a maintainer's decision about the poster of `pr`. Returns the
    /// runs that were approved or cancelled.
    pub async fn update_trust(
        &self,
        pr: &PullRequest,
        doer: &Actor,
        update: TrustUpdate,
    ) -> Result<Vec<RunId>> {
        self.ensure_maintainer(pr.repo_id, doer).await?;

        let mut tx = self.runs.store().begin().await?;
        let repo = RunFilter::repo(pr.repo_id).not_done();
        let affected = match update {
            TrustUpdate::Always => {
                let poster_id = poster_id(pr)?;
                let grant = TrustGrant {
                    user_id: poster_id,
                    repo_id: pr.repo_id,
                    trusted_with_pull_requests: true,
                    last_access: Utc::now(),
                };
                tx.upsert_trust_grant(&grant).await?;
                let filter = RunFilter {
                    pull_request_poster_id: Some(poster_id),
                    need_approval: Some(true),
                    ..repo
                };
                approve_runs(tx.as_mut(), &filter, doer.id).await?
            }
            TrustUpdate::Once => {
                let filter = RunFilter {
                    pull_request_id: Some(pr.id),
                    need_approval: Some(true),
                    ..repo
                };
                approve_runs(tx.as_mut(), &filter, doer.id).await?
            }
            TrustUpdate::Revoke => {
                let poster_id = poster_id(pr)?;
                tx.delete_trust_grant(poster_id, pr.repo_id).await?;
                let filter = RunFilter {
                    pull_request_poster_id: Some(poster_id),
                    ..repo
                };
                cancel_runs(tx.as_mut(), &filter).await?
            }
            TrustUpdate::Deny => {
                let filter = RunFilter {
                    pull_request_id: Some(pr.id),
                    ..repo
                };
                cancel_runs(tx.as_mut(), &filter).await?
            }
        };
        tx.commit().await?;

        info!(
            repo_id = %pr.repo_id,
            pull_request = %pr.id,
            doer = %doer.id,
            %update,
            runs = affected.len(),
            "Trust updated"
        );
        self.runs.notify(affected.iter().copied()).await;
        Ok(affected)
    }

    /// Approve one run on behalf of `doer`.
    pub async fn approve_run(&self, run_id: RunId, doer: &Actor) -> Result<()> {
        let repo_id = {
            let mut tx = self.runs.store().begin().await?;
            load_run(tx.as_mut(), run_id).await?.repo_id
        };
        self.ensure_maintainer(repo_id, doer).await?;
        self.runs.approve_run(run_id, doer.id).await
    }

    async fn ensure_maintainer(&self, repo_id: RepoId, doer: &Actor) -> Result<()> {
        if self.permissions.can_write_actions(repo_id, doer).await? {
            return Ok(());
        }
        Err(Error::AuthorizationDenied(format!(
            "{} cannot manage runs of {}",
            doer.id, repo_id
        )))
    }

    async fn poster(&self, pr: &PullRequest) -> Result<Actor> {
        let id = poster_id(pr)?;
        self.permissions.get_user(id).await?.ok_or_else(|| {
            Error::Internal(format!("poster {id} of pull request {} not found", pr.id))
        })
    }
}

fn poster_id(pr: &PullRequest) -> Result<UserId> {
    pr.poster_id
        .ok_or_else(|| Error::Internal(format!("pull request {} has no poster", pr.id)))
}

async fn approve_runs(
    tx: &mut dyn Transaction,
    filter: &RunFilter,
    doer: UserId,
) -> Result<Vec<RunId>> {
    let mut approved = Vec::new();
    for mut run in tx.find_runs(filter).await? {
        approve_run(tx, &mut run, doer).await?;
        approved.push(run.id);
    }
    Ok(approved)
}

async fn cancel_runs(tx: &mut dyn Transaction, filter: &RunFilter) -> Result<Vec<RunId>> {
    let mut cancelled = Vec::new();
    for mut run in tx.find_runs(filter).await? {
        kill_run(tx, &mut run, Status::Cancelled).await?;
        cancelled.push(run.id);
    }
    Ok(cancelled)
}
