//! CLI command definitions.

use clap::{Args, Subcommand};
use gantry_core::{JobId, OwnerId, RepoId, RunId, RunnerId};

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reconcile workers until interrupted
    Serve,

    /// Apply database migrations
    Migrate,

    /// Reconcile one run now
    Reconcile {
        /// Run ID
        run_id: RunId,
    },

    /// Claim one waiting job for a runner
    Dispatch(DispatchArgs),

    /// Cancel a run
    Cancel {
        /// Run ID
        run_id: RunId,
    },

    /// Rerun a finished run, or one of its jobs and everything after it
    Rerun {
        /// Run ID
        run_id: RunId,

        /// Only rerun this job and the jobs that need it
        #[arg(long)]
        job: Option<JobId>,
    },
}

#[derive(Args)]
pub struct DispatchArgs {
    /// Runner ID
    #[arg(long, default_value = "1")]
    pub runner_id: RunnerId,

    /// Runner name
    #[arg(long, default_value = "gantry-cli")]
    pub name: String,

    /// Runner label, repeatable
    #[arg(short, long = "label")]
    pub labels: Vec<String>,

    /// Restrict the runner to one repository
    #[arg(long, conflicts_with = "owner")]
    pub repo: Option<RepoId>,

    /// Restrict the runner to one owner
    #[arg(long)]
    pub owner: Option<OwnerId>,
}
