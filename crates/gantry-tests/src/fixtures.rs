//! Sample runs, workflows and runners.

use gantry_core::run::{Run, TriggerEvent};
use gantry_core::task::{Runner, RunnerScope};
use gantry_core::{OwnerId, RepoId, RunnerId};

/// build, then test, then deploy.
pub const PIPELINE: &str = r#"
name: ci
jobs:
  build:
    runs-on: linux
    steps:
      - run: make
      - run: make check
  test:
    needs: build
    runs-on: linux
  deploy:
    needs: [test]
    runs-on: linux
"#;

/// `job` runs once per element of the JSON list in output `x` of `setup`.
pub const DYNAMIC_MATRIX: &str = r#"
jobs:
  setup:
    runs-on: linux
  job:
    needs: setup
    runs-on: linux
    strategy:
      matrix:
        n: ${{ fromJSON(needs.setup.outputs.x) }}
"#;

/// A single job on `linux`.
pub const SINGLE: &str = r#"
jobs:
  only:
    runs-on: linux
    steps:
      - run: true
"#;

/// Factory for runs ready to be handed to `RunService::create_run`.
pub struct RunFixture;

impl RunFixture {
    pub fn manual(repo: i64) -> Run {
        Run {
            repo_id: RepoId::new(repo),
            owner_id: OwnerId::new(1),
            title: "integration".to_string(),
            workflow_id: "ci.yml".to_string(),
            git_ref: "refs/heads/main".to_string(),
            commit_sha: "0123456789abcdef".to_string(),
            event: TriggerEvent::WorkflowDispatch,
            ..Default::default()
        }
    }
}

/// A global runner with the given labels.
pub fn runner(id: i64, labels: &[&str]) -> Runner {
    Runner {
        id: RunnerId::new(id),
        name: format!("runner-{id}"),
        scope: RunnerScope::Global,
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}
