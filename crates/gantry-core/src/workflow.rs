//! Stored single-job workflow fragments.
//!
//! Every job row carries the YAML fragment it was created from: a workflow
//! reduced to exactly one job, plus flags recording which parts of that job
//! could not be evaluated yet because they depend on the outputs of jobs
//! that have not finished.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Outputs of finished jobs keyed by workflow-local job id, then output key.
pub type JobOutputs = HashMap<String, HashMap<String, String>>;

/// A workflow holding a single job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleWorkflow {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub jobs: BTreeMap<String, WorkflowJob>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub incomplete_matrix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_matrix_needs: Option<IncompleteNeeds>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub incomplete_runs_on: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_runs_on_needs: Option<IncompleteNeeds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_runs_on_matrix: Option<IncompleteMatrix>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub incomplete_with: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_with_needs: Option<IncompleteNeeds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_with_matrix: Option<IncompleteMatrix>,
}

/// Which `needs.<job>.outputs.<output>` reference could not be resolved.
///
/// `output` is empty when the whole job was unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteNeeds {
    pub job: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// Which `matrix.<dimension>` reference could not be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteMatrix {
    pub dimension: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowJob {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, rename = "if", skip_serializing_if = "String::is_empty")]
    pub if_condition: String,
    #[serde(
        default,
        rename = "runs-on",
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub runs_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<WorkflowStep>,
    #[serde(default, rename = "workflow-call", skip_serializing_if = "Option::is_none")]
    pub workflow_call: Option<WorkflowCall>,
}

/// Links the jobs a reusable workflow call was expanded into.
///
/// The outer job stands for the call itself: its `needs` are the inner jobs
/// and its `outputs` are the call's outputs, written against `needs`. It is
/// never dispatched to a runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCall {
    /// Set on the outer job.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Set on inner jobs: the workflow-local id of their outer job.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    /// Either a mapping of dimensions or a placeholder expression that
    /// evaluates to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<serde_yaml::Value>,
    #[serde(default, rename = "fail-fast", skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
    #[serde(default, rename = "max-parallel", skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

impl WorkflowStep {
    /// Human-readable step label: its name, else the action it uses, else
    /// its script.
    pub fn label(&self) -> String {
        self.name
            .as_deref()
            .or(self.uses.as_deref())
            .or(self.run.as_deref())
            .or(self.id.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

impl SingleWorkflow {
    /// Decode a stored fragment.
    pub fn from_yaml(payload: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(payload)
            .map_err(|e| Error::Parse(format!("decoding workflow payload: {e}")))
    }

    /// Encode this fragment for storage.
    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    /// The single job of the fragment, with its workflow-local id.
    pub fn job(&self) -> Option<(&str, &WorkflowJob)> {
        self.jobs.iter().next().map(|(id, job)| (id.as_str(), job))
    }

    /// Replace the single job of the fragment.
    pub fn set_job(&mut self, id: impl Into<String>, job: WorkflowJob) {
        self.jobs.clear();
        self.jobs.insert(id.into(), job);
    }

    /// Whether the job stands for a reusable workflow call.
    pub fn is_workflow_call_outer(&self) -> bool {
        self.job()
            .and_then(|(_, job)| job.workflow_call.as_ref())
            .is_some_and(|call| !call.id.is_empty())
    }

    /// Whether any part of the job is still waiting on unavailable values.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete_matrix || self.incomplete_runs_on || self.incomplete_with
    }
}

/// Options supplied to a [`crate::ports::WorkflowParser`].
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Outputs of finished jobs available for substitution.
    pub job_outputs: JobOutputs,
    /// The `needs` list of the job being evaluated; references to jobs
    /// outside of it are reported as missing jobs.
    pub workflow_needs: Option<Vec<String>>,
    /// Report unresolvable `runs-on` as incomplete instead of failing.
    pub support_incomplete_runs_on: bool,
}

impl ParseOptions {
    pub fn with_job_outputs(mut self, outputs: JobOutputs) -> Self {
        self.job_outputs = outputs;
        self
    }

    pub fn with_workflow_needs(mut self, needs: Vec<String>) -> Self {
        self.workflow_needs = Some(needs);
        self
    }

    pub fn support_incomplete_runs_on(mut self) -> Self {
        self.support_incomplete_runs_on = true;
        self
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
        None => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FRAGMENT: &str = r#"
name: ci
jobs:
  test:
    name: test
    needs: build
    if: always()
    runs-on: [linux, x64]
    steps:
      - name: checkout
        uses: actions/checkout@v4
      - run: cargo test
incomplete_matrix: true
incomplete_matrix_needs:
  job: build
  output: targets
"#;

    #[test]
    fn test_decode_fragment() {
        let workflow = SingleWorkflow::from_yaml(FRAGMENT.as_bytes()).unwrap();
        let (id, job) = workflow.job().unwrap();

        assert_eq!(id, "test");
        assert_eq!(job.needs, vec!["build".to_string()]);
        assert_eq!(job.runs_on, vec!["linux".to_string(), "x64".to_string()]);
        assert_eq!(job.if_condition, "always()");
        assert_eq!(job.steps[0].label(), "checkout");
        assert_eq!(job.steps[1].label(), "cargo test");
        assert!(workflow.incomplete_matrix);
        assert_eq!(
            workflow.incomplete_matrix_needs,
            Some(IncompleteNeeds {
                job: "build".into(),
                output: "targets".into()
            })
        );
        assert!(workflow.is_incomplete());
    }

    #[test]
    fn test_encode_keeps_flags() {
        let workflow = SingleWorkflow::from_yaml(FRAGMENT.as_bytes()).unwrap();
        let encoded = workflow.to_yaml().unwrap();
        let decoded = SingleWorkflow::from_yaml(&encoded).unwrap();
        assert_eq!(decoded, workflow);
    }

    #[test]
    fn test_decode_workflow_call_markers() {
        let payload = r#"
jobs:
  release:
    needs: [release-build]
    workflow-call:
      id: release
    outputs:
      artifact: ${{ needs.release-build.outputs.artifact }}
"#;
        let workflow = SingleWorkflow::from_yaml(payload.as_bytes()).unwrap();
        let (_, job) = workflow.job().unwrap();

        assert_eq!(
            job.workflow_call,
            Some(WorkflowCall {
                id: "release".into(),
                parent: String::new()
            })
        );
        assert_eq!(
            job.outputs["artifact"],
            "${{ needs.release-build.outputs.artifact }}"
        );
    }

    #[test]
    fn test_decode_garbage_is_parse_error() {
        let err = SingleWorkflow::from_yaml(b"jobs: [").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
