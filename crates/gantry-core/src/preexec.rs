//! Errors that stop a run before any of its jobs can execute.
//!
//! A pre-execution error is stored on the run as a numeric code plus an
//! ordered list of arguments and is rendered into a message only when
//! displayed. Codes are durable data: a shipped code is never renumbered or
//! given a different argument layout.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Persisted pre-execution error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PreExecutionErrorCode {
    /// args: error message
    EventDetectionError = 1,
    /// args: error message
    JobParsingError = 2,
    /// args: job id, joined needs
    PersistentIncompleteMatrix = 3,
    /// args: job id, missing job, joined needs
    IncompleteMatrixMissingJob = 4,
    /// args: job id, needed job, output
    IncompleteMatrixMissingOutput = 5,
    /// args: job id
    IncompleteMatrixUnknownCause = 6,
    /// args: job id, missing job, joined needs
    IncompleteRunsOnMissingJob = 7,
    /// args: job id, needed job, output
    IncompleteRunsOnMissingOutput = 8,
    /// args: job id, dimension
    IncompleteRunsOnMissingMatrixDimension = 9,
    /// args: job id
    IncompleteRunsOnUnknownCause = 10,
    /// args: job id, missing job, joined needs
    IncompleteWithMissingJob = 11,
    /// args: job id, needed job, output
    IncompleteWithMissingOutput = 12,
    /// args: job id, dimension
    IncompleteWithMissingMatrixDimension = 13,
    /// args: job id
    IncompleteWithUnknownCause = 14,
    /// args: joined job ids forming the cycle
    NeedsCycle = 15,
}

impl PreExecutionErrorCode {
    pub const ALL: [PreExecutionErrorCode; 15] = [
        Self::EventDetectionError,
        Self::JobParsingError,
        Self::PersistentIncompleteMatrix,
        Self::IncompleteMatrixMissingJob,
        Self::IncompleteMatrixMissingOutput,
        Self::IncompleteMatrixUnknownCause,
        Self::IncompleteRunsOnMissingJob,
        Self::IncompleteRunsOnMissingOutput,
        Self::IncompleteRunsOnMissingMatrixDimension,
        Self::IncompleteRunsOnUnknownCause,
        Self::IncompleteWithMissingJob,
        Self::IncompleteWithMissingOutput,
        Self::IncompleteWithMissingMatrixDimension,
        Self::IncompleteWithUnknownCause,
        Self::NeedsCycle,
    ];

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_i32() == code)
    }

    /// Message catalogue key.
    pub fn message_key(&self) -> &'static str {
        match self {
            Self::EventDetectionError => "actions.workflow.event_detection_error",
            Self::JobParsingError => "actions.workflow.job_parsing_error",
            Self::PersistentIncompleteMatrix => "actions.workflow.persistent_incomplete_matrix",
            Self::IncompleteMatrixMissingJob => "actions.workflow.incomplete_matrix_missing_job",
            Self::IncompleteMatrixMissingOutput => {
                "actions.workflow.incomplete_matrix_missing_output"
            }
            Self::IncompleteMatrixUnknownCause => {
                "actions.workflow.incomplete_matrix_unknown_cause"
            }
            Self::IncompleteRunsOnMissingJob => "actions.workflow.incomplete_runs_on_missing_job",
            Self::IncompleteRunsOnMissingOutput => {
                "actions.workflow.incomplete_runs_on_missing_output"
            }
            Self::IncompleteRunsOnMissingMatrixDimension => {
                "actions.workflow.incomplete_runs_on_missing_matrix_dimension"
            }
            Self::IncompleteRunsOnUnknownCause => {
                "actions.workflow.incomplete_runs_on_unknown_cause"
            }
            Self::IncompleteWithMissingJob => "actions.workflow.incomplete_with_missing_job",
            Self::IncompleteWithMissingOutput => "actions.workflow.incomplete_with_missing_output",
            Self::IncompleteWithMissingMatrixDimension => {
                "actions.workflow.incomplete_with_missing_matrix_dimension"
            }
            Self::IncompleteWithUnknownCause => "actions.workflow.incomplete_with_unknown_cause",
            Self::NeedsCycle => "actions.workflow.needs_cycle",
        }
    }
}

/// A pre-execution error as stored on a run.
///
/// `code` is kept raw so that codes written by a newer release still load
/// and render through the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PreExecutionError {
    pub code: i32,
    #[serde(default)]
    pub args: Vec<String>,
    /// Message stored already rendered by an older release; wins over `code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_message: Option<String>,
}

impl PreExecutionError {
    pub fn new<I, S>(code: PreExecutionErrorCode, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code: code.as_i32(),
            args: args.into_iter().map(Into::into).collect(),
            legacy_message: None,
        }
    }

    pub fn legacy(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            args: Vec::new(),
            legacy_message: Some(message.into()),
        }
    }

    pub fn code(&self) -> Option<PreExecutionErrorCode> {
        PreExecutionErrorCode::from_i32(self.code)
    }

    /// Render using `catalog`, substituting `{0}`, `{1}`, ... positionally.
    pub fn render(&self, catalog: &dyn MessageCatalog) -> String {
        if let Some(message) = self.legacy_message.as_deref().filter(|m| !m.is_empty()) {
            return message.to_string();
        }
        if self.code == 0 {
            return String::new();
        }
        match self.code().and_then(|code| catalog.template(code.message_key())) {
            Some(template) => substitute(template, &self.args),
            None => format!(
                "<unsupported error: code={} details={:?}>",
                self.code, self.args
            ),
        }
    }
}

/// Source of message templates keyed by [`PreExecutionErrorCode::message_key`].
pub trait MessageCatalog {
    fn template(&self, key: &str) -> Option<&str>;
}

/// Built-in English messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnglishCatalog;

impl MessageCatalog for EnglishCatalog {
    fn template(&self, key: &str) -> Option<&str> {
        let template = match key {
            "actions.workflow.event_detection_error" => {
                "Unable to parse supported events in workflow: {0}"
            }
            "actions.workflow.job_parsing_error" => "Unable to parse jobs in workflow: {0}",
            "actions.workflow.persistent_incomplete_matrix" => {
                "Unable to evaluate `strategy.matrix` of job {0} due to a `needs` expression that was invalid. It may reference a job that is not in it's 'needs' list ({1}), or an output that doesn't exist on one of those jobs."
            }
            "actions.workflow.incomplete_matrix_missing_job" => {
                "Unable to evaluate `strategy.matrix` of job {0}: job {1} is not in the `needs` list of job {0} ({2})."
            }
            "actions.workflow.incomplete_matrix_missing_output" => {
                "Unable to evaluate `strategy.matrix` of job {0}: job {1} is missing output {2}."
            }
            "actions.workflow.incomplete_matrix_unknown_cause" => {
                "Unable to evaluate `strategy.matrix` of job {0}: unknown error."
            }
            "actions.workflow.incomplete_runs_on_missing_job" => {
                "Unable to evaluate `runs-on` of job {0}: job {1} is not in the `needs` list of job {0} ({2})."
            }
            "actions.workflow.incomplete_runs_on_missing_output" => {
                "Unable to evaluate `runs-on` of job {0}: job {1} is missing output {2}."
            }
            "actions.workflow.incomplete_runs_on_missing_matrix_dimension" => {
                "Unable to evaluate `runs-on` of job {0}: matrix dimension {1} does not exist."
            }
            "actions.workflow.incomplete_runs_on_unknown_cause" => {
                "Unable to evaluate `runs-on` of job {0}: unknown error."
            }
            "actions.workflow.incomplete_with_missing_job" => {
                "Unable to evaluate `with` of job {0}: job {1} is not in the `needs` list of job {0} ({2})."
            }
            "actions.workflow.incomplete_with_missing_output" => {
                "Unable to evaluate `with` of job {0}: job {1} is missing output {2}."
            }
            "actions.workflow.incomplete_with_missing_matrix_dimension" => {
                "Unable to evaluate `with` of job {0}: matrix dimension {1} does not exist."
            }
            "actions.workflow.incomplete_with_unknown_cause" => {
                "Unable to evaluate `with` of job {0}: unknown error."
            }
            "actions.workflow.needs_cycle" => {
                "Unable to schedule jobs {0}: their `needs` lists form a cycle."
            }
            _ => return None,
        };
        Some(template)
    }
}

fn substitute(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        match after[..close].parse::<usize>() {
            Ok(index) => out.push_str(args.get(index).map(String::as_str).unwrap_or("")),
            Err(_) => out.push_str(&rest[open..open + close + 2]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
