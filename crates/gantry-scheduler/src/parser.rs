//! Default workflow parser.
//!
//! Splits a workflow into single-job fragments and evaluates the small set
//! of placeholders the orchestrator needs before a job can be dispatched:
//!
//! - `${{ needs.<job>.outputs.<key> }}` and
//!   `${{ fromJSON(needs.<job>.outputs.<key>) }}` in `strategy.matrix`,
//!   `runs-on` and `with`;
//! - `${{ matrix.<dimension> }}` in `runs-on`, `with` and the job name.
//!
//! Other expressions are left untouched for the runner. Placeholders that
//! cannot be evaluated yet are reported through the incomplete flags of the
//! returned fragments.

use gantry_core::ports::WorkflowParser;
use gantry_core::workflow::{
    IncompleteMatrix, IncompleteNeeds, ParseOptions, SingleWorkflow, Strategy, WorkflowJob,
};
use gantry_core::{Error, Result};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// One matrix combination, ordered by dimension name.
type Combination = BTreeMap<String, Value>;

/// Parser for workflow fragments with matrix expansion.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixParser;

impl MatrixParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_job(
        &self,
        workflow: &SingleWorkflow,
        job_id: &str,
        job: &WorkflowJob,
        options: &ParseOptions,
    ) -> Result<Vec<SingleWorkflow>> {
        let scope = Scope {
            options,
            matrix: None,
        };

        let raw_matrix = job.strategy.as_ref().and_then(|s| s.matrix.as_ref());
        let combinations = match raw_matrix {
            None => vec![Combination::new()],
            Some(raw) => match scope.evaluate(raw) {
                Ok(matrix) => expand_matrix(&matrix)
                    .map_err(|msg| Error::Parse(format!("matrix of job {job_id}: {msg}")))?,
                Err(EvalError::Missing(missing)) => {
                    let mut pending = workflow_for(workflow, job_id, job.clone());
                    pending.incomplete_matrix = true;
                    if let Missing::Needs(needs) = missing {
                        pending.incomplete_matrix_needs = Some(needs);
                    }
                    return Ok(vec![pending]);
                }
                Err(EvalError::Invalid(msg)) => {
                    return Err(Error::Parse(format!("matrix of job {job_id}: {msg}")));
                }
            },
        };

        combinations
            .iter()
            .map(|combination| self.concrete_job(workflow, job_id, job, combination, options))
            .collect()
    }

    fn concrete_job(
        &self,
        workflow: &SingleWorkflow,
        job_id: &str,
        job: &WorkflowJob,
        combination: &Combination,
        options: &ParseOptions,
    ) -> Result<SingleWorkflow> {
        let scope = Scope {
            options,
            matrix: Some(combination),
        };
        let mut concrete = job.clone();
        let mut runs_on_missing = None;
        let mut with_missing = None;

        concrete.name = expanded_name(job_id, job, combination, &scope);

        concrete.runs_on = Vec::with_capacity(job.runs_on.len());
        for label in &job.runs_on {
            match scope.evaluate(&Value::String(label.clone())) {
                Ok(value) => concrete.runs_on.extend(labels_of(&value)),
                Err(EvalError::Missing(missing)) => {
                    if !options.support_incomplete_runs_on {
                        return Err(Error::Parse(format!(
                            "runs-on of job {job_id} cannot be evaluated: {label}"
                        )));
                    }
                    runs_on_missing.get_or_insert(missing);
                    concrete.runs_on.push(label.clone());
                }
                Err(EvalError::Invalid(msg)) => {
                    return Err(Error::Parse(format!("runs-on of job {job_id}: {msg}")));
                }
            }
        }

        for (key, raw) in &job.with {
            match scope.evaluate(raw) {
                Ok(value) => {
                    concrete.with.insert(key.clone(), value);
                }
                Err(EvalError::Missing(missing)) => {
                    with_missing.get_or_insert(missing);
                }
                Err(EvalError::Invalid(msg)) => {
                    return Err(Error::Parse(format!("with.{key} of job {job_id}: {msg}")));
                }
            }
        }

        if !combination.is_empty() {
            let matrix: Mapping = combination
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), Value::Sequence(vec![v.clone()])))
                .collect();
            let strategy = concrete.strategy.get_or_insert_with(Strategy::default);
            strategy.matrix = Some(Value::Mapping(matrix));
        } else if let Some(strategy) = concrete.strategy.as_mut() {
            strategy.matrix = None;
        }

        let mut result = workflow_for(workflow, job_id, concrete);
        if let Some(missing) = runs_on_missing {
            result.incomplete_runs_on = true;
            match missing {
                Missing::Needs(needs) => result.incomplete_runs_on_needs = Some(needs),
                Missing::Matrix(matrix) => result.incomplete_runs_on_matrix = Some(matrix),
            }
        }
        if let Some(missing) = with_missing {
            result.incomplete_with = true;
            match missing {
                Missing::Needs(needs) => result.incomplete_with_needs = Some(needs),
                Missing::Matrix(matrix) => result.incomplete_with_matrix = Some(matrix),
            }
        }
        Ok(result)
    }
}

impl WorkflowParser for MatrixParser {
    fn parse(&self, payload: &[u8], options: &ParseOptions) -> Result<Vec<SingleWorkflow>> {
        let workflow = SingleWorkflow::from_yaml(payload)?;
        let mut parsed = Vec::with_capacity(workflow.jobs.len());
        for (job_id, job) in &workflow.jobs {
            parsed.extend(self.parse_job(&workflow, job_id, job, options)?);
        }
        Ok(parsed)
    }
}

fn workflow_for(workflow: &SingleWorkflow, job_id: &str, job: WorkflowJob) -> SingleWorkflow {
    let mut single = SingleWorkflow {
        name: workflow.name.clone(),
        ..Default::default()
    };
    single.set_job(job_id, job);
    single
}

fn expanded_name(
    job_id: &str,
    job: &WorkflowJob,
    combination: &Combination,
    scope: &Scope<'_>,
) -> String {
    let base = if job.name.is_empty() { job_id } else { job.name.as_str() };
    if base.contains(OPEN) && base.contains("matrix.") {
        return scope.interpolate(base).unwrap_or_else(|_| base.to_string());
    }
    if combination.is_empty() {
        return base.to_string();
    }
    let values: Vec<String> = combination.values().map(display).collect();
    format!("{} ({})", base, values.join(", "))
}

/// Runner labels produced by an evaluated `runs-on` entry.
fn labels_of(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().map(display).collect(),
        other => vec![display(other)],
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Cartesian product of the matrix dimensions, with `exclude` entries
/// removed. Each `include` entry extends every combination it agrees with,
/// or becomes a combination of its own when it agrees with none.
fn expand_matrix(matrix: &Value) -> std::result::Result<Vec<Combination>, String> {
    let Value::Mapping(mapping) = matrix else {
        return Err(format!("expected a mapping, got {}", display(matrix)));
    };

    let mut dimensions: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for (key, value) in mapping {
        let key = display(key);
        match key.as_str() {
            "include" => include = combinations_of(value)?,
            "exclude" => exclude = combinations_of(value)?,
            _ => {
                let values = match value {
                    Value::Sequence(items) => items.clone(),
                    scalar => vec![scalar.clone()],
                };
                dimensions.insert(key, values);
            }
        }
    }

    let mut combinations = vec![Combination::new()];
    for (name, values) in &dimensions {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for combination in &combinations {
            for value in values {
                let mut extended = combination.clone();
                extended.insert(name.clone(), value.clone());
                next.push(extended);
            }
        }
        combinations = next;
    }

    combinations.retain(|combination| !exclude.iter().any(|e| matches(combination, e)));

    if dimensions.is_empty() && !include.is_empty() {
        return Ok(include);
    }
    let original = combinations.len();
    for entry in include {
        let mut extended = false;
        for combination in &mut combinations[..original] {
            if extend_with(combination, &entry, &dimensions) {
                extended = true;
            }
        }
        if !extended {
            combinations.push(entry);
        }
    }

    Ok(combinations)
}

/// Add the keys of an `include` entry to `combination` when the entry
/// agrees with it on every original dimension it names. Values added by
/// earlier entries may be replaced; dimension values never are.
fn extend_with(
    combination: &mut Combination,
    entry: &Combination,
    dimensions: &BTreeMap<String, Vec<Value>>,
) -> bool {
    let agrees = entry
        .iter()
        .filter(|(key, _)| dimensions.contains_key(*key))
        .all(|(key, value)| {
            combination
                .get(key)
                .is_some_and(|v| display(v) == display(value))
        });
    if !agrees {
        return false;
    }
    for (key, value) in entry {
        if !dimensions.contains_key(key) {
            combination.insert(key.clone(), value.clone());
        }
    }
    true
}

fn combinations_of(value: &Value) -> std::result::Result<Vec<Combination>, String> {
    let Value::Sequence(items) = value else {
        return Err("include and exclude must be lists".to_string());
    };
    items
        .iter()
        .map(|item| match item {
            Value::Mapping(m) => Ok(m.iter().map(|(k, v)| (display(k), v.clone())).collect()),
            other => Err(format!("expected a mapping entry, got {}", display(other))),
        })
        .collect()
}

/// Whether every key of `pattern` has the same value in `combination`.
fn matches(combination: &Combination, pattern: &Combination) -> bool {
    pattern.iter().all(|(key, value)| {
        combination
            .get(key)
            .is_some_and(|v| display(v) == display(value))
    })
}

enum Missing {
    Needs(IncompleteNeeds),
    Matrix(IncompleteMatrix),
}

enum EvalError {
    Missing(Missing),
    Invalid(String),
}

enum Placeholder<'a> {
    Needs {
        job: &'a str,
        output: &'a str,
        from_json: bool,
    },
    Matrix(&'a str),
    Other,
}

impl<'a> Placeholder<'a> {
    fn parse(expression: &'a str) -> Self {
        let expression = expression.trim();
        if let Some(dimension) = expression.strip_prefix("matrix.") {
            return Placeholder::Matrix(dimension);
        }

        let (path, from_json) = match strip_from_json(expression) {
            Some(inner) => (inner.trim(), true),
            None => (expression, false),
        };
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            ["needs", job, "outputs", output] => Placeholder::Needs {
                job,
                output,
                from_json,
            },
            _ => Placeholder::Other,
        }
    }
}

fn strip_from_json(expression: &str) -> Option<&str> {
    let open = expression.find('(')?;
    if !expression[..open].eq_ignore_ascii_case("fromjson") {
        return None;
    }
    expression[open + 1..].strip_suffix(')')
}

/// Values available while evaluating one job.
struct Scope<'a> {
    options: &'a ParseOptions,
    /// Unset while the matrix itself is evaluated.
    matrix: Option<&'a Combination>,
}

impl Scope<'_> {
    fn evaluate(&self, value: &Value) -> std::result::Result<Value, EvalError> {
        match value {
            Value::String(text) => match whole_placeholder(text) {
                Some(expression) => self.evaluate_whole(text, expression),
                None => self.interpolate(text).map(Value::String),
            },
            Value::Sequence(items) => items
                .iter()
                .map(|item| self.evaluate(item))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Sequence),
            Value::Mapping(mapping) => {
                let mut evaluated = Mapping::with_capacity(mapping.len());
                for (key, item) in mapping {
                    evaluated.insert(key.clone(), self.evaluate(item)?);
                }
                Ok(Value::Mapping(evaluated))
            }
            other => Ok(other.clone()),
        }
    }

    /// A value made of exactly one placeholder keeps the type of what it
    /// evaluates to.
    fn evaluate_whole(&self, text: &str, expression: &str) -> std::result::Result<Value, EvalError> {
        match Placeholder::parse(expression) {
            Placeholder::Needs {
                job,
                output,
                from_json: true,
            } => {
                let raw = self.lookup_output(job, output)?;
                let json: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
                    EvalError::Invalid(format!("needs.{job}.outputs.{output} is not JSON: {e}"))
                })?;
                serde_yaml::to_value(json).map_err(|e| EvalError::Invalid(e.to_string()))
            }
            Placeholder::Matrix(dimension) => match self.matrix {
                Some(matrix) => matrix.get(dimension).cloned().ok_or_else(|| {
                    EvalError::Missing(Missing::Matrix(IncompleteMatrix {
                        dimension: dimension.to_string(),
                    }))
                }),
                None => Ok(Value::String(text.to_string())),
            },
            _ => self.interpolate(text).map(Value::String),
        }
    }

    fn interpolate(&self, text: &str) -> std::result::Result<String, EvalError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(OPEN) {
            let Some(len) = rest[start..].find(CLOSE) else {
                break;
            };
            let end = start + len + CLOSE.len();
            out.push_str(&rest[..start]);

            let placeholder = &rest[start..end];
            let expression = &rest[start + OPEN.len()..start + len];
            match Placeholder::parse(expression) {
                Placeholder::Needs { job, output, .. } => {
                    out.push_str(self.lookup_output(job, output)?);
                }
                Placeholder::Matrix(dimension) => match self.matrix {
                    Some(matrix) => {
                        let value = matrix.get(dimension).ok_or_else(|| {
                            EvalError::Missing(Missing::Matrix(IncompleteMatrix {
                                dimension: dimension.to_string(),
                            }))
                        })?;
                        out.push_str(&display(value));
                    }
                    None => out.push_str(placeholder),
                },
                Placeholder::Other => out.push_str(placeholder),
            }
            rest = &rest[end..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn lookup_output(&self, job: &str, output: &str) -> std::result::Result<&str, EvalError> {
        let missing_job = || {
            EvalError::Missing(Missing::Needs(IncompleteNeeds {
                job: job.to_string(),
                output: String::new(),
            }))
        };

        if let Some(needs) = &self.options.workflow_needs
            && !needs.iter().any(|n| n == job)
        {
            return Err(missing_job());
        }
        let outputs = self.options.job_outputs.get(job).ok_or_else(missing_job)?;
        outputs.get(output).map(String::as_str).ok_or_else(|| {
            EvalError::Missing(Missing::Needs(IncompleteNeeds {
                job: job.to_string(),
                output: output.to_string(),
            }))
        })
    }
}

/// The expression of `text` when it consists of a single placeholder.
fn whole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    (!inner.contains(OPEN) && !inner.contains(CLOSE)).then_some(inner)
}
