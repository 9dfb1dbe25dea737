//! Simulation outcomes and result distillation.
//!
//! A worker turns the model's [`RawOutcome`] into a [`SimulationValue`] with
//! [`strip`] before replying, so full result sets only cross the process
//! boundary when the caller asked for them.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, LoadError, SimulateError, StripError, WorkerFailure};

/// Everything a model recorded during one simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOutcome {
    /// Time points.
    #[serde(with = "crate::non_finite::seq")]
    pub time: Vec<f64>,
    /// `(variable, samples)` columns in model order; every column has `time.len()` samples.
    #[serde(with = "crate::non_finite::columns")]
    pub variables: Vec<(String, Vec<f64>)>,
}

impl RawOutcome {
    /// Creates an outcome over a time axis.
    #[must_use]
    pub fn new(time: Vec<f64>) -> Self {
        Self {
            time,
            variables: Vec::new(),
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, samples: Vec<f64>) -> Self {
        self.variables.push((name.into(), samples));
        self
    }

    /// Samples of a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Recorded variable names in model order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|(n, _)| n.as_str())
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// Returns true if nothing was sampled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Time series of selected outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Time points.
    #[serde(with = "crate::non_finite::seq")]
    pub time: Vec<f64>,
    /// Output names, one per column.
    pub names: Vec<String>,
    /// One column per output.
    #[serde(with = "crate::non_finite::rows")]
    pub columns: Vec<Vec<f64>>,
}

impl Trajectory {
    /// Output values at the last time point.
    #[must_use]
    pub fn last_sample(&self) -> Option<Vec<f64>> {
        self.columns.iter().map(|c| c.last().copied()).collect()
    }

    /// Output values at sample `i`.
    #[must_use]
    pub fn sample(&self, i: usize) -> Option<Vec<f64>> {
        self.columns.iter().map(|c| c.get(i).copied()).collect()
    }
}

/// How a worker distills a raw outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPolicy {
    /// Last value of each output.
    #[default]
    FinalValue,
    /// Whole time series of each output.
    FullTrajectory,
    /// The model's outcome, untouched.
    Raw,
}

impl FromStr for ResultPolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "final" | "final_value" => Ok(Self::FinalValue),
            "trajectory" | "full_trajectory" => Ok(Self::FullTrajectory),
            "raw" => Ok(Self::Raw),
            _ => Err(ConfigurationError::UnknownResultPolicy {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ResultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FinalValue => "final",
            Self::FullTrajectory => "trajectory",
            Self::Raw => "raw",
        })
    }
}

/// Distilled successful result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SimulationValue {
    /// Final output values.
    Final(#[serde(with = "crate::non_finite::seq")] Vec<f64>),
    /// Output time series.
    Trajectory(Trajectory),
    /// Untouched model outcome.
    Raw(RawOutcome),
}

impl SimulationValue {
    /// Final values, if this is [`SimulationValue::Final`].
    #[must_use]
    pub fn as_final(&self) -> Option<&[f64]> {
        match self {
            Self::Final(values) => Some(values),
            _ => None,
        }
    }

    /// Trajectory, if this is [`SimulationValue::Trajectory`].
    #[must_use]
    pub const fn as_trajectory(&self) -> Option<&Trajectory> {
        match self {
            Self::Trajectory(t) => Some(t),
            _ => None,
        }
    }
}

/// Cause of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A parameter or output name is unknown to the model.
    VariableNotFound,
    /// A parameter value is outside the model's domain.
    InvalidParameter,
    /// The model failed while simulating.
    Simulation,
    /// The worker could not load the model.
    ModelLoad,
    /// The model panicked.
    Panic,
    /// The worker process died with the request in flight.
    WorkerCrashed,
    /// The request exceeded the pool's timeout.
    Timeout,
}

impl FailureKind {
    /// Returns true for failures attributable to the request itself.
    #[must_use]
    pub const fn is_request_error(self) -> bool {
        matches!(
            self,
            Self::VariableNotFound | Self::InvalidParameter | Self::Simulation
        )
    }

    /// Returns true for failures of the worker infrastructure.
    #[must_use]
    pub const fn is_worker_failure(self) -> bool {
        matches!(self, Self::WorkerCrashed | Self::Timeout)
    }
}

/// Structured failure descriptor for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("request {index} failed ({kind:?}): {message}")]
pub struct Failure {
    /// Index of the request in its batch.
    pub index: usize,
    /// Cause.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl Failure {
    /// Creates a failure descriptor.
    #[must_use]
    pub fn new(index: usize, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn from_simulate(index: usize, err: &SimulateError) -> Self {
        let kind = match err {
            SimulateError::VariableNotFound { .. } => FailureKind::VariableNotFound,
            SimulateError::InvalidParameter { .. } => FailureKind::InvalidParameter,
            SimulateError::Solver { .. } => FailureKind::Simulation,
        };
        Self::new(index, kind, err.to_string())
    }

    pub(crate) fn from_strip(index: usize, err: &StripError) -> Self {
        let kind = match err {
            StripError::VariableNotFound { .. } => FailureKind::VariableNotFound,
            StripError::EmptyTrajectory => FailureKind::Simulation,
        };
        Self::new(index, kind, err.to_string())
    }

    pub(crate) fn from_load(index: usize, err: &LoadError) -> Self {
        Self::new(index, FailureKind::ModelLoad, err.to_string())
    }

    pub(crate) fn from_worker(index: usize, failure: &WorkerFailure) -> Self {
        let kind = match failure {
            WorkerFailure::Timeout { .. } => FailureKind::Timeout,
            WorkerFailure::Crashed { .. } | WorkerFailure::Protocol { .. } => FailureKind::WorkerCrashed,
        };
        Self::new(index, kind, failure.to_string())
    }
}

/// Result of one request, aligned to its batch index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutcome {
    /// Index of the originating request.
    pub index: usize,
    /// Distilled value or failure.
    pub result: Result<SimulationValue, Failure>,
}

impl SimulationOutcome {
    /// Returns true if the request succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        self.result.as_ref().err()
    }

    /// The value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&SimulationValue> {
        self.result.as_ref().ok()
    }
}

/// Distills a raw outcome according to `policy`.
///
/// `output_names` defaults to every recorded variable. Names may use `*` and
/// `?` wildcards; each must match at least one variable.
pub fn strip(
    raw: &RawOutcome,
    output_names: Option<&[String]>,
    policy: ResultPolicy,
) -> Result<SimulationValue, StripError> {
    match policy {
        ResultPolicy::Raw => Ok(SimulationValue::Raw(raw.clone())),
        ResultPolicy::FinalValue => {
            if raw.is_empty() {
                return Err(StripError::EmptyTrajectory);
            }
            let values = select_outputs(raw, output_names)?
                .iter()
                .map(|(_, samples)| samples.last().copied().ok_or(StripError::EmptyTrajectory))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SimulationValue::Final(values))
        }
        ResultPolicy::FullTrajectory => {
            let selected = select_outputs(raw, output_names)?;
            Ok(SimulationValue::Trajectory(Trajectory {
                time: raw.time.clone(),
                names: selected.iter().map(|(n, _)| (*n).to_string()).collect(),
                columns: selected.iter().map(|(_, s)| s.to_vec()).collect(),
            }))
        }
    }
}

fn select_outputs<'a>(
    raw: &'a RawOutcome,
    output_names: Option<&[String]>,
) -> Result<Vec<(&'a str, &'a [f64])>, StripError> {
    let Some(patterns) = output_names else {
        return Ok(raw
            .variables
            .iter()
            .map(|(n, s)| (n.as_str(), s.as_slice()))
            .collect());
    };

    let mut selected = Vec::new();
    for pattern in patterns {
        if !is_wildcard(pattern) {
            let (name, samples) = raw
                .variables
                .iter()
                .find(|(n, _)| n == pattern)
                .ok_or_else(|| StripError::VariableNotFound {
                    pattern: pattern.clone(),
                })?;
            selected.push((name.as_str(), samples.as_slice()));
            continue;
        }

        let re = wildcard_regex(pattern)?;
        let before = selected.len();
        selected.extend(
            raw.variables
                .iter()
                .filter(|(n, _)| re.is_match(n))
                .map(|(n, s)| (n.as_str(), s.as_slice())),
        );
        if selected.len() == before {
            return Err(StripError::VariableNotFound {
                pattern: pattern.clone(),
            });
        }
    }
    Ok(selected)
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

fn wildcard_regex(pattern: &str) -> Result<Regex, StripError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|_| StripError::VariableNotFound {
        pattern: pattern.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawOutcome {
        RawOutcome::new(vec![0.0, 1.0, 2.0])
            .with_variable("x", vec![1.0, 2.0, 3.0])
            .with_variable("der(x)", vec![1.0, 1.0, 1.0])
            .with_variable("y", vec![0.0, -1.0, -4.0])
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn final_value_takes_last_samples_in_filter_order() {
        let value = strip(&raw(), Some(&names(&["y", "x"])), ResultPolicy::FinalValue).unwrap();
        assert_eq!(value, SimulationValue::Final(vec![-4.0, 3.0]));
    }

    #[test]
    fn missing_output_is_variable_not_found() {
        let err = strip(&raw(), Some(&names(&["z"])), ResultPolicy::FinalValue).unwrap_err();
        assert_eq!(
            err,
            StripError::VariableNotFound {
                pattern: "z".to_string()
            }
        );
    }

    #[test]
    fn trajectory_last_sample_matches_final_value() {
        let filter = names(&["x", "y"]);
        let final_value = strip(&raw(), Some(&filter), ResultPolicy::FinalValue).unwrap();
        let trajectory = strip(&raw(), Some(&filter), ResultPolicy::FullTrajectory).unwrap();
        let last = trajectory.as_trajectory().unwrap().last_sample().unwrap();
        assert_eq!(final_value.as_final().unwrap(), last.as_slice());
    }

    #[test]
    fn raw_policy_is_identity() {
        let value = strip(&raw(), Some(&names(&["nothing"])), ResultPolicy::Raw).unwrap();
        assert_eq!(value, SimulationValue::Raw(raw()));
    }

    #[test]
    fn wildcards_expand_in_model_order() {
        let value = strip(&raw(), Some(&names(&["der(*)", "?"])), ResultPolicy::FinalValue).unwrap();
        assert_eq!(value, SimulationValue::Final(vec![1.0, 3.0, -4.0]));

        let err = strip(&raw(), Some(&names(&["q*"])), ResultPolicy::FinalValue).unwrap_err();
        assert!(matches!(err, StripError::VariableNotFound { .. }));
    }

    #[test]
    fn literal_and_wildcard_names_mix_in_trajectory() {
        let filter = names(&["y", "der(*)"]);
        let value = strip(&raw(), Some(&filter), ResultPolicy::FullTrajectory).unwrap();
        let trajectory = value.as_trajectory().unwrap();
        assert_eq!(trajectory.names, names(&["y", "der(x)"]));
        assert_eq!(trajectory.columns[0], vec![0.0, -1.0, -4.0]);
    }

    #[test]
    fn non_finite_results_serialize_intact() {
        let nan = RawOutcome::new(vec![0.0, 1.0]).with_variable("y", vec![f64::INFINITY, f64::NAN]);
        let value = strip(&nan, None, ResultPolicy::FullTrajectory).unwrap();
        let json = serde_json::to_string(&value).unwrap();
        let back: SimulationValue = serde_json::from_str(&json).unwrap();
        let columns = &back.as_trajectory().unwrap().columns;
        assert_eq!(columns[0][0], f64::INFINITY);
        assert!(columns[0][1].is_nan());

        let json = serde_json::to_string(&SimulationValue::Final(vec![f64::NEG_INFINITY])).unwrap();
        let back: SimulationValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_final(), Some(&[f64::NEG_INFINITY][..]));

        let json = serde_json::to_string(&SimulationValue::Raw(nan)).unwrap();
        let SimulationValue::Raw(back) = serde_json::from_str(&json).unwrap() else {
            panic!("expected raw outcome");
        };
        assert!(back.get("y").unwrap()[1].is_nan());
    }

    #[test]
    fn no_filter_selects_everything() {
        let value = strip(&raw(), None, ResultPolicy::FullTrajectory).unwrap();
        let trajectory = value.as_trajectory().unwrap();
        assert_eq!(trajectory.names, names(&["x", "der(x)", "y"]));
        assert_eq!(trajectory.sample(1), Some(vec![2.0, 1.0, -1.0]));
    }

    #[test]
    fn empty_outcome_has_no_final_value() {
        let empty = RawOutcome::new(Vec::new()).with_variable("x", Vec::new());
        assert_eq!(
            strip(&empty, None, ResultPolicy::FinalValue).unwrap_err(),
            StripError::EmptyTrajectory
        );
    }

    #[test]
    fn distillation_is_deterministic() {
        let filter = names(&["x"]);
        let a = strip(&raw(), Some(&filter), ResultPolicy::FullTrajectory).unwrap();
        let b = strip(&raw(), Some(&filter), ResultPolicy::FullTrajectory).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn result_policy_parses_and_rejects() {
        assert_eq!("final".parse::<ResultPolicy>().unwrap(), ResultPolicy::FinalValue);
        assert_eq!(" Trajectory ".parse::<ResultPolicy>().unwrap(), ResultPolicy::FullTrajectory);
        assert_eq!("raw".parse::<ResultPolicy>().unwrap(), ResultPolicy::Raw);
        assert!(matches!(
            "median".parse::<ResultPolicy>(),
            Err(ConfigurationError::UnknownResultPolicy { .. })
        ));
        assert_eq!(ResultPolicy::FullTrajectory.to_string(), "trajectory");
    }

    #[test]
    fn failure_kinds_are_classified() {
        let f = Failure::from_simulate(
            4,
            &SimulateError::InvalidParameter {
                name: "E".to_string(),
                reason: "negative".to_string(),
            },
        );
        assert_eq!(f.index, 4);
        assert_eq!(f.kind, FailureKind::InvalidParameter);
        assert!(f.kind.is_request_error());

        let f = Failure::from_worker(
            1,
            &WorkerFailure::Timeout {
                worker: 0,
                duration_ms: 10,
            },
        );
        assert_eq!(f.kind, FailureKind::Timeout);
        assert!(f.kind.is_worker_failure());
        assert!(!FailureKind::ModelLoad.is_worker_failure());
    }
}
