//! Simulation requests.
//!
//! A [`SimulationRequest`] describes one model invocation: ordered parameter
//! bindings plus a [`SimulationOptions`] bag. Requests are plain data; they are
//! serialized to the worker process that executes them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, SimulateError};

/// Time axis of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeSpec {
    /// Explicit, non-decreasing time points.
    Grid {
        /// Time points in seconds.
        #[serde(with = "crate::non_finite::seq")]
        points: Vec<f64>,
    },
    /// `count` points spaced by `timestep`, starting at zero.
    Steps {
        /// Spacing in seconds.
        #[serde(with = "crate::non_finite::scalar")]
        timestep: f64,
        /// Number of points.
        count: usize,
    },
}

impl TimeSpec {
    /// Explicit grid.
    #[must_use]
    pub fn grid(points: Vec<f64>) -> Self {
        Self::Grid { points }
    }

    /// Regular grid of `count` points.
    #[must_use]
    pub const fn steps(timestep: f64, count: usize) -> Self {
        Self::Steps { timestep, count }
    }

    /// Checks that at least one finite, ordered time point is described.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::Grid { points } => {
                if points.is_empty() {
                    return Err(ConfigurationError::InvalidTimeSpec {
                        reason: "time grid is empty".to_string(),
                    });
                }
                if points.iter().any(|t| !t.is_finite()) {
                    return Err(ConfigurationError::InvalidTimeSpec {
                        reason: "time grid contains non-finite values".to_string(),
                    });
                }
                if points.windows(2).any(|w| w[1] < w[0]) {
                    return Err(ConfigurationError::InvalidTimeSpec {
                        reason: "time grid must be non-decreasing".to_string(),
                    });
                }
                Ok(())
            }
            Self::Steps { timestep, count } => {
                if !timestep.is_finite() || *timestep <= 0.0 {
                    return Err(ConfigurationError::InvalidTimeSpec {
                        reason: format!("timestep must be positive, got {timestep}"),
                    });
                }
                if *count == 0 {
                    return Err(ConfigurationError::InvalidTimeSpec {
                        reason: "step count must be positive".to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Materializes the time points.
    #[must_use]
    pub fn points(&self) -> Vec<f64> {
        match self {
            Self::Grid { points } => points.clone(),
            #[allow(clippy::cast_precision_loss)]
            Self::Steps { timestep, count } => (0..*count).map(|i| i as f64 * timestep).collect(),
        }
    }

    /// Number of points described.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Grid { points } => points.len(),
            Self::Steps { count, .. } => *count,
        }
    }

    /// Returns true if no point is described.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Time-varying input data, one row per time point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTrajectory {
    /// Input variable names, one per column.
    pub names: Vec<String>,
    /// Time points, one per row.
    #[serde(with = "crate::non_finite::seq")]
    pub time: Vec<f64>,
    /// Rows of input values.
    #[serde(with = "crate::non_finite::rows")]
    pub values: Vec<Vec<f64>>,
}

impl InputTrajectory {
    /// Column index of an input variable.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Linearly interpolated value of `column` at time `t`, held constant outside the data.
    #[must_use]
    pub fn value_at(&self, column: usize, t: f64) -> f64 {
        let n = self.time.len().min(self.values.len());
        if n == 0 {
            return f64::NAN;
        }
        if t <= self.time[0] {
            return self.values[0][column];
        }
        if t >= self.time[n - 1] {
            return self.values[n - 1][column];
        }
        // First index with time > t; exists because t < time[n - 1].
        let hi = self.time[..n].partition_point(|&x| x <= t);
        let lo = hi - 1;
        let (t0, t1) = (self.time[lo], self.time[hi]);
        let (v0, v1) = (self.values[lo][column], self.values[hi][column]);
        if t1 <= t0 {
            return v1;
        }
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }
}

/// Per-request simulation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationOptions {
    /// Output variables to keep; entries may contain `*` and `?` wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<String>>,
    /// Number of communication intervals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ncp: Option<usize>,
    /// Start time override.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::non_finite::option")]
    pub start_time: Option<f64>,
    /// Final time override.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::non_finite::option")]
    pub final_time: Option<f64>,
    /// Explicit output time axis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeSpec>,
    /// Time-varying inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputTrajectory>,
    /// Backend-specific options, passed through uninterpreted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SimulationOptions {
    /// Output time points for a model with the given defaults.
    ///
    /// An explicit [`TimeSpec`] wins; otherwise `[start, final]` is split into
    /// `ncp` intervals.
    pub fn time_grid(
        &self,
        default_start: f64,
        default_final: f64,
        default_ncp: usize,
    ) -> Result<Vec<f64>, SimulateError> {
        if let Some(spec) = &self.time {
            spec.validate().map_err(|e| SimulateError::InvalidParameter {
                name: "time".to_string(),
                reason: e.to_string(),
            })?;
            return Ok(spec.points());
        }

        let start = self.start_time.unwrap_or(default_start);
        let end = self.final_time.unwrap_or(default_final);
        let ncp = self.ncp.unwrap_or(default_ncp).max(1);
        if !start.is_finite() || !end.is_finite() || end < start {
            return Err(SimulateError::InvalidParameter {
                name: "final_time".to_string(),
                reason: format!("final time {end} precedes start time {start}"),
            });
        }
        #[allow(clippy::cast_precision_loss)]
        let points = (0..=ncp)
            .map(|i| start + (end - start) * (i as f64) / (ncp as f64))
            .collect();
        Ok(points)
    }
}

/// One simulation to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    /// Ordered `(name, value)` bindings applied before simulating.
    #[serde(with = "crate::non_finite::named")]
    pub parameters: Vec<(String, f64)>,
    /// Simulation options.
    #[serde(default)]
    pub options: SimulationOptions,
}

impl SimulationRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an input vector to named inputs.
    pub fn from_point(input_names: &[String], values: &[f64]) -> Result<Self, ConfigurationError> {
        if input_names.len() != values.len() {
            return Err(ConfigurationError::InputDimensionMismatch {
                expected: input_names.len(),
                actual: values.len(),
            });
        }
        Ok(Self {
            parameters: input_names.iter().cloned().zip(values.iter().copied()).collect(),
            options: SimulationOptions::default(),
        })
    }

    /// Drives named inputs with rows of values over a time axis.
    ///
    /// The simulation interval is set to the first and last time points.
    pub fn from_trajectory(
        input_names: &[String],
        rows: &[Vec<f64>],
        time: &TimeSpec,
    ) -> Result<Self, ConfigurationError> {
        time.validate()?;
        if time.len() != rows.len() {
            return Err(ConfigurationError::InvalidTimeSpec {
                reason: format!("{} time points for {} input rows", time.len(), rows.len()),
            });
        }
        if let Some(row) = rows.iter().find(|row| row.len() != input_names.len()) {
            return Err(ConfigurationError::InputDimensionMismatch {
                expected: input_names.len(),
                actual: row.len(),
            });
        }

        let points = time.points();
        let options = SimulationOptions {
            start_time: points.first().copied(),
            final_time: points.last().copied(),
            input: Some(InputTrajectory {
                names: input_names.to_vec(),
                time: points,
                values: rows.to_vec(),
            }),
            ..SimulationOptions::default()
        };
        Ok(Self {
            parameters: Vec::new(),
            options,
        })
    }

    /// Appends a parameter binding.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.parameters.push((name.into(), value));
        self
    }

    /// Restricts the outputs.
    #[must_use]
    pub fn filter<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.filter = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the number of communication intervals.
    #[must_use]
    pub const fn ncp(mut self, ncp: usize) -> Self {
        self.options.ncp = Some(ncp);
        self
    }

    /// Overrides the start time.
    #[must_use]
    pub const fn start_time(mut self, t: f64) -> Self {
        self.options.start_time = Some(t);
        self
    }

    /// Overrides the final time.
    #[must_use]
    pub const fn final_time(mut self, t: f64) -> Self {
        self.options.final_time = Some(t);
        self
    }

    /// Sets an explicit time axis.
    #[must_use]
    pub fn time(mut self, spec: TimeSpec) -> Self {
        self.options.time = Some(spec);
        self
    }

    /// Adds a backend-specific option.
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.extra.insert(key.into(), value);
        self
    }

    /// Value bound to `name`; later bindings override earlier ones.
    #[must_use]
    pub fn parameter_value(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Output filter, if any.
    #[must_use]
    pub fn output_names(&self) -> Option<&[String]> {
        self.options.filter.as_deref()
    }
}

/// Builds one request per sample point, sharing `options`.
pub fn batch_from_sample(
    input_names: &[String],
    sample: &[Vec<f64>],
    options: &SimulationOptions,
) -> Result<Vec<SimulationRequest>, ConfigurationError> {
    if sample.is_empty() {
        return Err(ConfigurationError::EmptyBatch);
    }
    sample
        .iter()
        .map(|point| {
            let mut request = SimulationRequest::from_point(input_names, point)?;
            request.options = options.clone();
            Ok(request)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn from_point_binds_in_order() {
        let req = SimulationRequest::from_point(&names(&["E", "F"]), &[3.0e7, 3.0e4]).unwrap();
        assert_eq!(
            req.parameters,
            vec![("E".to_string(), 3.0e7), ("F".to_string(), 3.0e4)]
        );
    }

    #[test]
    fn from_point_rejects_dimension_mismatch() {
        let err = SimulationRequest::from_point(&names(&["E", "F"]), &[1.0]).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::InputDimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn from_trajectory_derives_interval_from_steps() {
        let rows = vec![vec![1.0], vec![2.0], vec![4.0]];
        let req =
            SimulationRequest::from_trajectory(&names(&["u"]), &rows, &TimeSpec::steps(0.5, 3)).unwrap();
        assert_eq!(req.options.start_time, Some(0.0));
        assert_eq!(req.options.final_time, Some(1.0));
        let input = req.options.input.unwrap();
        assert_eq!(input.time, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn from_trajectory_rejects_row_count_mismatch() {
        let rows = vec![vec![1.0], vec![2.0]];
        let err = SimulationRequest::from_trajectory(&names(&["u"]), &rows, &TimeSpec::steps(1.0, 3))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidTimeSpec { .. }));
    }

    #[test]
    fn time_spec_validation() {
        assert!(TimeSpec::grid(vec![]).validate().is_err());
        assert!(TimeSpec::grid(vec![0.0, 2.0, 1.0]).validate().is_err());
        assert!(TimeSpec::steps(0.0, 4).validate().is_err());
        assert!(TimeSpec::steps(1.0, 0).validate().is_err());
        TimeSpec::grid(vec![0.0, 1.0, 1.0]).validate().unwrap();
    }

    #[test]
    fn input_trajectory_interpolates_and_holds() {
        let input = InputTrajectory {
            names: names(&["u"]),
            time: vec![0.0, 1.0, 3.0],
            values: vec![vec![0.0], vec![10.0], vec![20.0]],
        };
        assert_eq!(input.value_at(0, -1.0), 0.0);
        assert!((input.value_at(0, 0.5) - 5.0).abs() < 1e-12);
        assert!((input.value_at(0, 2.0) - 15.0).abs() < 1e-12);
        assert_eq!(input.value_at(0, 9.0), 20.0);
    }

    #[test]
    fn time_grid_uses_defaults_and_overrides() {
        let options = SimulationOptions::default();
        let grid = options.time_grid(0.0, 1.0, 4).unwrap();
        assert_eq!(grid, vec![0.0, 0.25, 0.5, 0.75, 1.0]);

        let options = SimulationOptions {
            final_time: Some(2.0),
            ncp: Some(2),
            ..SimulationOptions::default()
        };
        assert_eq!(options.time_grid(0.0, 1.0, 500).unwrap(), vec![0.0, 1.0, 2.0]);

        let options = SimulationOptions {
            start_time: Some(3.0),
            final_time: Some(1.0),
            ..SimulationOptions::default()
        };
        assert!(options.time_grid(0.0, 1.0, 10).is_err());
    }

    #[test]
    fn later_binding_wins() {
        let req = SimulationRequest::new().parameter("x", 1.0).parameter("x", 2.0);
        assert_eq!(req.parameter_value("x"), Some(2.0));
        assert_eq!(req.parameter_value("y"), None);
    }

    #[test]
    fn batch_from_sample_shares_options() {
        let options = SimulationOptions {
            filter: Some(names(&["y"])),
            ..SimulationOptions::default()
        };
        let batch =
            batch_from_sample(&names(&["a", "b"]), &[vec![1.0, 2.0], vec![3.0, 4.0]], &options).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].parameter_value("b"), Some(4.0));
        assert_eq!(batch[1].output_names(), Some(&names(&["y"])[..]));

        assert_eq!(
            batch_from_sample(&names(&["a"]), &[], &options).unwrap_err(),
            ConfigurationError::EmptyBatch
        );
    }

    #[test]
    fn options_skip_empty_fields_when_serialized() {
        let req = SimulationRequest::new().parameter("x", 1.0);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["options"], serde_json::json!({}));
    }
}
