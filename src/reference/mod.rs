//! Reference models.
//!
//! Pure-Rust surrogates for the example FMUs, so a pool can be exercised end to
//! end without a native FMI backend. [`ReferenceLoader`] picks a model by the
//! file stem of the [`ModelRef`] path (`deviation.fmu`, `epid`, ...).
//!
//! Loader option `native_faults: true` makes a solver failure abort the worker
//! process, the way a faulting native library takes its host down.

mod deviation;
mod epid;
mod ishigami;

pub use deviation::deviation;
pub use epid::Epidemic;
pub use ishigami::ishigami;

use tracing::error;

use crate::error::{LoadError, SimulateError};
use crate::model::{ModelHandle, ModelLoader, ModelRef};
use crate::outcome::RawOutcome;
use crate::platform::PlatformKey;
use crate::request::{InputTrajectory, SimulationRequest};

/// Names of the bundled models.
pub const MODEL_NAMES: [&str; 3] = ["deviation", "epid", "ishigami"];

/// Loads the bundled reference models.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceLoader;

impl ModelLoader for ReferenceLoader {
    fn load(&self, model: &ModelRef, _platform: &PlatformKey) -> Result<Box<dyn ModelHandle>, LoadError> {
        let handle: Box<dyn ModelHandle> = match model.stem() {
            Some("deviation") => Box::new(deviation()),
            Some("epid") => Box::new(Epidemic::default()),
            Some("ishigami") => Box::new(ishigami()),
            _ => {
                return Err(model.load_error(format!(
                    "unknown reference model (expected one of: {})",
                    MODEL_NAMES.join(", ")
                )))
            }
        };

        if model.flag("native_faults") {
            return Ok(Box::new(Faulting(handle)));
        }
        Ok(handle)
    }
}

/// Aborts the process on solver failure.
struct Faulting(Box<dyn ModelHandle>);

impl ModelHandle for Faulting {
    fn variables(&self) -> Vec<String> {
        self.0.variables()
    }

    fn simulate(&mut self, request: &SimulationRequest) -> Result<RawOutcome, SimulateError> {
        match self.0.simulate(request) {
            Err(SimulateError::Solver { message }) => {
                error!(%message, "native fault, aborting worker");
                std::process::abort();
            }
            other => other,
        }
    }
}

/// Algebraic model `y = f(inputs)`, evaluated at every output time point.
pub struct StaticModel {
    inputs: Vec<(&'static str, f64)>,
    output: &'static str,
    eval: fn(&[f64]) -> Result<f64, SimulateError>,
}

impl StaticModel {
    fn values(&self, request: &SimulationRequest) -> Result<Vec<f64>, SimulateError> {
        let mut values: Vec<f64> = self.inputs.iter().map(|(_, v)| *v).collect();
        for (name, value) in &request.parameters {
            let slot = self.index_of(name)?;
            values[slot] = *value;
        }
        Ok(values)
    }

    fn index_of(&self, name: &str) -> Result<usize, SimulateError> {
        self.inputs
            .iter()
            .position(|(n, _)| *n == name)
            .ok_or_else(|| SimulateError::VariableNotFound {
                name: name.to_string(),
            })
    }
}

impl ModelHandle for StaticModel {
    fn variables(&self) -> Vec<String> {
        self.inputs
            .iter()
            .map(|(n, _)| (*n).to_string())
            .chain(std::iter::once(self.output.to_string()))
            .collect()
    }

    fn simulate(&mut self, request: &SimulationRequest) -> Result<RawOutcome, SimulateError> {
        let base = self.values(request)?;
        let time = request.options.time_grid(0.0, 1.0, 500)?;
        let input = request.options.input.as_ref();
        let driven = match input {
            Some(input) => driven_columns(input, |name| self.index_of(name))?,
            None => Vec::new(),
        };

        let mut columns = vec![Vec::with_capacity(time.len()); self.inputs.len() + 1];
        let mut row = base;
        for &t in &time {
            if let Some(input) = input {
                for &(slot, column) in &driven {
                    row[slot] = input.value_at(column, t);
                }
            }
            let y = (self.eval)(&row)?;
            for (slot, value) in row.iter().enumerate() {
                columns[slot].push(*value);
            }
            columns[self.inputs.len()].push(y);
        }

        let mut outcome = RawOutcome::new(time);
        for (name, samples) in self.variables().into_iter().zip(columns) {
            outcome = outcome.with_variable(name, samples);
        }
        Ok(outcome)
    }
}

/// Maps trajectory columns onto model slots.
fn driven_columns(
    input: &InputTrajectory,
    index_of: impl Fn(&str) -> Result<usize, SimulateError>,
) -> Result<Vec<(usize, usize)>, SimulateError> {
    if let Some(row) = input.values.iter().find(|row| row.len() != input.names.len()) {
        return Err(SimulateError::InvalidParameter {
            name: "input".to_string(),
            reason: format!("row has {} values for {} inputs", row.len(), input.names.len()),
        });
    }
    input
        .names
        .iter()
        .enumerate()
        .map(|(column, name)| Ok((index_of(name)?, column)))
        .collect()
}

fn finite(name: &str, value: f64) -> Result<f64, SimulateError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SimulateError::solver(format!("{name} is not finite")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_selects_by_file_stem() {
        let platform = PlatformKey::detect();
        let handle = ReferenceLoader
            .load(&ModelRef::new("/models/linux64/deviation.fmu"), &platform)
            .ok()
            .unwrap();
        assert_eq!(handle.variables(), vec!["E", "F", "L", "I", "y"]);

        let handle = ReferenceLoader.load(&ModelRef::new("epid"), &platform).ok().unwrap();
        assert!(handle.variables().contains(&"infected".to_string()));
    }

    #[test]
    fn loader_rejects_unknown_models() {
        let err = ReferenceLoader
            .load(&ModelRef::new("bouncing_ball.fmu"), &PlatformKey::detect())
            .err()
            .unwrap();
        assert!(err.message.contains("deviation, epid, ishigami"));
    }

    #[test]
    fn static_model_rejects_unknown_binding() {
        let mut model = ishigami();
        let err = model
            .simulate(&SimulationRequest::new().parameter("x4", 1.0))
            .unwrap_err();
        assert_eq!(err, SimulateError::VariableNotFound { name: "x4".to_string() });
    }

    #[test]
    fn static_model_follows_input_trajectory() {
        let names = vec!["F".to_string()];
        let rows = vec![vec![1.0e4], vec![3.0e4]];
        let request = SimulationRequest::from_trajectory(
            &names,
            &rows,
            &crate::request::TimeSpec::grid(vec![0.0, 2.0]),
        )
        .unwrap()
        .ncp(2);

        let raw = deviation().simulate(&request).unwrap();
        assert_eq!(raw.time, vec![0.0, 1.0, 2.0]);
        assert_eq!(raw.get("F").unwrap(), &[1.0e4, 2.0e4, 3.0e4]);
        let y = raw.get("y").unwrap();
        assert!((y[2] / y[0] - 3.0).abs() < 1e-12);
    }
}
