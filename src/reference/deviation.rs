//! Cantilever beam deviation.

use super::{finite, StaticModel};
use crate::error::SimulateError;

/// Tip deviation `y = F·L³ / (3·E·I)` of a cantilever beam.
///
/// Inputs: Young's modulus `E`, load `F`, length `L`, section modulus `I`.
#[must_use]
pub fn deviation() -> StaticModel {
    StaticModel {
        inputs: vec![("E", 3.0e7), ("F", 3.0e4), ("L", 250.0), ("I", 400.0)],
        output: "y",
        eval: eval_deviation,
    }
}

fn eval_deviation(x: &[f64]) -> Result<f64, SimulateError> {
    let (e, f, l, i) = (x[0], x[1], x[2], x[3]);
    let stiffness = 3.0 * e * i;
    if stiffness == 0.0 {
        return Err(SimulateError::solver("division by zero: E·I must be non-zero"));
    }
    finite("y", f * l * l * l / stiffness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelHandle;
    use crate::request::SimulationRequest;

    #[test]
    fn default_point_matches_closed_form() {
        let raw = deviation().simulate(&SimulationRequest::new()).unwrap();
        let y = *raw.get("y").unwrap().last().unwrap();
        assert!((y - 13.020_833_333_333_334).abs() < 1e-9);
        assert_eq!(raw.len(), 501);
    }

    #[test]
    fn zero_modulus_is_a_solver_error() {
        let err = deviation()
            .simulate(&SimulationRequest::new().parameter("E", 0.0))
            .unwrap_err();
        assert!(matches!(err, SimulateError::Solver { .. }));
    }

    #[test]
    fn bindings_are_reset_between_runs() {
        let mut model = deviation();
        let doubled = model
            .simulate(&SimulationRequest::new().parameter("F", 6.0e4).ncp(1))
            .unwrap();
        let default = model.simulate(&SimulationRequest::new().ncp(1)).unwrap();
        let ratio = doubled.get("y").unwrap()[1] / default.get("y").unwrap()[1];
        assert!((ratio - 2.0).abs() < 1e-12);
    }
}
