//! Ishigami test function.

use super::{finite, StaticModel};
use crate::error::SimulateError;

const A: f64 = 7.0;
const B: f64 = 0.05;

/// `f = sin x1 + 7 sin² x2 + 0.05 x3⁴ sin x1`.
#[must_use]
pub fn ishigami() -> StaticModel {
    StaticModel {
        inputs: vec![("x1", 1.0), ("x2", 1.0), ("x3", 1.0)],
        output: "f",
        eval: eval_ishigami,
    }
}

#[allow(clippy::unnecessary_wraps)]
fn eval_ishigami(x: &[f64]) -> Result<f64, SimulateError> {
    let (x1, x2, x3) = (x[0], x[1], x[2]);
    finite("f", x1.sin() + A * x2.sin().powi(2) + B * x3.powi(4) * x1.sin())
}
