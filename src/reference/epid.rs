//! SIR epidemic model.

use super::driven_columns;
use crate::error::SimulateError;
use crate::model::ModelHandle;
use crate::outcome::RawOutcome;
use crate::request::{InputTrajectory, SimulationRequest};

/// Largest internal integration step.
const MAX_STEP: f64 = 0.01;

const PARAMETERS: [&str; 3] = ["infection_rate", "healing_rate", "total_population"];
const STATES: [&str; 3] = ["susceptible", "infected", "removed"];

/// Susceptible/infected/removed compartments integrated with RK4.
///
/// Bindings to a state name set its start value; `susceptible` defaults to
/// whatever `total_population` leaves over. `infection_rate` and
/// `healing_rate` may be driven by an input trajectory.
#[derive(Debug, Clone)]
pub struct Epidemic {
    infection_rate: f64,
    healing_rate: f64,
    total_population: f64,
    infected: f64,
    removed: f64,
}

impl Default for Epidemic {
    fn default() -> Self {
        Self {
            infection_rate: 2.0,
            healing_rate: 0.5,
            total_population: 763.0,
            infected: 1.0,
            removed: 0.0,
        }
    }
}

struct Setup {
    rates: [f64; 2],
    population: f64,
    start: [f64; 3],
}

impl Epidemic {
    fn setup(&self, request: &SimulationRequest) -> Result<Setup, SimulateError> {
        let mut rates = [self.infection_rate, self.healing_rate];
        let mut population = self.total_population;
        let mut susceptible = None;
        let mut infected = self.infected;
        let mut removed = self.removed;

        for (name, value) in &request.parameters {
            match name.as_str() {
                "infection_rate" => rates[0] = *value,
                "healing_rate" => rates[1] = *value,
                "total_population" => population = *value,
                "susceptible" => susceptible = Some(*value),
                "infected" => infected = *value,
                "removed" => removed = *value,
                _ => {
                    return Err(SimulateError::VariableNotFound { name: name.clone() });
                }
            }
        }

        for (name, rate) in PARAMETERS.iter().zip(rates) {
            check_non_negative(name, rate)?;
        }
        if !(population.is_finite() && population > 0.0) {
            return Err(SimulateError::InvalidParameter {
                name: "total_population".to_string(),
                reason: format!("must be positive, got {population}"),
            });
        }
        check_non_negative("infected", infected)?;
        check_non_negative("removed", removed)?;
        let susceptible = susceptible.unwrap_or(population - infected - removed);
        check_non_negative("susceptible", susceptible)?;

        Ok(Setup {
            rates,
            population,
            start: [susceptible, infected, removed],
        })
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<(), SimulateError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SimulateError::InvalidParameter {
            name: name.to_string(),
            reason: format!("must be a non-negative number, got {value}"),
        })
    }
}

fn derivative(state: [f64; 3], beta: f64, gamma: f64, population: f64) -> [f64; 3] {
    let [s, i, _] = state;
    let infection = beta * s * i / population;
    let healing = gamma * i;
    [-infection, infection - healing, healing]
}

fn axpy(state: [f64; 3], k: [f64; 3], h: f64) -> [f64; 3] {
    [state[0] + h * k[0], state[1] + h * k[1], state[2] + h * k[2]]
}

/// Rates at time `t`, with driven columns replacing the constants.
fn rates_at(base: [f64; 2], input: Option<(&InputTrajectory, &[(usize, usize)])>, t: f64) -> [f64; 2] {
    let mut rates = base;
    if let Some((input, driven)) = input {
        for &(slot, column) in driven {
            rates[slot] = input.value_at(column, t);
        }
    }
    rates
}

impl ModelHandle for Epidemic {
    fn variables(&self) -> Vec<String> {
        PARAMETERS
            .iter()
            .chain(STATES.iter())
            .map(|n| (*n).to_string())
            .collect()
    }

    fn simulate(&mut self, request: &SimulationRequest) -> Result<RawOutcome, SimulateError> {
        let setup = self.setup(request)?;
        let time = request.options.time_grid(0.0, 50.0, 500)?;

        let driven = match &request.options.input {
            Some(input) => driven_columns(input, |name| match name {
                "infection_rate" => Ok(0),
                "healing_rate" => Ok(1),
                _ => Err(SimulateError::VariableNotFound {
                    name: name.to_string(),
                }),
            })?,
            None => Vec::new(),
        };
        let input = request.options.input.as_ref().map(|i| (i, driven.as_slice()));

        let mut rate_columns = [Vec::with_capacity(time.len()), Vec::with_capacity(time.len())];
        let mut state_columns = [
            Vec::with_capacity(time.len()),
            Vec::with_capacity(time.len()),
            Vec::with_capacity(time.len()),
        ];

        let mut state = setup.start;
        let mut previous = time.first().copied().unwrap_or_default();
        for &t in &time {
            let span = t - previous;
            if span > 0.0 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
                let steps = (span / MAX_STEP).ceil().max(1.0) as usize;
                #[allow(clippy::cast_precision_loss)]
                let h = span / steps as f64;
                for step in 0..steps {
                    #[allow(clippy::cast_precision_loss)]
                    let t0 = previous + h * step as f64;
                    let rk = |tau: f64, s: [f64; 3]| {
                        let [beta, gamma] = rates_at(setup.rates, input, tau);
                        derivative(s, beta, gamma, setup.population)
                    };
                    let k1 = rk(t0, state);
                    let k2 = rk(t0 + h / 2.0, axpy(state, k1, h / 2.0));
                    let k3 = rk(t0 + h / 2.0, axpy(state, k2, h / 2.0));
                    let k4 = rk(t0 + h, axpy(state, k3, h));
                    for c in 0..3 {
                        state[c] += h / 6.0 * (k1[c] + 2.0 * k2[c] + 2.0 * k3[c] + k4[c]);
                    }
                }
                if state.iter().any(|v| !v.is_finite()) {
                    return Err(SimulateError::solver(format!("state diverged at t={t}")));
                }
            }
            previous = t;

            let rates = rates_at(setup.rates, input, t);
            for (column, value) in rate_columns.iter_mut().zip(rates) {
                column.push(value);
            }
            for (column, value) in state_columns.iter_mut().zip(state) {
                column.push(value);
            }
        }

        let [infection, healing] = rate_columns;
        let [susceptible, infected, removed] = state_columns;
        let population = vec![setup.population; time.len()];
        Ok(RawOutcome::new(time)
            .with_variable("infection_rate", infection)
            .with_variable("healing_rate", healing)
            .with_variable("total_population", population)
            .with_variable("susceptible", susceptible)
            .with_variable("infected", infected)
            .with_variable("removed", removed))
    }
}
