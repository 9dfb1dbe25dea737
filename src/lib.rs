//! # fmupool - Multi-process simulation pool
//!
//! Runs batches of independent model simulations across a fixed number of
//! worker processes. Every worker loads its own handle for one shared model, so
//! a faulting native solver takes down at most its own process.
//!
//! ## Core Concepts
//!
//! - **ModelRef**: The shareable, serializable description of a model to load
//! - **SimulationRequest**: Parameter bindings plus per-run options
//! - **ResultPolicy**: How a raw trajectory is distilled (final value, trajectory, raw)
//! - **SimulationOutcome**: Value or per-request failure, returned in request order
//! - **SimulationPool**: The coordinator owning the worker processes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fmupool::{ModelRef, PoolConfig, ResultPolicy, SimulationPool, SimulationRequest};
//!
//! let mut pool = SimulationPool::new(ModelRef::new("deviation.fmu"), PoolConfig::new(4))?;
//! let requests: Vec<_> = [3.0e7, 3.5e7]
//!     .iter()
//!     .map(|e| SimulationRequest::new().parameter("E", *e).filter(["y"]))
//!     .collect();
//! for outcome in pool.run(&requests, ResultPolicy::FinalValue)? {
//!     println!("{}: {:?}", outcome.index, outcome.result);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod model;
mod non_finite;
pub mod outcome;
pub mod platform;
pub mod pool;
pub mod protocol;
pub mod reference;
pub mod request;
pub mod worker;

pub use config::{PoolConfig, WorkerProgram};
pub use error::{
    ConfigurationError, LoadError, PoolError, PoolResult, SimulateError, StripError, WorkerFailure,
};
pub use model::{ModelHandle, ModelLoader, ModelRef};
pub use outcome::{
    strip, Failure, FailureKind, RawOutcome, ResultPolicy, SimulationOutcome, SimulationValue,
    Trajectory,
};
pub use platform::PlatformKey;
pub use pool::{BatchReport, SimulationPool};
pub use reference::ReferenceLoader;
pub use request::{batch_from_sample, InputTrajectory, SimulationOptions, SimulationRequest, TimeSpec};
