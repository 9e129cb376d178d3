//! Application layer: services generic over the ports.

pub mod controller;
pub mod reporter;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{BatchController, CancelOutcome, ControllerSettings, ParameterOutcome};
pub use runner::{JobExecutor, JobRunner, RunnerSettings};
pub use scheduler::{AdmissionPolicy, Scheduler};
