//! Step runtime
//!
//! This crate keeps the authoritative set of steps and flows, and binds
//! steps to their triggers: event steps to bus topics, cron steps to timers.

mod binder;
mod registry;
mod runtime;
mod schedule;

pub use binder::StepBinder;
pub use registry::{FlowCallback, FlowEvent, MutationOptions, StepCallback, StepEvent, StepRegistry};
pub use runtime::{RuntimeConfig, StepRuntime};
pub use schedule::{CronError, CronSchedule};
