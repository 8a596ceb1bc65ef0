//! Core abstractions for the step runtime
//!
//! Step and flow data model, admission validation, the topic event bus,
//! structured step logging, and the capability traits (state, streams,
//! execution) that the runtime and gateway crates build on.

mod error;
pub mod events;
mod executor;
mod flow;
mod logging;
mod state;
mod step;
mod stream;
mod validate;

pub use error::{ExecutionError, FieldError, StepError, StoreError, ValidationError};
pub use events::*;
pub use executor::{Invocation, StepExecutor};
pub use flow::Flow;
pub use logging::{LogLevel, LogRecord, LogStream, StepLogger};
pub use state::{MemoryStateStore, StateStore};
pub use step::{
    ApiConfig, ApiMethod, CronConfig, Emit, EventConfig, NoopConfig, QueryParam, Step, StepConfig,
    StepKind,
};
pub use stream::{DataStream, MemoryStream, StreamRegistry};
pub use validate::validate_step;

/// Result type for step operations
pub type Result<T> = std::result::Result<T, StepError>;
