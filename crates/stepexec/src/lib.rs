//! Step execution
//!
//! Runs each step invocation in its own worker process, selected by the
//! step file's extension, and serves the worker's calls back into the host
//! (state, events, logs, streams) over an RPC channel.

mod arena;
mod capabilities;
mod config;
mod gateway;
pub mod rpc;
mod runner;
pub mod transport;

pub use arena::{WorkerArena, WorkerGuard, WorkerPhase, WorkerRecord};
pub use config::{GatewayConfig, TransportChoice};
pub use gateway::ExecutionGateway;
pub use rpc::{RpcChannel, RpcError, RpcMessage, RpcRequest, RpcResponse};
pub use runner::{RunnerSpec, RunnerTable, TransportKind};
