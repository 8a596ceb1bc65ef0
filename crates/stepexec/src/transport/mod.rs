//! The two ways a worker can talk back to the host.
//!
//! Both flavors carry the same newline-delimited JSON messages; they differ
//! only in which file descriptors the messages travel over.

#[cfg(unix)]
mod ipc;
mod stdio;

#[cfg(unix)]
pub use ipc::IpcTransport;
pub use stdio::StdioTransport;

use crate::runner::TransportKind;
use stepcore::ExecutionError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdout, Command};

/// Both ends of an RPC transport, plus the stdout stream when it is free for logs.
pub struct RpcIo {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: Option<ChildStdout>,
}

/// Sets up the worker's side of the channel around `spawn`.
pub trait TransportAdapter: Send {
    fn kind(&self) -> TransportKind;

    /// Configure stdio and environment before the worker is spawned.
    fn prepare(&mut self, command: &mut Command) -> Result<(), ExecutionError>;

    /// Take the host ends of the channel from the spawned worker.
    fn connect(&mut self, child: &mut Child) -> Result<RpcIo, ExecutionError>;
}

pub fn adapter_for(kind: TransportKind) -> Box<dyn TransportAdapter> {
    match kind {
        #[cfg(unix)]
        TransportKind::Ipc => Box::new(IpcTransport::new()),
        #[cfg(not(unix))]
        TransportKind::Ipc => {
            tracing::debug!("structured channel unavailable on this platform, using stdio");
            Box::new(StdioTransport)
        }
        TransportKind::Stdio => Box::new(StdioTransport),
    }
}
