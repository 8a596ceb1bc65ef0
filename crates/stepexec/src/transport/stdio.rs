use super::{RpcIo, TransportAdapter};
use crate::runner::TransportKind;
use std::process::Stdio;
use stepcore::ExecutionError;
use tokio::process::{Child, Command};

/// Messages on the worker's stdin and stdout.
pub struct StdioTransport;

impl TransportAdapter for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn prepare(&mut self, command: &mut Command) -> Result<(), ExecutionError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(())
    }

    fn connect(&mut self, child: &mut Child) -> Result<RpcIo, ExecutionError> {
        let writer = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Transport("worker stdin is not piped".to_string()))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Transport("worker stdout is not piped".to_string()))?;

        Ok(RpcIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
            output: None,
        })
    }
}
