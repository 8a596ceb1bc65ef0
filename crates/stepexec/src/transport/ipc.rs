use super::{RpcIo, TransportAdapter};
use crate::runner::TransportKind;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::Stdio;
use stepcore::ExecutionError;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

/// Descriptor the worker finds its end of the socket pair on.
pub const CHANNEL_FD: i32 = 3;

/// Messages on a socket pair installed as fd 3 in the worker.
///
/// stdin is closed and stdout/stderr stay free for worker logs.
pub struct IpcTransport {
    parent: Option<StdUnixStream>,
    child: Option<StdUnixStream>,
}

impl IpcTransport {
    pub fn new() -> Self {
        Self {
            parent: None,
            child: None,
        }
    }
}

impl Default for IpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportAdapter for IpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ipc
    }

    fn prepare(&mut self, command: &mut Command) -> Result<(), ExecutionError> {
        let (parent, child) = StdUnixStream::pair().map_err(ExecutionError::SpawnFailed)?;
        let child_fd = child.as_raw_fd();

        command
            .env("NODE_CHANNEL_FD", CHANNEL_FD.to_string())
            .env("NODE_CHANNEL_SERIALIZATION_MODE", "json")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // SAFETY: only async-signal-safe calls (fcntl, dup2) run between fork and exec.
        unsafe {
            command.pre_exec(move || install_channel_fd(child_fd));
        }

        self.parent = Some(parent);
        self.child = Some(child);
        Ok(())
    }

    fn connect(&mut self, child: &mut Child) -> Result<RpcIo, ExecutionError> {
        // The worker holds its own copy now; ours would keep the socket open past its exit.
        self.child.take();

        let parent = self
            .parent
            .take()
            .ok_or_else(|| ExecutionError::Transport("ipc channel was not prepared".to_string()))?;
        parent.set_nonblocking(true).map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let stream = UnixStream::from_std(parent).map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let (reader, writer) = stream.into_split();

        Ok(RpcIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
            output: child.stdout.take(),
        })
    }
}

fn install_channel_fd(fd: i32) -> io::Result<()> {
    if fd == CHANNEL_FD {
        // Already in place; only the close-on-exec flag has to go.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }

    if unsafe { libc::dup2(fd, CHANNEL_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
