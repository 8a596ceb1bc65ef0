use crate::config::{GatewayConfig, TransportChoice};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stepcore::ExecutionError;

/// Concrete transport a runner speaks once platform support is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ipc,
    Stdio,
}

impl TransportKind {
    fn resolve(choice: TransportChoice) -> Self {
        match choice {
            TransportChoice::Stdio => TransportKind::Stdio,
            TransportChoice::Ipc | TransportChoice::Auto if cfg!(unix) => TransportKind::Ipc,
            _ => TransportKind::Stdio,
        }
    }
}

/// How to launch the worker for one file extension.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSpec {
    pub command: String,
    pub preamble_args: Vec<String>,
    pub runner_path: PathBuf,
    pub transport: TransportKind,
}

impl RunnerSpec {
    pub fn new(command: impl Into<String>, runner_path: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            preamble_args: Vec::new(),
            runner_path: runner_path.into(),
            transport: TransportKind::resolve(TransportChoice::Auto),
        }
    }

    pub fn with_preamble(mut self, args: &[&str]) -> Self {
        self.preamble_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// `[preamble...] runner step_file payload`
    pub fn args(&self, step_file: &str, payload: &str) -> Vec<String> {
        let mut args = self.preamble_args.clone();
        args.push(self.runner_path.to_string_lossy().into_owned());
        args.push(step_file.to_string());
        args.push(payload.to_string());
        args
    }
}

/// Maps step file extensions to runner commands.
#[derive(Debug, Clone, Default)]
pub struct RunnerTable {
    runners: HashMap<String, RunnerSpec>,
}

impl RunnerTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The node, python and ruby runners laid out under `config.runner_dir`.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let transport = TransportKind::resolve(config.transport);
        let dir = &config.runner_dir;
        let mut table = Self::empty();

        table.register(
            "js",
            RunnerSpec::new(&config.node_command, dir.join("node").join("node-runner.js"))
                .with_transport(transport),
        );
        let ts = if config.node_ts_register {
            RunnerSpec::new(&config.node_command, dir.join("node").join("node-runner.ts"))
                .with_preamble(&["-r", "ts-node/register"])
        } else {
            RunnerSpec::new(&config.node_command, dir.join("node").join("node-runner.js"))
        };
        table.register("ts", ts.with_transport(transport));
        table.register(
            "py",
            RunnerSpec::new(&config.python_command, dir.join("python").join("python-runner.py"))
                .with_transport(transport),
        );
        table.register(
            "rb",
            RunnerSpec::new(&config.ruby_command, dir.join("ruby").join("ruby-runner.rb"))
                .with_transport(transport),
        );

        table
    }

    pub fn register(&mut self, extension: impl Into<String>, spec: RunnerSpec) {
        let extension = extension.into();
        self.runners
            .insert(extension.trim_start_matches('.').to_string(), spec);
    }

    pub fn resolve(&self, file_path: &str) -> Result<&RunnerSpec, ExecutionError> {
        Path::new(file_path)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.runners.get(ext))
            .ok_or_else(|| ExecutionError::UnsupportedRuntime {
                file_path: file_path.to_string(),
            })
    }

    pub fn extensions(&self) -> Vec<&str> {
        let mut extensions: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        extensions.sort();
        extensions
    }
}

impl From<&GatewayConfig> for RunnerTable {
    fn from(config: &GatewayConfig) -> Self {
        Self::from_config(config)
    }
}
