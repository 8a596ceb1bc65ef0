use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which RPC transport a worker is spawned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportChoice {
    /// Structured side-channel where the platform has one, line protocol otherwise.
    #[default]
    Auto,
    Ipc,
    Stdio,
}

/// Configuration for the execution gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Directory holding `node/`, `python/` and `ruby/` runner scripts.
    pub runner_dir: PathBuf,
    pub node_command: String,
    pub python_command: String,
    pub ruby_command: String,
    /// Run `.ts` steps through `ts-node/register` and the TypeScript runner.
    pub node_ts_register: bool,
    pub transport: TransportChoice,
    /// Grace period for reading the remaining worker output after exit.
    pub drain_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            runner_dir: PathBuf::from("runners"),
            node_command: "node".to_string(),
            python_command: "python".to_string(),
            ruby_command: "ruby".to_string(),
            node_ts_register: true,
            transport: TransportChoice::Auto,
            drain_timeout_ms: 1000,
        }
    }
}
