use crate::StepError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of user logic backed by a file, keyed by `file_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub file_path: String,
    #[serde(default)]
    pub version: String,
    pub config: StepConfig,
}

impl Step {
    pub fn new(file_path: impl Into<String>, config: StepConfig) -> Self {
        Self {
            file_path: file_path.into(),
            version: String::new(),
            config,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Decode a step descriptor as produced by the step discovery collaborators.
    pub fn from_json(json: &str) -> Result<Self, StepError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: Value) -> Result<Self, StepError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn flows(&self) -> &[String] {
        self.config.flows()
    }

    /// Whether a worker of this step may emit `topic`.
    pub fn is_allowed_to_emit(&self, topic: &str) -> bool {
        self.config.emits().iter().any(|emit| emit.topic() == topic)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepConfig {
    Event(EventConfig),
    Api(ApiConfig),
    Cron(CronConfig),
    Noop(NoopConfig),
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Event(_) => StepKind::Event,
            StepConfig::Api(_) => StepKind::Api,
            StepConfig::Cron(_) => StepKind::Cron,
            StepConfig::Noop(_) => StepKind::Noop,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StepConfig::Event(c) => &c.name,
            StepConfig::Api(c) => &c.name,
            StepConfig::Cron(c) => &c.name,
            StepConfig::Noop(c) => &c.name,
        }
    }

    pub fn flows(&self) -> &[String] {
        match self {
            StepConfig::Event(c) => &c.flows,
            StepConfig::Api(c) => &c.flows,
            StepConfig::Cron(c) => &c.flows,
            StepConfig::Noop(c) => &c.flows,
        }
    }

    /// Topics this step may emit at runtime. Noop steps emit nothing.
    pub fn emits(&self) -> &[Emit] {
        match self {
            StepConfig::Event(c) => &c.emits,
            StepConfig::Api(c) => &c.emits,
            StepConfig::Cron(c) => &c.emits,
            StepConfig::Noop(_) => &[],
        }
    }

    pub fn virtual_emits(&self) -> Option<&[Emit]> {
        match self {
            StepConfig::Event(c) => c.virtual_emits.as_deref(),
            StepConfig::Api(c) => c.virtual_emits.as_deref(),
            StepConfig::Cron(c) => c.virtual_emits.as_deref(),
            StepConfig::Noop(c) => Some(&c.virtual_emits),
        }
    }

    /// Display-only steps are tracked but never executed.
    pub fn is_dev_only(&self) -> bool {
        matches!(self, StepConfig::Noop(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Event,
    Api,
    Cron,
    Noop,
}

/// An emitted topic, either bare or annotated for diagrams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Emit {
    Topic(String),
    Detailed {
        #[serde(alias = "type")]
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conditional: Option<bool>,
    },
}

impl Emit {
    pub fn topic(&self) -> &str {
        match self {
            Emit::Topic(topic) => topic,
            Emit::Detailed { topic, .. } => topic,
        }
    }
}

impl From<&str> for Emit {
    fn from(topic: &str) -> Self {
        Emit::Topic(topic.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub subscribes: Vec<String>,
    pub emits: Vec<Emit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_emits: Option<Vec<Emit>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApiMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub path: String,
    pub method: ApiMethod,
    pub emits: Vec<Emit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_emits: Option<Vec<Emit>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_subscribes: Option<Vec<String>>,
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<Vec<QueryParam>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CronConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub cron: String,
    pub emits: Vec<Emit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_emits: Option<Vec<Emit>>,
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NoopConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub virtual_emits: Vec<Emit>,
    pub virtual_subscribes: Vec<String>,
    #[serde(default)]
    pub flows: Vec<String>,
}
