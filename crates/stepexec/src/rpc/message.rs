use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepcore::StoreError;
use thiserror::Error;

/// One line of the RPC protocol, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcMessage {
    RpcRequest(RpcRequest),
    RpcResponse(RpcResponse),
}

/// A request from the worker. Without an `id` it is a notification and gets no response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl RpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, args: Value) -> Self {
        Self {
            id: Some(id.into()),
            method: method.into(),
            args,
        }
    }

    pub fn notification(method: impl Into<String>, args: Value) -> Self {
        Self {
            id: None,
            method: method.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: &RpcError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Handler for method {method} not found")]
    HandlerNotFound { method: String },

    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArgs { method: String, reason: String },

    #[error("{0}")]
    Handler(String),

    #[error("Malformed RPC message: {0}")]
    Malformed(String),

    #[error("RPC channel closed")]
    Closed,

    #[error("RPC transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RPC serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for RpcError {
    fn from(e: StoreError) -> Self {
        RpcError::Handler(e.to_string())
    }
}
