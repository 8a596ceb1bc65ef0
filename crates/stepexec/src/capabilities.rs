use crate::rpc::{RpcChannel, RpcError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use stepcore::{DataStream, Event, EventBus, StateStore, Step, StepLogger, StreamRegistry};
use tokio_util::sync::CancellationToken;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateKey {
    trace_id: String,
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateWrite {
    trace_id: String,
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateScope {
    #[serde(alias = "groupId")]
    trace_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmitArgs {
    #[serde(alias = "type")]
    topic: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamItem {
    group_id: String,
    id: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamGroup {
    group_id: String,
}

/// What the host offers one worker over its RPC channel.
pub(crate) struct Capabilities {
    pub step: Step,
    pub trace_id: String,
    pub logger: StepLogger,
    pub state: Arc<dyn StateStore>,
    pub streams: StreamRegistry,
    pub bus: Arc<EventBus>,
    pub result: Arc<Mutex<Option<Value>>>,
    pub close: CancellationToken,
}

impl Capabilities {
    pub fn register(self, channel: &RpcChannel) {
        self.register_state(channel);
        self.register_streams(channel);

        let logger = self.logger.clone();
        channel.register_handler("log", move |args| {
            let logger = logger.clone();
            async move {
                logger.log(&args);
                Ok(Value::Null)
            }
        });

        let result = self.result.clone();
        channel.register_handler("result", move |args| {
            let result = result.clone();
            async move {
                *result.lock() = if args.is_null() { None } else { Some(args) };
                Ok(Value::Null)
            }
        });

        let close = self.close.clone();
        channel.register_handler("close", move |args| {
            let close = close.clone();
            async move {
                if !args.is_null() {
                    tracing::debug!("worker closed with error: {}", args);
                }
                close.cancel();
                Ok(Value::Null)
            }
        });

        let Capabilities { step, trace_id, logger, bus, .. } = self;
        channel.register_handler("emit", move |args| {
            let step = step.clone();
            let trace_id = trace_id.clone();
            let logger = logger.clone();
            let bus = bus.clone();
            async move {
                let args: EmitArgs = parse_args("emit", args)?;
                if !step.is_allowed_to_emit(&args.topic) {
                    logger.with_fields(
                        stepcore::LogLevel::Warn,
                        "invalid emit",
                        json!({ "topic": args.topic, "step": step.name(), "file": step.file_path }),
                    );
                    return Ok(Value::Null);
                }

                let event = Event::new(args.topic, args.data, trace_id)
                    .with_flows(step.flows().to_vec())
                    .with_logger(logger);
                bus.emit(event, Some(&step.file_path));
                Ok(Value::Null)
            }
        });
    }

    fn register_state(&self, channel: &RpcChannel) {
        let state = self.state.clone();
        channel.register_handler("state.get", move |args| {
            let state = state.clone();
            async move {
                let args: StateKey = parse_args("state.get", args)?;
                Ok(state.get(&args.trace_id, &args.key).await?.unwrap_or(Value::Null))
            }
        });

        let state = self.state.clone();
        channel.register_handler("state.set", move |args| {
            let state = state.clone();
            async move {
                let args: StateWrite = parse_args("state.set", args)?;
                Ok(state.set(&args.trace_id, &args.key, args.value).await?)
            }
        });

        let state = self.state.clone();
        channel.register_handler("state.delete", move |args| {
            let state = state.clone();
            async move {
                let args: StateKey = parse_args("state.delete", args)?;
                Ok(state.delete(&args.trace_id, &args.key).await?.unwrap_or(Value::Null))
            }
        });

        let state = self.state.clone();
        channel.register_handler("state.clear", move |args| {
            let state = state.clone();
            async move {
                let args: StateScope = parse_args("state.clear", args)?;
                state.clear(&args.trace_id).await?;
                Ok(Value::Null)
            }
        });

        let state = self.state.clone();
        channel.register_handler("state.getGroup", move |args| {
            let state = state.clone();
            async move {
                let args: StateScope = parse_args("state.getGroup", args)?;
                Ok(Value::Array(state.get_group(&args.trace_id).await?))
            }
        });
    }

    fn register_streams(&self, channel: &RpcChannel) {
        for (name, stream) in self.streams.iter() {
            register_stream(channel, name, stream.clone());
        }
    }
}

fn register_stream(channel: &RpcChannel, name: &str, stream: Arc<dyn DataStream>) {
    let method = format!("streams.{name}.get");
    let target = stream.clone();
    channel.register_handler(method.clone(), move |args| {
        let stream = target.clone();
        let method = method.clone();
        async move {
            let args: StreamItem = parse_args(&method, args)?;
            Ok(stream.get(&args.group_id, &args.id).await?.unwrap_or(Value::Null))
        }
    });

    // create, update and set are all upserts on the stream.
    for op in ["create", "update", "set"] {
        let method = format!("streams.{name}.{op}");
        let target = stream.clone();
        channel.register_handler(method.clone(), move |args| {
            let stream = target.clone();
            let method = method.clone();
            async move {
                let args: StreamItem = parse_args(&method, args)?;
                Ok(stream.set(&args.group_id, &args.id, args.data).await?)
            }
        });
    }

    let method = format!("streams.{name}.delete");
    let target = stream.clone();
    channel.register_handler(method.clone(), move |args| {
        let stream = target.clone();
        let method = method.clone();
        async move {
            let args: StreamItem = parse_args(&method, args)?;
            Ok(stream.delete(&args.group_id, &args.id).await?.unwrap_or(Value::Null))
        }
    });

    let method = format!("streams.{name}.getGroup");
    channel.register_handler(method.clone(), move |args| {
        let stream = stream.clone();
        let method = method.clone();
        async move {
            let args: StreamGroup = parse_args(&method, args)?;
            Ok(Value::Array(stream.get_group(&args.group_id).await?))
        }
    });
}

fn parse_args<T: DeserializeOwned>(method: &str, args: Value) -> Result<T, RpcError> {
    serde_json::from_value(args).map_err(|e| RpcError::InvalidArgs {
        method: method.to_string(),
        reason: e.to_string(),
    })
}
