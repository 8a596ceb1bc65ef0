mod channel;
mod message;

pub use channel::{LineSink, RpcChannel, RpcHandler};
pub use message::{RpcError, RpcMessage, RpcRequest, RpcResponse};
