mod bus;
mod event;

pub use bus::{closed_tracker, EventBus, EventHandler, Subscription};
pub use event::{new_trace_id, Event};
