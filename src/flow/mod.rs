//! Consumer flow control and callback delivery.

mod dispatch;
mod read_ahead;

pub use dispatch::{DispatchMode, Dispatcher, Job};
pub use read_ahead::{
    ConsumerCallback, FlowControlQueue, ReadAheadConsumer, RefillRequest, RefillSink,
};
