//! Client-side lifecycle and status tracking for an external analysis server.

pub mod channel;
pub mod codec;
pub mod launch;
pub mod types;

pub(crate) mod protocol;
pub(crate) mod queue;

mod controller;
mod error;
mod observer;
mod process;
mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Channel, ChannelError, ChannelEvent, ChannelFactory, ChannelState, ProgressEvent};
pub use controller::SessionController;
pub use error::SessionError;
pub use launch::{CommandResolver, LaunchError, LaunchSpec, LaunchSpecResolver};
pub use observer::SessionObserver;
pub use process::{ProcessChannel, ProcessChannelFactory};
pub use status::{StatusAggregator, StatusHub};
pub use types::{
    DEFAULT_STATUS_NOTIFICATION, ErrorDetails, FileProgress, Health, ServerConfig, ServerErrorInfo,
    ServerState, StatusSnapshot, StatusUpdate,
};
