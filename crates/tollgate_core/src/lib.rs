//! Core data types for tollgate.
//!
//! Messages and inputs whose cost is estimated before admission, the
//! [`TokenUsage`] record kept in rolling windows, and tracing setup.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod estimate;
mod input;
mod media;
mod message;
mod role;
mod telemetry;
mod usage;

pub use estimate::{
    CharacterCounter, ImageTokenPolicy, TiktokenCounter, TokenCounter, TokenEstimator,
};
pub use input::Input;
pub use media::MediaSource;
pub use message::Message;
pub use role::Role;
pub use telemetry::init_tracing;
pub use usage::{ReportsUsage, TokenUsage};
