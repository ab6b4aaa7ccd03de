#![deny(unsafe_code)]
#![doc = "shardnet-core: error, context and configuration contracts shared by every other shardnet-* crate."]
#![doc = ""]
#![doc = "This crate holds no I/O and no protocol logic. It exists so that the buffer, stream, wire"]
#![doc = "and net crates can agree on one error type and one way of threading cancellation and"]
#![doc = "deadlines through async calls, instead of each crate inventing its own."]

pub mod config;
pub mod context;
pub mod error;

pub use config::Config;
pub use context::{CallContext, Cancellation, Deadline};
pub use error::{CoreError, ErrorCategory, Result};
