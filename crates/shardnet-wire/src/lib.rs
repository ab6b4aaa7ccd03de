//! Translates between logical messages (block chains + type tag + session id) and wire
//! envelopes on an ordered byte stream.

mod accumulator;
mod encoder;
mod envelope;

pub use accumulator::{Accumulator, Message};
pub use encoder::encode_message;
pub use envelope::{Header, FLAG_END, FLAG_FRAGMENT, HEADER_LEN, MAGIC, MAX_PAYLOAD, PROTOCOL_VERSION};
