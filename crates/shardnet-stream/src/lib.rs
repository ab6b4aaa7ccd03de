//! Scatter/gather buffered output stream with back-patching marks, plus
//! the NV-pair logical message header codec that rides on top of it.

mod mark;
mod nv;
mod output_stream;

pub use mark::Mark;
pub use nv::{read_nv_pairs, write_nv_pairs, NvValue};
pub use output_stream::BufferedOutputStream;
