// src/gcode/mod.rs - Line buffers, packed framing and the messages that carry them
pub mod file_source;
pub mod line_buffer;
pub mod message;
pub mod packed;
pub mod sink;

pub use file_source::{FileLineSource, FileSourceError, LineSource};
pub use line_buffer::{LineBuffer, MAX_LINE};
pub use message::{InputMessage, LineFormat, ParseResult};
pub use packed::{
    append_float, append_int, append_opcode, append_string, try_append_float, try_append_int,
    try_append_opcode, try_append_string, ArgType, DecodeError, PackError, PackedField, PackedReader,
    PackedValue, CODE_STAR,
};
pub use sink::{ChannelSink, NullSink, OutputSink, TracingSink};
