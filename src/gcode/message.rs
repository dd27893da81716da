// src/gcode/message.rs - Unit of work handed to the interpreter
use std::sync::Arc;

use serde::Serialize;

use crate::gcode::line_buffer::LineBuffer;
use crate::gcode::sink::{OutputSink, TracingSink};

/// Verdict of one interpreter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ParseResult {
    Ok,
    /// The line could not be consumed yet; retry it unchanged.
    Busy,
    UnknownCommand,
    ChecksumMismatch,
    Error,
}

/// How the bytes in a message's line buffer are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LineFormat {
    #[default]
    Text,
    Packed,
}

/// One pending line for the interpreter, plus where its replies go and the
/// result of the last attempt.
pub struct InputMessage {
    line: LineBuffer,
    format: LineFormat,
    sink: Arc<dyn OutputSink>,
    in_use: bool,
    result: Option<ParseResult>,
}

impl InputMessage {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            line: LineBuffer::new(),
            format: LineFormat::Text,
            sink,
            in_use: false,
            result: None,
        }
    }

    pub fn text(line: &[u8], sink: Arc<dyn OutputSink>) -> Self {
        let mut message = Self::new(sink);
        message.line.extend_from_slice(line);
        message
    }

    pub fn packed(line: LineBuffer, sink: Arc<dyn OutputSink>) -> Self {
        let mut message = Self::new(sink);
        message.line = line;
        message.format = LineFormat::Packed;
        message
    }

    pub fn line(&self) -> &LineBuffer {
        &self.line
    }

    pub fn line_mut(&mut self) -> &mut LineBuffer {
        &mut self.line
    }

    pub fn format(&self) -> LineFormat {
        self.format
    }

    pub fn set_format(&mut self, format: LineFormat) {
        self.format = format;
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    pub fn set_sink(&mut self, sink: Arc<dyn OutputSink>) {
        self.sink = sink;
    }

    /// Write a reply to this message's sink.
    pub fn reply(&self, text: &str) {
        self.sink.write_str(text);
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    pub fn result(&self) -> Option<ParseResult> {
        self.result
    }

    pub fn set_result(&mut self, result: ParseResult) {
        self.result = Some(result);
    }

    /// Forget the verdict of the last attempt.
    pub fn clear_result(&mut self) {
        self.result = None;
    }
}

impl Default for InputMessage {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl std::fmt::Debug for InputMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputMessage")
            .field("line", &self.line)
            .field("format", &self.format)
            .field("in_use", &self.in_use)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}
