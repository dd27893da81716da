// src/gcode/sink.rs - Destinations for replies produced while interpreting a line
use tokio::sync::mpsc;

/// Where textual replies for one input source are written.
pub trait OutputSink: Send + Sync {
    fn write_str(&self, text: &str);
}

/// Replies go to the log. Used when no source-specific sink was given.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write_str(&self, text: &str) {
        tracing::info!(target: "gcode::reply", "{}", text.trim_end());
    }
}

/// Replies are dropped.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_str(&self, _text: &str) {}
}

/// Replies are forwarded over an unbounded channel, one message per write.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn write_str(&self, text: &str) {
        if self.tx.send(text.to_string()).is_err() {
            tracing::debug!("Reply dropped, receiver closed: {}", text.trim_end());
        }
    }
}
