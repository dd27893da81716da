// krusty_ingest: command ingestion for the motion-control firmware
//
// Producers frame commands into line buffers (as text, or packed with the
// encoder in `gcode::packed`); the dispatch task in `gcode_task` feeds them,
// together with lines played back from a stored file, to the interpreter.

pub mod config;
pub mod gcode;
pub mod gcode_task;
pub mod interpreter;

pub use config::{load_config, ConfigError, DispatchConfig, IngestConfig, LoggingConfig};
pub use gcode::{
    FileLineSource, InputMessage, LineBuffer, LineFormat, LineSource, OutputSink, ParseResult, MAX_LINE,
};
pub use gcode_task::{
    dispatch_interactive, CommandSender, DispatchError, Dispatcher, LineInterpreter, MotionBackend, PassReport,
    PlaybackControl, PlaybackError, PlaybackStatus, PlaybackStep, SubmitError, TaskHandle,
};
pub use interpreter::{NullMotion, ReplyInterpreter};
