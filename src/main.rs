// src/main.rs - Host harness: console or serial as the interactive source, optional file playback
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serial2_tokio::SerialPort;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use krusty_ingest::gcode::ChannelSink;
use krusty_ingest::{
    load_config, CommandSender, Dispatcher, FileLineSource, IngestConfig, InputMessage, NullMotion, OutputSink,
    ParseResult, PlaybackStatus, ReplyInterpreter,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How long a producer waits before resubmitting a line the interpreter
/// could not take yet.
const BUSY_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Parser)]
#[command(name = "ingest-host", version, about = "Feed G-code to the dispatch task from a console, serial port or file")]
struct Args {
    /// Configuration file; defaults are used when it does not exist.
    #[arg(short, long, default_value = "ingest.toml")]
    config: String,

    /// G-code file to play back.
    #[arg(short, long)]
    play: Option<PathBuf>,

    /// Serial device to read commands from instead of stdin.
    #[arg(long)]
    serial: Option<String>,

    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Overrides `[logging] level`.
    #[arg(long)]
    log_level: Option<String>,
}

/// Replies for the console source.
struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_str(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            tracing::warn!("Failed to write reply to stdout: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let loaded = if Path::new(&args.config).exists() {
        load_config(&args.config).map(Some)
    } else {
        Ok(None)
    };

    // Initialize logging
    let level = args
        .log_level
        .as_deref()
        .and_then(|level| level.parse().ok())
        .or_else(|| loaded.as_ref().ok().and_then(|c| c.as_ref()).map(|c| c.logging.max_level()))
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting Krusty ingest host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(Some(config)) => config,
        Ok(None) => {
            tracing::warn!("Config file '{}' not found, using defaults", args.config);
            IngestConfig::default()
        }
        Err(e) => {
            tracing::error!("Failed to load config from '{}': {}", args.config, e);
            return Err(Box::new(e) as BoxError);
        }
    };

    let (dispatcher, handle) = Dispatcher::start(&config.dispatch, ReplyInterpreter::new(), &mut NullMotion)
        .map_err(|e| {
            tracing::error!("Fatal: {}", e);
            Box::new(e) as BoxError
        })?;
    let task = dispatcher.spawn();

    let console: Arc<dyn OutputSink> = Arc::new(StdoutSink);
    let producer = match &args.serial {
        Some(path) => {
            let port = Arc::new(SerialPort::open(path, args.baud)?);
            tracing::info!("Reading commands from {} @ {} baud", path, args.baud);
            let (sink, mut replies) = ChannelSink::new();
            let writer = port.clone();
            tokio::spawn(async move {
                while let Some(reply) = replies.recv().await {
                    if let Err(e) = writer.write_all(reply.as_bytes()).await {
                        tracing::error!("Serial write error: {}", e);
                        break;
                    }
                }
            });
            tokio::spawn(feed_serial(port, handle.commands.clone(), Arc::new(sink)))
        }
        None => {
            tracing::info!("Reading commands from stdin");
            tokio::spawn(feed_stdin(handle.commands.clone(), console.clone()))
        }
    };

    if let Some(path) = &args.play {
        let source = FileLineSource::open(path).await?;
        let session = handle.playback.start(source, console.clone()).await?;
        tracing::info!("Playing {} as session {}", path.display(), session);
    }

    let finished = async {
        if let Err(e) = producer.await {
            tracing::error!("Command producer failed: {}", e);
        }
        wait_for_playback(handle.playback.subscribe()).await;
    };
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted, shutting down");
        }
        _ = finished => tracing::info!("Input exhausted, shutting down"),
    }

    let status = handle.playback.status().await.unwrap_or_else(|_| handle.playback.latest());
    println!("{}", serde_json::to_string_pretty(&status)?);

    handle.shutdown();
    task.await?;
    Ok(())
}

async fn wait_for_playback(mut status: watch::Receiver<PlaybackStatus>) {
    while status.borrow_and_update().active {
        if status.changed().await.is_err() {
            break;
        }
    }
}

/// Submit the message until the interpreter stops answering `Busy`.
/// Returns `None` once the dispatch task is gone.
async fn submit_until_taken(commands: &CommandSender, mut message: InputMessage) -> Option<InputMessage> {
    loop {
        message = match commands.submit(message).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping console line: {}", e);
                return None;
            }
        };
        if message.result() != Some(ParseResult::Busy) {
            return Some(message);
        }
        tokio::time::sleep(BUSY_RETRY).await;
    }
}

async fn feed_stdin(commands: CommandSender, sink: Arc<dyn OutputSink>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut message = InputMessage::new(sink);
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("stdin read error: {}", e);
                break;
            }
        };
        message.line_mut().clear();
        message.line_mut().extend_from_slice(line.trim_end().as_bytes());
        message = match submit_until_taken(&commands, message).await {
            Some(message) => message,
            None => return,
        };
    }
    tracing::info!("stdin closed");
}

async fn feed_serial(port: Arc<SerialPort>, commands: CommandSender, sink: Arc<dyn OutputSink>) {
    let mut chunk = [0u8; 256];
    let mut message = InputMessage::new(sink);
    loop {
        let read = match port.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                tracing::error!("Serial read error: {}", e);
                break;
            }
        };
        for &byte in &chunk[..read] {
            // Any control character ends a line.
            if byte >= b' ' {
                message.line_mut().push_byte(byte);
                continue;
            }
            if message.line().is_empty() {
                continue;
            }
            message = match submit_until_taken(&commands, message).await {
                Some(message) => message,
                None => return,
            };
        }
    }
    tracing::info!("Serial connection closed");
}
