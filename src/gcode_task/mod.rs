//! # G-code dispatch task
//!
//! The single consumer of command input. Two sources feed the interpreter:
//!
//! - the interactive queue, filled by transports through a [`CommandSender`];
//! - the playback session, which pulls lines from a stored file.
//!
//! Every pass of the task first applies pending playback requests, then
//! dispatches at most one interactive message, then at most one playback
//! line. The interpreter is never called for two lines at once. When a pass
//! finds no work the task waits on its channels, with a bounded timeout,
//! instead of spinning.

pub mod playback;
pub mod queue;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::gcode::{InputMessage, ParseResult};

pub use playback::{PlaybackControl, PlaybackError, PlaybackRequest, PlaybackSession, PlaybackStatus, PlaybackStep};
pub use queue::{CommandSender, PendingMessage, SubmitError};

use queue::Submission;

/// Turns one line into motion primitives. Implemented outside this crate.
pub trait LineInterpreter {
    /// Reset parser state before the first line.
    fn init(&mut self) {}

    /// Interpret the line in `message`. Replies go to `message.reply`.
    /// Must tolerate being called again with the same line after `Busy`.
    fn interpret(&mut self, message: &InputMessage) -> ParseResult;
}

/// Planner and step generator, initialised once before dispatch starts.
pub trait MotionBackend {
    fn plan_init(&mut self);
    fn stepper_init(&mut self);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Cannot create an interactive queue with capacity {capacity}")]
    QueueCreation { capacity: usize },
    #[error("Dispatch task has stopped")]
    Closed,
}

/// Run one interactive message through `interpreter`.
///
/// The line is kept when the interpreter answers `Busy` so it can be
/// submitted again unchanged; any other verdict empties it. The message is
/// released either way.
pub fn dispatch_interactive<I>(interpreter: &mut I, message: &mut InputMessage) -> ParseResult
where
    I: LineInterpreter + ?Sized,
{
    let result = interpreter.interpret(message);
    message.set_result(result);
    if result != ParseResult::Busy {
        message.line_mut().clear();
    }
    message.set_in_use(false);
    result
}

/// What one pass of the task did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub interactive: Option<ParseResult>,
    pub playback: PlaybackStep,
}

impl PassReport {
    pub fn is_idle(&self) -> bool {
        self.interactive.is_none() && self.playback == PlaybackStep::Inactive
    }
}

/// Handles given to producers and control logic when the task starts.
#[derive(Clone)]
pub struct TaskHandle {
    pub commands: CommandSender,
    pub playback: PlaybackControl,
    shutdown: broadcast::Sender<()>,
}

impl TaskHandle {
    /// Ask the task to return from [`Dispatcher::run`] after its current pass.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

pub struct Dispatcher<I> {
    interpreter: I,
    queue: mpsc::Receiver<Submission>,
    queue_open: bool,
    control: mpsc::UnboundedReceiver<PlaybackRequest>,
    control_open: bool,
    shutdown: broadcast::Receiver<()>,
    shutdown_open: bool,
    stashed: Option<Submission>,
    playback: PlaybackSession,
    status: watch::Sender<PlaybackStatus>,
    idle_wait: Duration,
    done_message: String,
}

impl<I: LineInterpreter> Dispatcher<I> {
    /// Initialise the collaborators and create the interactive queue.
    ///
    /// A queue that cannot be created is fatal: no task is built and the
    /// caller gets [`DispatchError::QueueCreation`].
    pub fn start<M>(config: &DispatchConfig, mut interpreter: I, motion: &mut M) -> Result<(Self, TaskHandle), DispatchError>
    where
        M: MotionBackend + ?Sized,
    {
        interpreter.init();
        motion.plan_init();
        motion.stepper_init();

        let capacity = config.queue_len;
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            tracing::error!("Cannot create interactive queue of capacity {}, dispatch task not started", capacity);
            return Err(DispatchError::QueueCreation { capacity });
        }

        let (command_tx, queue) = mpsc::channel(capacity);
        let (control_tx, control) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = broadcast::channel(1);
        let playback = PlaybackSession::new();
        let (status, status_rx) = watch::channel(playback.status());

        tracing::info!("G-code dispatch ready, interactive queue capacity {}", capacity);

        let dispatcher = Self {
            interpreter,
            queue,
            queue_open: true,
            control,
            control_open: true,
            shutdown,
            shutdown_open: true,
            stashed: None,
            playback,
            status,
            idle_wait: Duration::from_millis(config.idle_wait_ms),
            done_message: config.done_message.clone(),
        };
        let handle = TaskHandle {
            commands: CommandSender::new(command_tx),
            playback: PlaybackControl::new(control_tx, status_rx),
            shutdown: shutdown_tx,
        };
        Ok((dispatcher, handle))
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    pub fn playback(&self) -> &PlaybackSession {
        &self.playback
    }

    /// Direct access for control logic running on the dispatch task itself.
    /// Changes made here are published at the end of the next pass.
    pub fn playback_mut(&mut self) -> &mut PlaybackSession {
        &mut self.playback
    }

    /// One pass: playback requests, then one interactive message, then one
    /// playback line.
    pub fn poll_once(&mut self) -> PassReport {
        self.apply_control();
        let interactive = self.poll_interactive();
        let playback = self.playback.advance(&mut self.interpreter, &self.done_message);
        self.publish_status();
        PassReport { interactive, playback }
    }

    /// Run passes until shutdown, or until every producer and control handle
    /// is gone and no playback is running.
    pub async fn run(mut self) {
        tracing::info!("G-code dispatch task running");
        loop {
            let report = self.poll_once();
            if !report.is_idle() {
                if self.shutdown_requested() {
                    break;
                }
                tokio::task::yield_now().await;
                continue;
            }

            if !self.queue_open && !self.control_open && !self.playback.is_active() {
                tracing::info!("All command inputs closed");
                break;
            }

            tokio::select! {
                signal = self.shutdown.recv(), if self.shutdown_open => match signal {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => self.shutdown_open = false,
                },
                submission = self.queue.recv(), if self.queue_open => match submission {
                    Some(submission) => self.stashed = Some(submission),
                    None => self.queue_open = false,
                },
                request = self.control.recv(), if self.control_open => match request {
                    Some(request) => {
                        self.playback.handle(request);
                        self.publish_status();
                    }
                    None => self.control_open = false,
                },
                _ = tokio::time::sleep(self.idle_wait) => {}
            }
        }
        tracing::info!("G-code dispatch task stopped");
    }

    fn poll_interactive(&mut self) -> Option<ParseResult> {
        let submission = match self.stashed.take() {
            Some(submission) => submission,
            None => match self.queue.try_recv() {
                Ok(submission) => submission,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.queue_open = false;
                    return None;
                }
            },
        };

        let Submission { mut message, respond_to } = submission;
        let result = dispatch_interactive(&mut self.interpreter, &mut message);
        tracing::debug!("Interactive line -> {:?}", result);
        if respond_to.send(message).is_err() {
            tracing::warn!("Producer dropped before its message was returned");
        }
        Some(result)
    }

    fn apply_control(&mut self) {
        while self.control_open {
            match self.control.try_recv() {
                Ok(request) => self.playback.handle(request),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.control_open = false,
            }
        }
    }

    /// Publish the session status if it differs from the last published one.
    fn publish_status(&self) {
        let next = self.playback.status();
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn shutdown_requested(&mut self) -> bool {
        if !self.shutdown_open {
            return false;
        }
        match self.shutdown.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => true,
            Err(broadcast::error::TryRecvError::Empty) => false,
            Err(broadcast::error::TryRecvError::Closed) => {
                self.shutdown_open = false;
                false
            }
        }
    }
}

impl<I> Dispatcher<I>
where
    I: LineInterpreter + Send + 'static,
{
    /// Run the task on the tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
