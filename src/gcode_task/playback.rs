// src/gcode_task/playback.rs - File playback session and its control channel
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::gcode::{InputMessage, LineSource, OutputSink, ParseResult, TracingSink};
use crate::gcode_task::LineInterpreter;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("No playback session")]
    NoSession,
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("Dispatch task has stopped")]
    TaskStopped,
}

/// Snapshot of the playback session, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub active: bool,
    pub session: Option<Uuid>,
    pub lines_dispatched: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_result: Option<ParseResult>,
}

/// Outcome of one playback step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStep {
    Inactive,
    Dispatched(ParseResult),
    /// The source ran dry; the completion notice has been written.
    Finished,
}

/// State of streaming lines from a stored file. Owns the single playback
/// message, which is reused for every line of every session.
pub struct PlaybackSession {
    message: InputMessage,
    source: Option<Box<dyn LineSource>>,
    active: bool,
    id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    lines_dispatched: u64,
}

impl PlaybackSession {
    pub fn new() -> Self {
        Self {
            message: InputMessage::new(Arc::new(TracingSink)),
            source: None,
            active: false,
            id: None,
            started_at: None,
            lines_dispatched: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn message(&self) -> &InputMessage {
        &self.message
    }

    /// Begin a new session, replacing any previous one.
    pub fn start(&mut self, source: Box<dyn LineSource>, sink: Arc<dyn OutputSink>) -> Uuid {
        if let Some(previous) = self.id.filter(|_| self.source.is_some()) {
            tracing::warn!("Playback session {} replaced before it finished", previous);
        }
        let id = Uuid::new_v4();
        self.message.set_format(source.format());
        self.message.set_sink(sink);
        self.message.line_mut().clear();
        self.message.clear_result();
        self.source = Some(source);
        self.active = true;
        self.id = Some(id);
        self.started_at = Some(Utc::now());
        self.lines_dispatched = 0;
        tracing::info!("Playback session {} started", id);
        id
    }

    pub fn pause(&mut self) -> Result<Uuid, PlaybackError> {
        let id = self.current()?;
        if !self.active {
            return Err(PlaybackError::InvalidTransition("Playback is already paused".to_string()));
        }
        self.active = false;
        tracing::info!("Playback session {} paused after {} lines", id, self.lines_dispatched);
        Ok(id)
    }

    pub fn resume(&mut self) -> Result<Uuid, PlaybackError> {
        let id = self.current()?;
        if self.active {
            return Err(PlaybackError::InvalidTransition("Playback is already running".to_string()));
        }
        self.active = true;
        tracing::info!("Playback session {} resumed", id);
        Ok(id)
    }

    /// End the session without a completion notice.
    pub fn stop(&mut self) -> Result<Uuid, PlaybackError> {
        let id = self.current()?;
        self.active = false;
        self.source = None;
        tracing::info!("Playback session {} stopped after {} lines", id, self.lines_dispatched);
        Ok(id)
    }

    fn current(&self) -> Result<Uuid, PlaybackError> {
        match (self.id, &self.source) {
            (Some(id), Some(_)) => Ok(id),
            _ => Err(PlaybackError::NoSession),
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            active: self.active,
            session: self.id,
            lines_dispatched: self.lines_dispatched,
            started_at: self.started_at,
            last_result: self.message.result(),
        }
    }

    /// Feed at most one line from the source to `interpreter`.
    ///
    /// The line buffer is cleared after every dispatch, whatever the result;
    /// a `Busy` verdict is recorded but the line is not retried.
    pub fn advance<I>(&mut self, interpreter: &mut I, done_message: &str) -> PlaybackStep
    where
        I: LineInterpreter + ?Sized,
    {
        if !self.active {
            return PlaybackStep::Inactive;
        }

        let filled = match self.source.as_mut() {
            Some(source) => source.read_next_line(self.message.line_mut()),
            None => false,
        };

        if filled {
            self.message.set_in_use(true);
            let result = interpreter.interpret(&self.message);
            self.message.set_result(result);
            self.message.line_mut().clear();
            self.message.set_in_use(false);
            self.lines_dispatched += 1;
            tracing::debug!("Playback line {} -> {:?}", self.lines_dispatched, result);
            PlaybackStep::Dispatched(result)
        } else {
            self.active = false;
            self.source = None;
            if let Some(id) = self.id {
                tracing::info!("Playback session {} finished after {} lines", id, self.lines_dispatched);
            }
            self.message.reply(done_message);
            PlaybackStep::Finished
        }
    }

    pub(crate) fn handle(&mut self, request: PlaybackRequest) {
        match request {
            PlaybackRequest::Start { source, sink, respond_to } => {
                let _ = respond_to.send(self.start(source, sink));
            }
            PlaybackRequest::Pause { respond_to } => {
                let _ = respond_to.send(self.pause());
            }
            PlaybackRequest::Resume { respond_to } => {
                let _ = respond_to.send(self.resume());
            }
            PlaybackRequest::Stop { respond_to } => {
                let _ = respond_to.send(self.stop());
            }
            PlaybackRequest::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }
    }
}

impl Default for PlaybackSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A request sent from control logic to the dispatch task.
pub enum PlaybackRequest {
    Start {
        source: Box<dyn LineSource>,
        sink: Arc<dyn OutputSink>,
        respond_to: oneshot::Sender<Uuid>,
    },
    Pause {
        respond_to: oneshot::Sender<Result<Uuid, PlaybackError>>,
    },
    Resume {
        respond_to: oneshot::Sender<Result<Uuid, PlaybackError>>,
    },
    Stop {
        respond_to: oneshot::Sender<Result<Uuid, PlaybackError>>,
    },
    Status {
        respond_to: oneshot::Sender<PlaybackStatus>,
    },
}

/// Handle used to start, pause, resume and stop file playback.
#[derive(Clone)]
pub struct PlaybackControl {
    tx: mpsc::UnboundedSender<PlaybackRequest>,
    status: watch::Receiver<PlaybackStatus>,
}

impl PlaybackControl {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<PlaybackRequest>,
        status: watch::Receiver<PlaybackStatus>,
    ) -> Self {
        Self { tx, status }
    }

    pub async fn start(
        &self,
        source: impl LineSource + 'static,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Uuid, PlaybackError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PlaybackRequest::Start {
            source: Box::new(source),
            sink,
            respond_to,
        })?;
        response.await.map_err(|_| PlaybackError::TaskStopped)
    }

    pub async fn pause(&self) -> Result<Uuid, PlaybackError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PlaybackRequest::Pause { respond_to })?;
        response.await.map_err(|_| PlaybackError::TaskStopped)?
    }

    pub async fn resume(&self) -> Result<Uuid, PlaybackError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PlaybackRequest::Resume { respond_to })?;
        response.await.map_err(|_| PlaybackError::TaskStopped)?
    }

    pub async fn stop(&self) -> Result<Uuid, PlaybackError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PlaybackRequest::Stop { respond_to })?;
        response.await.map_err(|_| PlaybackError::TaskStopped)?
    }

    pub async fn status(&self) -> Result<PlaybackStatus, PlaybackError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PlaybackRequest::Status { respond_to })?;
        response.await.map_err(|_| PlaybackError::TaskStopped)
    }

    /// Last published status, without a round trip to the task.
    pub fn latest(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.borrow().active
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    fn send(&self, request: PlaybackRequest) -> Result<(), PlaybackError> {
        self.tx.send(request).map_err(|_| PlaybackError::TaskStopped)
    }
}
