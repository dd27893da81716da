// src/gcode_task/queue.rs - Interactive command queue, producer side
use thiserror::Error;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, oneshot};

use crate::gcode::InputMessage;
use crate::gcode_task::DispatchError;

/// A message moved into the queue, with the way back to its producer.
#[derive(Debug)]
pub(crate) struct Submission {
    pub(crate) message: InputMessage,
    pub(crate) respond_to: oneshot::Sender<InputMessage>,
}

/// The message is handed back whenever it could not be queued.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Interactive queue is full")]
    Full(InputMessage),
    #[error("Dispatch task has stopped")]
    Closed(InputMessage),
}

impl SubmitError {
    pub fn into_message(self) -> InputMessage {
        match self {
            SubmitError::Full(message) | SubmitError::Closed(message) => message,
        }
    }
}

/// Producer handle for the interactive queue. Cloned once per transport.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Submission>,
}

/// A queued message that has not come back from the dispatcher yet.
#[derive(Debug)]
pub struct PendingMessage {
    response: oneshot::Receiver<InputMessage>,
}

impl PendingMessage {
    /// Wait for the dispatcher to interpret the line and return the message.
    pub async fn wait(self) -> Result<InputMessage, DispatchError> {
        self.response.await.map_err(|_| DispatchError::Closed)
    }
}

impl CommandSender {
    pub(crate) fn new(tx: mpsc::Sender<Submission>) -> Self {
        Self { tx }
    }

    /// Queue `message`, waiting for room if the queue is full.
    pub async fn enqueue(&self, message: InputMessage) -> Result<PendingMessage, SubmitError> {
        let (submission, pending) = prepare(message);
        match self.tx.send(submission).await {
            Ok(()) => Ok(pending),
            Err(SendError(submission)) => Err(SubmitError::Closed(release(submission))),
        }
    }

    /// Queue `message` only if there is room right now.
    pub fn try_enqueue(&self, message: InputMessage) -> Result<PendingMessage, SubmitError> {
        let (submission, pending) = prepare(message);
        match self.tx.try_send(submission) {
            Ok(()) => Ok(pending),
            Err(TrySendError::Full(submission)) => Err(SubmitError::Full(release(submission))),
            Err(TrySendError::Closed(submission)) => Err(SubmitError::Closed(release(submission))),
        }
    }

    /// Queue `message` and wait until it has been interpreted.
    pub async fn submit(&self, message: InputMessage) -> Result<InputMessage, DispatchError> {
        let pending = self.enqueue(message).await.map_err(|_| DispatchError::Closed)?;
        pending.wait().await
    }

    /// Free slots in the queue.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn prepare(mut message: InputMessage) -> (Submission, PendingMessage) {
    message.set_in_use(true);
    let (respond_to, response) = oneshot::channel();
    (Submission { message, respond_to }, PendingMessage { response })
}

fn release(submission: Submission) -> InputMessage {
    let mut message = submission.message;
    message.set_in_use(false);
    message
}
