//! Cooperative actor scheduler
//!
//! Every long-lived component (Raft node, stream processor, snapshot director,
//! exporter director, partition controller) is an [`Actor`]: it owns its state,
//! receives messages through a bounded mailbox and handles at most one message
//! at a time. Work that has to wait on I/O is handed to
//! [`ActorControl::run_on_completion`], which re-enqueues the result as a
//! message instead of blocking the actor.

mod control;
mod retry;
mod scheduler;

pub use control::{ActorControl, Cancellation, TimerHandle};
pub use retry::RetryStrategy;
pub use scheduler::ActorScheduler;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// Error type returned by message handlers. Any error type can be propagated
/// with `?`; the scheduler logs it and consults [`Actor::on_failure`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Errors surfaced to callers interacting with an actor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActorError {
    #[error("mailbox of actor {actor} is full")]
    MailboxFull { actor: String },

    #[error("actor {actor} is closed")]
    Closed { actor: String },

    #[error("actor {actor} dropped the reply")]
    NoReply { actor: String },
}

/// What the scheduler does after a handler failed or panicked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureAction {
    /// Keep the actor running with its current state.
    Resume,
    /// Re-run `on_start` before handling the next message.
    Restart,
    Stop,
}

/// Handler failure handed to [`Actor::on_failure`].
#[derive(Debug)]
pub enum ActorFailure {
    Error(HandlerError),
    Panic(String),
}

impl fmt::Display for ActorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorFailure::Error(e) => write!(f, "{}", e),
            ActorFailure::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Send + 'static;

    fn name(&self) -> String;

    async fn on_start(&mut self, _ctl: &ActorControl<Self::Message>) -> HandlerResult {
        Ok(())
    }

    async fn handle(&mut self, ctl: &ActorControl<Self::Message>, msg: Self::Message) -> HandlerResult;

    /// Decide how to continue after `handle` or `on_start` failed. Resumes by default.
    fn on_failure(&mut self, _failure: &ActorFailure) -> FailureAction {
        FailureAction::Resume
    }

    async fn on_stop(&mut self) {}
}

/// Cloneable external handle to a running actor.
pub struct ActorRef<M> {
    name: String,
    tx: mpsc::Sender<M>,
    stop_tx: std::sync::Arc<watch::Sender<bool>>,
    terminated_rx: watch::Receiver<bool>,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            stop_tx: self.stop_tx.clone(),
            terminated_rx: self.terminated_rx.clone(),
        }
    }
}

impl<M: Send + 'static> ActorRef<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a message, waiting while the mailbox is full.
    pub async fn tell(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::Closed {
            actor: self.name.clone(),
        })
    }

    /// Enqueue a message or fail immediately when the mailbox is full.
    pub fn try_tell(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull {
                actor: self.name.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => ActorError::Closed {
                actor: self.name.clone(),
            },
        })
    }

    /// Send a request built around a reply channel and await the reply.
    pub async fn ask<R, F>(&self, build: F) -> Result<R, ActorError>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tell(build(reply_tx)).await?;
        reply_rx.await.map_err(|_| ActorError::NoReply {
            actor: self.name.clone(),
        })
    }

    /// Ask the actor to stop after the message it is currently handling.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || *self.terminated_rx.borrow()
    }

    /// Wait until the actor ran `on_stop` and its task finished.
    pub async fn await_termination(&self) {
        let mut rx = self.terminated_rx.clone();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }

    /// Stop the actor and wait for it to terminate.
    pub async fn stop_and_wait(&self) {
        self.stop();
        self.await_termination().await;
    }
}
