use super::{ActorRef, HandlerError};
use slog::{debug, Logger};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Cooperative cancellation flag, set when the actor is asked to stop.
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub(super) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation was requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Handle to a scheduled timer; dropping it leaves the timer running.
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// The actor's view of its own scheduling context, passed to every handler.
pub struct ActorControl<M> {
    pub(super) actor_ref: ActorRef<M>,
    pub(super) tx: mpsc::Sender<M>,
    pub(super) cancellation: Cancellation,
    pub(super) handle: Handle,
    pub(super) logger: Logger,
}

impl<M: Send + 'static> ActorControl<M> {
    pub fn self_ref(&self) -> ActorRef<M> {
        self.actor_ref.clone()
    }

    pub fn name(&self) -> &str {
        self.actor_ref.name()
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Enqueue a message to this actor that must not be lost. When the mailbox
    /// is full the message is handed to a task that waits for a free slot.
    pub fn submit_or_wait(&self, msg: M) {
        match self.tx.try_send(msg) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let tx = self.tx.clone();
                self.handle.spawn(async move {
                    let _ = tx.send(msg).await;
                });
            }
        }
    }

    /// Deliver `msg` to this actor after `delay`.
    pub fn schedule(&self, delay: Duration, msg: M) -> TimerHandle {
        let tx = self.tx.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg).await;
        });
        TimerHandle { task }
    }

    /// Deliver a message built by `make` every `interval` until the actor closes.
    /// Ticks are skipped while the mailbox is full.
    pub fn run_at_fixed_rate<F>(&self, interval: Duration, make: F) -> TimerHandle
    where
        F: Fn() -> M + Send + Sync + 'static,
    {
        let tx = self.tx.clone();
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match tx.try_send(make()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });
        TimerHandle { task }
    }

    /// Run `future` off the actor and deliver its mapped output as a message.
    ///
    /// The actor keeps serving its mailbox while the future is pending.
    pub fn run_on_completion<F, T, Map>(&self, future: F, map: Map) -> TimerHandle
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        Map: FnOnce(T) -> M + Send + 'static,
    {
        let tx = self.tx.clone();
        let logger = self.logger.clone();
        let task = self.handle.spawn(async move {
            let output = future.await;
            if tx.send(map(output)).await.is_err() {
                debug!(logger, "Actor closed before continuation completed");
            }
        });
        TimerHandle { task }
    }

    /// Run blocking work (file I/O, RocksDB checkpoints) on the blocking pool and
    /// deliver the mapped result as a message.
    pub fn run_blocking<F, T, Map>(&self, work: F, map: Map) -> TimerHandle
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        Map: FnOnce(Result<T, HandlerError>) -> M + Send + 'static,
    {
        let handle = self.handle.clone();
        self.run_on_completion(
            async move {
                handle
                    .spawn_blocking(work)
                    .await
                    .map_err(|e| -> HandlerError { Box::new(e) })
            },
            map,
        )
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl<M> Clone for ActorControl<M> {
    fn clone(&self) -> Self {
        Self {
            actor_ref: self.actor_ref.clone(),
            tx: self.tx.clone(),
            cancellation: self.cancellation.clone(),
            handle: self.handle.clone(),
            logger: self.logger.clone(),
        }
    }
}
