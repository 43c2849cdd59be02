use super::control::{ActorControl, Cancellation};
use super::{Actor, ActorFailure, ActorRef, FailureAction};
use futures::FutureExt;
use slog::{error, info, o, Logger};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, watch};

const MAX_START_ATTEMPTS: u32 = 3;

/// Runs actors on a Tokio runtime with a small fixed pool of worker threads.
///
/// The scheduler either owns its runtime ([`ActorScheduler::new`], used by the
/// binary) or borrows the ambient one ([`ActorScheduler::current`], used inside
/// `#[tokio::test]`).
pub struct ActorScheduler {
    runtime: Option<Runtime>,
    handle: Handle,
    logger: Logger,
}

impl ActorScheduler {
    pub fn new(worker_threads: usize, logger: Logger) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("raftstream-actor")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        info!(logger, "Started actor scheduler"; "worker_threads" => worker_threads);
        Ok(Self {
            runtime: Some(runtime),
            handle,
            logger,
        })
    }

    /// Scheduler on the runtime of the calling task. Panics outside a runtime.
    pub fn current(logger: Logger) -> Self {
        Self {
            runtime: None,
            handle: Handle::current(),
            logger,
        }
    }

    /// A scheduler spawning onto the same runtime without owning it. Actors
    /// that start other actors keep one of these.
    pub fn share(&self) -> Self {
        Self {
            runtime: None,
            handle: self.handle.clone(),
            logger: self.logger.clone(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Drive `future` to completion on the scheduler's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        match &self.runtime {
            Some(runtime) => runtime.block_on(future),
            None => self.handle.block_on(future),
        }
    }

    /// Start `actor` with a mailbox of `mailbox_capacity` messages.
    pub fn spawn<A: Actor>(&self, actor: A, mailbox_capacity: usize) -> ActorRef<A::Message> {
        let name = actor.name();
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (terminated_tx, terminated_rx) = watch::channel(false);

        let actor_ref = ActorRef {
            name: name.clone(),
            tx: tx.clone(),
            stop_tx: Arc::new(stop_tx),
            terminated_rx,
        };
        let ctl = ActorControl {
            actor_ref: actor_ref.clone(),
            tx,
            cancellation: Cancellation::new(stop_rx.clone()),
            handle: self.handle.clone(),
            logger: self.logger.new(o!("actor" => name)),
        };

        self.handle
            .spawn(run_actor(actor, rx, ctl, stop_rx, terminated_tx));
        actor_ref
    }
}

impl Drop for ActorScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn run_actor<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    ctl: ActorControl<A::Message>,
    mut stop_rx: watch::Receiver<bool>,
    terminated_tx: watch::Sender<bool>,
) {
    let logger = ctl.logger.clone();

    if start(&mut actor, &ctl, &logger).await {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let msg = tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let outcome = AssertUnwindSafe(actor.handle(&ctl, msg)).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => ActorFailure::Error(e),
                Err(panic) => ActorFailure::Panic(panic_message(panic.as_ref())),
            };

            error!(logger, "Actor failed to handle message"; "error" => %failure);
            match actor.on_failure(&failure) {
                FailureAction::Resume => {}
                FailureAction::Restart => {
                    info!(logger, "Restarting actor");
                    if !start(&mut actor, &ctl, &logger).await {
                        break;
                    }
                }
                FailureAction::Stop => break,
            }
        }
    }

    rx.close();
    actor.on_stop().await;
    ctl.actor_ref.stop();
    let _ = terminated_tx.send(true);
    info!(logger, "Actor stopped");
}

/// Run `on_start`, consulting `on_failure` when it fails. Returns whether the
/// actor should go on to serve its mailbox.
async fn start<A: Actor>(actor: &mut A, ctl: &ActorControl<A::Message>, logger: &Logger) -> bool {
    for attempt in 1..=MAX_START_ATTEMPTS {
        let outcome = AssertUnwindSafe(actor.on_start(ctl)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => ActorFailure::Error(e),
            Err(panic) => ActorFailure::Panic(panic_message(panic.as_ref())),
        };
        error!(logger, "Actor failed to start"; "attempt" => attempt, "error" => %failure);
        match actor.on_failure(&failure) {
            FailureAction::Resume => return true,
            FailureAction::Restart => continue,
            FailureAction::Stop => return false,
        }
    }
    false
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
