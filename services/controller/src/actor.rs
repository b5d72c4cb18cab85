//! Single-owner tasks.
//!
//! An actor owns its state outright and processes one message at a time from
//! a bounded mailbox, so state it guards needs no locking. Request/reply is
//! done by putting a `oneshot::Sender` in the message.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(false)` to stop. [`ActorError::Fatal`] also stops the
    /// actor; any other error is logged and the next message is handled.
    async fn handle(&mut self, msg: Self::Message) -> Result<bool, ActorError>;

    /// Called once the mailbox has stopped.
    async fn on_stop(&mut self) {}
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActorError {
    /// Handling one message failed. Logged; the actor keeps running.
    #[error("message failed: {0}")]
    Failed(String),

    /// Handling failed in a way the actor cannot recover from.
    #[error("actor failed: {0}")]
    Fatal(String),

    /// The actor's mailbox is closed.
    #[error("actor stopped")]
    Stopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    stop_tx: watch::Sender<bool>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stop_tx: self.stop_tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::Stopped)
    }

    /// Ask the actor to stop once it finishes the current message.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Returns true once the actor's mailbox is closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start `actor` on its own task.
pub fn spawn<A: Actor>(actor: A, mailbox_size: usize) -> (ActorHandle<A::Message>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_size);
    let (stop_tx, stop_rx) = watch::channel(false);

    let name = actor.name().to_string();
    info!(actor = %name, "Spawned actor");
    let task = tokio::spawn(run_actor_loop(actor, rx, stop_rx));

    (ActorHandle { tx, stop_tx }, task)
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut stop: watch::Receiver<bool>,
) {
    let name = actor.name().to_string();
    let mut processed: u64 = 0;

    loop {
        tokio::select! {
            biased;

            // Check stop first
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(actor = %name, "Actor received stop signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor = %name, "Actor mailbox closed");
                    break;
                };
                processed += 1;

                match actor.handle(msg).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor = %name, "Actor requested stop");
                        break;
                    }
                    Err(ActorError::Fatal(e)) => {
                        error!(actor = %name, error = %e, "Actor failed");
                        break;
                    }
                    Err(e) => {
                        error!(actor = %name, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    rx.close();
    actor.on_stop().await;
    info!(actor = %name, messages_processed = processed, "Actor stopped");
}
