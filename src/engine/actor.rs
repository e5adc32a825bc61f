//! Tokio task that owns a [`ConversationSync`] and serializes every access.
//!
//! Inbound events and user intents arrive on one channel, so the state has
//! a single writer. The playback ticker is only polled while some session has
//! a backlog. Every change is published as a [`ConversationView`] on a watch
//! channel.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::{NodeId, Tag};
use crate::engine::conversation::ConversationSync;
use crate::navigator::branch_ops::Direction;
use crate::protocol::events::InboundEvent;
use crate::view::projection::ConversationView;

/// User action forwarded to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserIntent {
    /// Send a message under the active leaf.
    Send {
        /// Message text.
        content: String,
    },
    /// Edit a message into a new sibling.
    Edit {
        /// Node being edited.
        node_id: NodeId,
        /// Replacement text.
        content: String,
    },
    /// Regenerate an assistant reply.
    RetryAssistant {
        /// Assistant node.
        node_id: NodeId,
    },
    /// Regenerate from a user message.
    RetryUser {
        /// User node.
        node_id: NodeId,
    },
    /// Move to a neighbouring sibling.
    SwitchBranch {
        /// Node currently shown.
        node_id: NodeId,
        /// Arrow pressed.
        direction: Direction,
    },
    /// Delete one branch.
    DeleteBranch {
        /// Node to delete.
        node_id: NodeId,
    },
}

enum Command {
    Intent(UserIntent, oneshot::Sender<SyncResult<Tag>>),
    Stop(oneshot::Sender<bool>),
    Event(InboundEvent),
    Frame(String),
}

/// Cloneable handle to a running [`SyncEngine`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<ConversationView>,
    shutdown: Arc<Notify>,
}

impl SyncHandle {
    /// Run a user intent and wait for its tag.
    ///
    /// # Errors
    /// Whatever the intent returns, or `TransportClosed` if the engine stopped.
    pub async fn request(&self, intent: UserIntent) -> SyncResult<Tag> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Intent(intent, reply))
            .map_err(|_| SyncError::TransportClosed)?;
        response.await.map_err(|_| SyncError::TransportClosed)?
    }

    /// Client-side stop; returns whether a turn was in flight.
    ///
    /// # Errors
    /// `TransportClosed` if the engine stopped.
    pub async fn stop(&self) -> SyncResult<bool> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stop(reply))
            .map_err(|_| SyncError::TransportClosed)?;
        response.await.map_err(|_| SyncError::TransportClosed)
    }

    /// Hand a decoded backend event to the engine.
    ///
    /// # Errors
    /// `TransportClosed` if the engine stopped.
    pub fn deliver(&self, event: InboundEvent) -> SyncResult<()> {
        self.commands
            .send(Command::Event(event))
            .map_err(|_| SyncError::TransportClosed)
    }

    /// Hand a raw backend frame to the engine.
    ///
    /// # Errors
    /// `TransportClosed` if the engine stopped.
    pub fn deliver_frame(&self, frame: impl Into<String>) -> SyncResult<()> {
        self.commands
            .send(Command::Frame(frame.into()))
            .map_err(|_| SyncError::TransportClosed)
    }

    /// Latest published view.
    #[must_use]
    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes on every published view.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConversationView> {
        self.view.clone()
    }

    /// Ask the engine to stop after the current command.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Background task driving one conversation.
pub struct SyncEngine {
    sync: ConversationSync,
    frame_interval: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    view: watch::Sender<ConversationView>,
    shutdown: Arc<Notify>,
}

impl SyncEngine {
    /// Wrap sync state in an engine and return the handle that drives it.
    #[must_use]
    pub fn new(sync: ConversationSync, frame_interval: Duration) -> (Self, SyncHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (view, view_rx) = watch::channel(sync.snapshot(std::time::Instant::now()));
        let shutdown = Arc::new(Notify::new());
        let handle = SyncHandle {
            commands: commands_tx,
            view: view_rx,
            shutdown: Arc::clone(&shutdown),
        };
        let engine = Self {
            sync,
            frame_interval,
            commands,
            view,
            shutdown,
        };
        (engine, handle)
    }

    /// Spawn the engine; the task yields the final (disposed) state.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<ConversationSync> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> ConversationSync {
        let Self {
            mut sync,
            frame_interval,
            mut commands,
            view,
            shutdown,
        } = self;

        info!(conversation = %sync.conversation(), ?frame_interval, "sync engine started");
        let mut ticker = time::interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame: Option<Instant> = None;

        loop {
            let draining = sync.has_backlog();
            if !draining {
                last_frame = None;
            }
            let deadline = sync
                .next_soft_deadline(std::time::Instant::now())
                .map(Instant::from_std);

            tokio::select! {
                () = shutdown.notified() => {
                    info!("sync engine shutting down");
                    break;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("all handles dropped");
                        break;
                    };
                    handle_command(&mut sync, command);
                }
                now = ticker.tick(), if draining => {
                    let elapsed = last_frame.map_or(frame_interval, |last| now - last);
                    last_frame = Some(now);
                    sync.tick(elapsed);
                }
                () = sleep_until_deadline(deadline), if deadline.is_some() => {
                    debug!("operation passed its soft timeout");
                }
            }

            publish(&view, &sync);
        }

        sync.dispose();
        publish(&view, &sync);
        sync
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        time::sleep_until(deadline).await;
    }
}

fn handle_command(sync: &mut ConversationSync, command: Command) {
    match command {
        Command::Intent(intent, reply) => {
            let result = run_intent(sync, intent);
            if let Err(err) = &result {
                debug!(%err, "intent rejected");
            }
            let _ = reply.send(result);
        }
        Command::Stop(reply) => {
            let _ = reply.send(sync.stop());
        }
        Command::Event(event) => {
            if let Err(err) = sync.handle_event(event) {
                warn!(%err, "inbound event not applied");
            }
        }
        Command::Frame(frame) => {
            if let Err(err) = sync.handle_frame(&frame) {
                warn!(%err, "inbound frame not applied");
            }
        }
    }
}

pub(crate) fn run_intent(sync: &mut ConversationSync, intent: UserIntent) -> SyncResult<Tag> {
    match intent {
        UserIntent::Send { content } => sync.send(content),
        UserIntent::Edit { node_id, content } => sync.edit(&node_id, content),
        UserIntent::RetryAssistant { node_id } => sync.retry_assistant(&node_id),
        UserIntent::RetryUser { node_id } => sync.retry_user(&node_id),
        UserIntent::SwitchBranch { node_id, direction } => sync.switch_branch(&node_id, direction),
        UserIntent::DeleteBranch { node_id } => sync.delete_branch(&node_id),
    }
}

fn publish(view: &watch::Sender<ConversationView>, sync: &ConversationSync) {
    let next = sync.snapshot(std::time::Instant::now());
    view.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}
