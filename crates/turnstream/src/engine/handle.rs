//! Handle for communicating with the stream engine.
//!
//! `EngineHandle` wraps the engine mailbox plus the collaborators whose async
//! waits must not stall envelope processing: transport handshakes run on the
//! caller's task, and only their result is sent to the engine.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::Message;
use crate::store::MessageCache;
use crate::transport::{Transport, TurnRequest};

use super::actor::{SpawnedEngine, StreamEngine};
use super::actor_types::{EngineCommand, EngineError, EngineSettings, StreamInfo, StreamTicket};
use super::events::EngineEvent;
use super::notifier::{Notifier, SilentNotifier};
use super::view::LiveMessages;

/// Handle for interacting with a stream engine.
///
/// Cheap to clone. The engine stops after [`shutdown`](Self::shutdown) or
/// once every handle and every open stream is gone.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    view: LiveMessages,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn MessageCache>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    /// Spawn an engine with the default settings and no notifier.
    pub fn spawn(transport: Arc<dyn Transport>, cache: Arc<dyn MessageCache>) -> Self {
        Self::builder(transport, cache).spawn()
    }

    /// Configure an engine before spawning it.
    pub fn builder(transport: Arc<dyn Transport>, cache: Arc<dyn MessageCache>) -> EngineBuilder {
        EngineBuilder {
            transport,
            cache,
            notifier: Arc::new(SilentNotifier),
            settings: EngineSettings::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start a new turn.
    ///
    /// A transport rejection is returned as-is and no session is registered.
    pub async fn start_stream(&self, request: TurnRequest) -> Result<StreamTicket, EngineError> {
        let opened = self.transport.open(&request).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::AttachStart {
                request,
                message_id: opened.message_id,
                channel: opened.channel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::EngineShutdown)?;

        reply_rx.await.map_err(|_| EngineError::EngineShutdown)?
    }

    /// Resume an existing assistant message.
    ///
    /// With `after_seq` the engine keeps its content and rejects every
    /// sequence at or below the cursor. Without it the server re-sends the
    /// whole turn and the chat's dedup window is cleared.
    pub async fn replay_stream(
        &self,
        chat_id: &str,
        message_id: &str,
        after_seq: Option<u64>,
    ) -> Result<StreamTicket, EngineError> {
        let channel = self.transport.resume(chat_id, message_id, after_seq).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::AttachReplay {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
                after_seq,
                channel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::EngineShutdown)?;

        reply_rx.await.map_err(|_| EngineError::EngineShutdown)?
    }

    /// Ask the server to stop generating for a chat.
    ///
    /// The turn still finalizes on its terminal envelope, or as interrupted if
    /// the channel closes first. Returns how many sessions were marked.
    pub async fn stop_stream(&self, chat_id: &str) -> Result<usize, EngineError> {
        self.transport.stop(chat_id).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::MarkStopped {
                chat_id: chat_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::EngineShutdown)?;

        reply_rx.await.map_err(|_| EngineError::EngineShutdown)
    }

    /// Flush every open stream to the cache and stop the engine.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(EngineCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }

        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Stream engine task failed");
        }
        debug!("Stream engine shut down");
    }

    // ------------------------------------------------------------------------
    // Read Operations
    // ------------------------------------------------------------------------

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Current state of a message: live view first, cache second.
    pub async fn message(&self, message_id: &str) -> Result<Option<Message>, EngineError> {
        if let Some(message) = self.view.get(message_id) {
            return Ok(Some(message));
        }
        Ok(self.cache.get_message(message_id).await?)
    }

    /// Messages of a chat, with live state replacing cached state.
    pub async fn chat_messages(&self, chat_id: &str) -> Result<Vec<Message>, EngineError> {
        let mut messages = self.cache.chat_messages(chat_id).await?;
        for message in &mut messages {
            if let Some(live) = self.view.get(&message.id) {
                *message = live;
            }
        }
        // Anything only the view knows about goes last, in view order.
        for live in self.view.chat_messages(chat_id) {
            if !messages.iter().any(|m| m.id == live.id) {
                messages.push(live);
            }
        }
        Ok(messages)
    }

    /// The live message view.
    pub fn view(&self) -> &LiveMessages {
        &self.view
    }

    /// Sessions currently open.
    pub async fn active_streams(&self) -> Result<Vec<StreamInfo>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::ActiveStreams { reply: reply_tx })
            .await
            .map_err(|_| EngineError::EngineShutdown)?;

        reply_rx.await.map_err(|_| EngineError::EngineShutdown)
    }
}

/// Builder for [`EngineHandle`].
pub struct EngineBuilder {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn MessageCache>,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
}

impl EngineBuilder {
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Spawn the engine task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> EngineHandle {
        let SpawnedEngine {
            tx,
            events,
            view,
            task,
        } = StreamEngine::spawn(self.settings, self.cache.clone(), self.notifier);

        EngineHandle {
            tx,
            events,
            view,
            transport: self.transport,
            cache: self.cache,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}
