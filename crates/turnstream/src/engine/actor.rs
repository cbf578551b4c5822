//! Stream engine actor.
//!
//! The engine owns every piece of per-stream state and processes commands
//! from a single mailbox. Transport channels are drained by pump tasks that
//! forward signals into the same mailbox, so envelopes of one stream are
//! applied in delivery order and never interleave with lifecycle commands.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use turnstream_protocol::{Envelope, QueueProcessing};

use crate::message::{Message, MessagePatch, StreamStatus};
use crate::store::MessageCache;
use crate::transport::{ChannelSignal, ConnectionPhase, StreamChannel, TurnRequest};

use super::accumulator::{ContentAccumulator, PushOutcome};
use super::actor_types::{
    EngineCommand, EngineError, EngineSettings, FLUSH_CHANNEL_CAPACITY, StreamInfo, StreamTicket,
};
use super::dedup::SequenceDeduplicator;
use super::events::{EngineEvent, FailureOrigin, StreamFailure};
use super::notifier::Notifier;
use super::projection::{FlushDue, ProjectionScheduler};
use super::registry::{PumpGuard, SessionRegistry, StreamOrigin, StreamSession};
use super::router::{self, Routed, Terminal};
use super::view::LiveMessages;

/// Everything a handle needs to talk to a spawned engine.
pub struct SpawnedEngine {
    pub tx: mpsc::Sender<EngineCommand>,
    pub events: broadcast::Sender<EngineEvent>,
    pub view: LiveMessages,
    pub task: JoinHandle<()>,
}

/// The engine task.
pub struct StreamEngine {
    settings: EngineSettings,
    registry: SessionRegistry,
    dedup: SequenceDeduplicator,
    scheduler: ProjectionScheduler,
    view: LiveMessages,
    cache: Arc<dyn MessageCache>,
    notifier: Arc<dyn Notifier>,
    events: broadcast::Sender<EngineEvent>,
    /// Used to hand pumps a sender without keeping the mailbox open forever.
    mailbox: mpsc::WeakSender<EngineCommand>,
    next_attach: u64,
    command_rx: mpsc::Receiver<EngineCommand>,
    flush_rx: mpsc::Receiver<FlushDue>,
}

impl StreamEngine {
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Spawn an engine task.
    pub fn spawn(
        settings: EngineSettings,
        cache: Arc<dyn MessageCache>,
        notifier: Arc<dyn Notifier>,
    ) -> SpawnedEngine {
        let (tx, command_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let view = LiveMessages::new();

        let engine = Self {
            registry: SessionRegistry::new(),
            dedup: SequenceDeduplicator::new(settings.window_capacity),
            scheduler: ProjectionScheduler::new(settings.debounce, flush_tx),
            view: view.clone(),
            cache,
            notifier,
            events: events.clone(),
            mailbox: tx.downgrade(),
            next_attach: 0,
            command_rx,
            flush_rx,
            settings,
        };

        let task = tokio::spawn(engine.run());
        SpawnedEngine {
            tx,
            events,
            view,
            task,
        }
    }

    async fn run(mut self) {
        debug!(
            debounce_ms = self.settings.debounce.as_millis() as u64,
            window_capacity = self.settings.window_capacity,
            "Stream engine started"
        );

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Shutdown { reply }) => {
                            self.flush_all().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("All engine handles dropped, shutting down");
                            self.flush_all().await;
                            break;
                        }
                    }
                }

                Some(due) = self.flush_rx.recv() => {
                    self.handle_flush_due(due).await;
                }
            }
        }

        debug!("Stream engine stopped");
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::AttachStart {
                request,
                message_id,
                channel,
                reply,
            } => {
                let result = self.attach_start(request, message_id, channel).await;
                let _ = reply.send(result);
            }
            EngineCommand::AttachReplay {
                chat_id,
                message_id,
                after_seq,
                channel,
                reply,
            } => {
                let result = self
                    .attach_replay(chat_id, message_id, after_seq, channel)
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::MarkStopped { chat_id, reply } => {
                let _ = reply.send(self.mark_stopped(&chat_id));
            }
            EngineCommand::Signal {
                stream_id,
                attach_id,
                signal,
            } => {
                self.handle_signal(&stream_id, attach_id, signal).await;
            }
            EngineCommand::ActiveStreams { reply } => {
                let _ = reply.send(self.active_streams());
            }
            // Handled by the run loop.
            EngineCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Attach
    // ------------------------------------------------------------------------

    async fn attach_start(
        &mut self,
        request: TurnRequest,
        message_id: String,
        channel: StreamChannel,
    ) -> Result<StreamTicket, EngineError> {
        let stream_id = channel.stream_id().to_string();
        let chat_id = request.chat_id.clone();

        let user = Message::user(&request.user_message_id, &chat_id, &request.content);
        let placeholder = Message::assistant_placeholder(&message_id, &chat_id, &stream_id);
        self.cache.add_message(user.clone()).await?;
        if let Err(e) = self.cache.add_message(placeholder.clone()).await {
            // Take the user message back out so no half-started turn remains.
            if let Err(cleanup) = self
                .cache
                .remove_messages(std::slice::from_ref(&request.user_message_id))
                .await
            {
                warn!(message_id = %request.user_message_id, error = %cleanup, "Failed to remove user message of unstarted turn");
            }
            return Err(e.into());
        }
        self.view.insert(user);
        self.view.insert(placeholder);

        let session = StreamSession::new(&stream_id, &chat_id, &message_id, StreamOrigin::Start);
        let mut session = self.attach(session, channel);
        session.user_message_id = Some(request.user_message_id.clone());
        self.register(session);

        info!(
            chat_id = %chat_id,
            stream_id = %stream_id,
            message_id = %message_id,
            "Stream started"
        );

        Ok(StreamTicket {
            chat_id,
            message_id,
            stream_id,
            user_message_id: Some(request.user_message_id),
        })
    }

    async fn attach_replay(
        &mut self,
        chat_id: String,
        message_id: String,
        after_seq: Option<u64>,
        channel: StreamChannel,
    ) -> Result<StreamTicket, EngineError> {
        let stream_id = channel.stream_id().to_string();

        // Live view first: it is never behind the cache.
        let message = match self.view.get(&message_id) {
            Some(message) => message,
            None => {
                let message = self
                    .cache
                    .get_message(&message_id)
                    .await?
                    .ok_or_else(|| EngineError::MessageNotFound(message_id.clone()))?;
                self.view.insert(message.clone());
                message
            }
        };

        // A replay supersedes any session still open for the same message.
        if let Some(existing) = self
            .registry
            .get_stream_by_chat_and_message(&chat_id, &message_id)
            .map(|s| s.id.clone())
        {
            debug!(chat_id = %chat_id, stream_id = %existing, "Replacing session for replayed message");
            self.scheduler.cancel(&existing);
            self.registry.remove_stream(&existing);
        }

        match after_seq {
            None => self.dedup.clear_chat(&chat_id),
            Some(floor) => self.dedup.resume_from(&chat_id, floor),
        }

        let session = StreamSession::new(&stream_id, &chat_id, &message_id, StreamOrigin::Replay);
        let mut session = self.attach(session, channel);
        // A cold replay re-sends the whole turn, so it starts from nothing.
        if after_seq.is_some() {
            session.last_seq = message.last_seq;
            session.accumulator =
                ContentAccumulator::new(message.content_render, message.content_text);
        }
        self.register(session);

        let patch = MessagePatch {
            active_stream_id: Some(Some(stream_id.clone())),
            stream_status: Some(StreamStatus::Streaming),
            ..MessagePatch::default()
        };
        self.view.apply(&message_id, &patch);
        self.write_cache(&message_id, &patch).await;

        info!(
            chat_id = %chat_id,
            stream_id = %stream_id,
            message_id = %message_id,
            after_seq = ?after_seq,
            "Stream replay started"
        );

        Ok(StreamTicket {
            chat_id,
            message_id,
            stream_id,
            user_message_id: None,
        })
    }

    fn register(&mut self, session: StreamSession) {
        let stream_id = session.id.clone();
        if self.registry.add_stream(session).is_some() {
            debug!(stream_id = %stream_id, "Replaced session with the same stream id");
            self.scheduler.cancel(&stream_id);
        }
    }

    /// Give a new session its attach id and the pump draining `channel`.
    fn attach(&mut self, mut session: StreamSession, channel: StreamChannel) -> StreamSession {
        self.next_attach += 1;
        session.attach_id = self.next_attach;
        session.pump = self.spawn_pump(channel, session.attach_id);
        session
    }

    /// Forward a channel's signals into the mailbox until it closes.
    fn spawn_pump(&self, mut channel: StreamChannel, attach_id: u64) -> PumpGuard {
        let Some(tx) = self.mailbox.upgrade() else {
            return PumpGuard::detached();
        };
        let stream_id = channel.stream_id().to_string();

        PumpGuard::new(tokio::spawn(async move {
            loop {
                let signal = channel.recv().await;
                let closed = matches!(signal, ChannelSignal::Closed);
                let cmd = EngineCommand::Signal {
                    stream_id: stream_id.clone(),
                    attach_id,
                    signal,
                };
                if tx.send(cmd).await.is_err() || closed {
                    break;
                }
            }
        }))
    }

    fn mark_stopped(&mut self, chat_id: &str) -> usize {
        let ids = self.registry.stream_ids_for_chat(chat_id);
        for id in &ids {
            if let Some(session) = self.registry.get_stream_mut(id) {
                session.stop_requested = true;
            }
        }
        info!(chat_id = %chat_id, sessions = ids.len(), "Stop requested");
        ids.len()
    }

    fn active_streams(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .registry
            .stream_ids()
            .iter()
            .filter_map(|id| self.registry.get_stream(id))
            .map(|s| StreamInfo {
                stream_id: s.id.clone(),
                chat_id: s.chat_id.clone(),
                message_id: s.message_id.clone(),
                origin: s.origin,
                started_at: s.started_at,
                last_seq: s.last_seq,
                stop_requested: s.stop_requested,
            })
            .collect();
        streams.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        streams
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    async fn handle_signal(&mut self, stream_id: &str, attach_id: u64, signal: ChannelSignal) {
        // A replay may reuse a stream id; the superseded pump's leftovers
        // must not reach the new session.
        if !self.registry.is_current(stream_id, attach_id) {
            debug!(stream_id = %stream_id, attach_id, "Dropping signal for removed stream");
            return;
        }

        match signal {
            ChannelSignal::Envelope(envelope) => self.handle_envelope(stream_id, envelope).await,
            ChannelSignal::Error {
                phase: ConnectionPhase::Connecting,
                message,
            } => {
                debug!(stream_id = %stream_id, error = %message, "Transport reconnecting");
            }
            ChannelSignal::Error {
                phase: ConnectionPhase::Established,
                message,
            } => {
                let failure = StreamFailure {
                    origin: FailureOrigin::Transport,
                    message,
                    code: None,
                };
                self.fail_turn(stream_id, failure).await;
            }
            ChannelSignal::Closed => self.handle_closed(stream_id).await,
        }
    }

    async fn handle_envelope(&mut self, stream_id: &str, envelope: Envelope) {
        let Some(session) = self.registry.resolve(stream_id, &envelope) else {
            debug!(
                stream_id = %stream_id,
                chat_id = %envelope.chat_id,
                "Dropping envelope for another chat"
            );
            return;
        };

        if !self.dedup.should_accept(&session.chat_id, envelope.seq) {
            debug!(
                chat_id = %session.chat_id,
                seq = envelope.seq,
                kind = %envelope.kind,
                "Dropping duplicate or stale envelope"
            );
            return;
        }
        session.last_seq = session.last_seq.max(envelope.seq);

        let routed = router::route(&envelope);
        let targets_current = envelope.message_id == session.message_id;

        match routed {
            Routed::Dropped(reason) => {
                debug!(
                    chat_id = %session.chat_id,
                    seq = envelope.seq,
                    kind = %envelope.kind,
                    reason,
                    "Dropping envelope"
                );
            }
            Routed::Permission(request) => {
                let event = EngineEvent::PermissionRequested {
                    chat_id: session.chat_id.clone(),
                    message_id: session.message_id.clone(),
                    request,
                };
                self.emit(event);
            }
            Routed::Usage(usage) => {
                let event = EngineEvent::UsageUpdated {
                    chat_id: session.chat_id.clone(),
                    usage,
                };
                self.emit(event);
            }
            Routed::QueueProcessing(queue) => {
                self.queue_continuation(stream_id, queue).await;
            }
            Routed::Content(_) | Routed::Terminal(_) if !targets_current => {
                debug!(
                    chat_id = %session.chat_id,
                    seq = envelope.seq,
                    message_id = %envelope.message_id,
                    current = %session.message_id,
                    "Dropping envelope for a message this stream no longer builds"
                );
            }
            Routed::Content(event) => {
                let outcome = session.accumulator.push(&event);
                if outcome == PushOutcome::SynthesizedToolStart {
                    warn!(
                        chat_id = %session.chat_id,
                        message_id = %session.message_id,
                        seq = envelope.seq,
                        "Tool finished without a start event"
                    );
                }
                if outcome != PushOutcome::Ignored {
                    self.project(stream_id, false).await;
                    self.scheduler.schedule(stream_id);
                }
            }
            Routed::Terminal(Terminal::Complete) => {
                self.finalize(stream_id, StreamStatus::Completed).await;
            }
            Routed::Terminal(Terminal::Cancelled) => {
                self.finalize(stream_id, StreamStatus::Interrupted).await;
            }
            Routed::Terminal(Terminal::Error { message, code }) => {
                let failure = StreamFailure {
                    origin: FailureOrigin::Protocol,
                    message,
                    code,
                };
                self.fail_turn(stream_id, failure).await;
            }
        }
    }

    async fn handle_flush_due(&mut self, due: FlushDue) {
        if self.scheduler.take_due(&due) && self.registry.is_live(&due.stream_id) {
            self.project(&due.stream_id, true).await;
        }
    }

    // ------------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------------

    /// Push the session's snapshot to the live view, and to the cache when
    /// `write_to_cache` is set.
    async fn project(&mut self, stream_id: &str, write_to_cache: bool) {
        let Some(session) = self.registry.get_stream(stream_id) else {
            return;
        };
        let mut patch = snapshot_patch(session);
        patch.active_stream_id = Some(Some(session.id.clone()));
        let message_id = session.message_id.clone();
        let event = EngineEvent::ContentUpdated {
            chat_id: session.chat_id.clone(),
            message_id: message_id.clone(),
            stream_id: session.id.clone(),
            last_seq: session.last_seq,
        };

        self.view.apply(&message_id, &patch);
        self.emit(event);

        if write_to_cache {
            self.write_cache(&message_id, &patch).await;
        }
    }

    async fn write_cache(&self, message_id: &str, patch: &MessagePatch) {
        if let Err(e) = self.cache.update_message(message_id, patch).await {
            warn!(message_id = %message_id, error = %e, "Failed to write message to cache");
        }
    }

    /// Write a detached session's final state to view and cache.
    async fn write_final(&mut self, session: &StreamSession, status: Option<StreamStatus>) {
        let mut patch = snapshot_patch(session);
        patch.active_stream_id = Some(None);
        patch.stream_status = status;

        self.view.apply(&session.message_id, &patch);
        self.emit(EngineEvent::ContentUpdated {
            chat_id: session.chat_id.clone(),
            message_id: session.message_id.clone(),
            stream_id: session.id.clone(),
            last_seq: session.last_seq,
        });
        self.write_cache(&session.message_id, &patch).await;
    }

    /// Remove a session and its timer. Dropping the returned session aborts
    /// its pump.
    fn detach(&mut self, stream_id: &str) -> Option<StreamSession> {
        self.scheduler.cancel(stream_id);
        self.registry.remove_stream(stream_id)
    }

    // ------------------------------------------------------------------------
    // Terminal paths
    // ------------------------------------------------------------------------

    async fn finalize(&mut self, stream_id: &str, status: StreamStatus) {
        let Some(session) = self.detach(stream_id) else {
            return;
        };
        self.write_final(&session, Some(status)).await;

        info!(
            chat_id = %session.chat_id,
            stream_id = %session.id,
            message_id = %session.message_id,
            status = ?status,
            last_seq = session.last_seq,
            "Turn finished"
        );

        if status == StreamStatus::Completed && self.settings.notifications_enabled {
            self.notifier
                .turn_completed(&session.chat_id, &session.message_id);
        }

        self.emit(EngineEvent::TurnCompleted {
            chat_id: session.chat_id.clone(),
            message_id: session.message_id.clone(),
            status,
        });
    }

    async fn fail_turn(&mut self, stream_id: &str, failure: StreamFailure) {
        let Some(session) = self.detach(stream_id) else {
            return;
        };

        // An error before any content leaves no ghost turn behind.
        let removed = match &session.user_message_id {
            Some(user_message_id) if session.accumulator.is_empty() => {
                let ids = vec![user_message_id.clone(), session.message_id.clone()];
                self.view.remove(&ids);
                if let Err(e) = self.cache.remove_messages(&ids).await {
                    warn!(message_id = %session.message_id, error = %e, "Failed to remove failed turn from cache");
                }
                true
            }
            _ => {
                self.write_final(&session, Some(StreamStatus::Error)).await;
                false
            }
        };

        warn!(
            chat_id = %session.chat_id,
            stream_id = %session.id,
            message_id = %session.message_id,
            error = %failure,
            removed,
            "Turn failed"
        );

        self.emit(EngineEvent::TurnFailed {
            chat_id: session.chat_id.clone(),
            message_id: session.message_id.clone(),
            failure,
            removed,
        });
    }

    async fn handle_closed(&mut self, stream_id: &str) {
        let stop_requested = self
            .registry
            .get_stream(stream_id)
            .is_some_and(|s| s.stop_requested);
        if stop_requested {
            self.finalize(stream_id, StreamStatus::Interrupted).await;
            return;
        }

        let Some(session) = self.detach(stream_id) else {
            return;
        };
        // Status stays `streaming` so the caller can resume from last_seq.
        self.write_final(&session, None).await;

        info!(
            chat_id = %session.chat_id,
            stream_id = %session.id,
            message_id = %session.message_id,
            last_seq = session.last_seq,
            "Stream closed without terminal envelope"
        );

        self.emit(EngineEvent::StreamDisconnected {
            chat_id: session.chat_id.clone(),
            message_id: session.message_id.clone(),
            stream_id: session.id.clone(),
            last_seq: session.last_seq,
        });
    }

    // ------------------------------------------------------------------------
    // Queue continuation
    // ------------------------------------------------------------------------

    async fn queue_continuation(&mut self, stream_id: &str, queue: QueueProcessing) {
        let Some((chat_id, previous_message_id)) = self
            .registry
            .get_stream(stream_id)
            .map(|s| (s.chat_id.clone(), s.message_id.clone()))
        else {
            return;
        };
        let next = queue.message_id.clone();

        if previous_message_id == next {
            debug!(chat_id = %chat_id, message_id = %next, "Stream already builds queued message");
            return;
        }

        // Hand every other message of the chat back to the cache.
        for id in self.registry.stream_ids_for_chat(&chat_id) {
            let Some(session) = self.registry.get_stream(&id) else {
                continue;
            };
            if session.message_id == next {
                continue;
            }

            if id == stream_id {
                self.scheduler.cancel(&id);
                let Some(carrier) = self.registry.get_stream(&id) else {
                    continue;
                };
                let mut patch = snapshot_patch(carrier);
                patch.active_stream_id = Some(None);
                patch.stream_status = Some(StreamStatus::Completed);
                let (chat, message) = (carrier.chat_id.clone(), carrier.message_id.clone());

                self.view.apply(&message, &patch);
                self.write_cache(&message, &patch).await;
                self.emit(EngineEvent::TurnCompleted {
                    chat_id: chat,
                    message_id: message,
                    status: StreamStatus::Completed,
                });
            } else if let Some(other) = self.detach(&id) {
                self.write_final(&other, Some(StreamStatus::Completed)).await;
                self.emit(EngineEvent::TurnCompleted {
                    chat_id: other.chat_id.clone(),
                    message_id: other.message_id.clone(),
                    status: StreamStatus::Completed,
                });
            }
        }

        // Re-target the carrying session with a fresh accumulator.
        self.registry
            .update_stream_message_id(&chat_id, &previous_message_id, &next);
        if let Some(carrier) = self.registry.get_stream_mut(stream_id) {
            carrier.accumulator = ContentAccumulator::default();
            carrier.user_message_id = Some(queue.user_message_id.clone());
        }

        if !self.view.contains(&queue.user_message_id) {
            let user = Message::user(&queue.user_message_id, &chat_id, &queue.content);
            if let Err(e) = self.cache.add_message(user.clone()).await {
                warn!(message_id = %queue.user_message_id, error = %e, "Failed to add queued user message to cache");
            }
            self.view.insert(user);
        }
        let placeholder = Message::assistant_placeholder(&next, &chat_id, stream_id);
        if let Err(e) = self.cache.add_message(placeholder.clone()).await {
            warn!(message_id = %next, error = %e, "Failed to add assistant placeholder to cache");
        }
        self.view.insert(placeholder);

        info!(
            chat_id = %chat_id,
            stream_id = %stream_id,
            previous_message_id = %previous_message_id,
            message_id = %next,
            announced_stream_id = ?queue.stream_id,
            "Queue advanced"
        );

        self.emit(EngineEvent::QueueAdvanced {
            chat_id,
            previous_message_id,
            message_id: next,
            user_message_id: queue.user_message_id,
            stream_id: stream_id.to_string(),
        });
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Write every open session to the cache and release timers and pumps.
    async fn flush_all(&mut self) {
        self.scheduler.clear();
        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            self.write_final(&session, None).await;
        }
        if count > 0 {
            info!(sessions = count, "Flushed open streams on shutdown");
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Content fields of a session's current snapshot.
fn snapshot_patch(session: &StreamSession) -> MessagePatch {
    let snapshot = session.accumulator.snapshot();
    MessagePatch {
        content_text: Some(snapshot.content_text),
        content_render: Some(snapshot.events),
        last_seq: Some(session.last_seq),
        ..MessagePatch::default()
    }
}
