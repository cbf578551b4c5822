//! Common test utilities.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};

use turnstream::engine::{EngineEvent, EngineHandle, EngineSettings, Notifier};
use turnstream::message::{Message, MessagePatch, Role};
use turnstream::protocol::{Envelope, EnvelopeKind};
use turnstream::store::{InMemoryMessageCache, MessageCache, StorageError, StorageResult};
use turnstream::transport::{
    ChannelSender, OpenedStream, StreamChannel, Transport, TransportError, TurnRequest,
    stream_channel,
};

pub const CHAT: &str = "chat-1";

// ============================================================================
// Transport
// ============================================================================

/// Transport whose channels are driven by the test.
///
/// Every `open` and `resume` creates a channel named `stream-N`, or the fixed
/// id set with [`Self::reuse_stream_id`]. The sending half is kept so the test
/// can feed envelopes through [`Self::sender`].
#[derive(Default)]
pub struct ManualTransport {
    senders: Mutex<HashMap<String, ChannelSender>>,
    opened: AtomicUsize,
    fixed_stream_id: Mutex<Option<String>>,
    reject_next: Mutex<Option<TransportError>>,
    stops: Mutex<Vec<String>>,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Name every later connection `stream_id`, like a server that keys
    /// streams by message.
    pub async fn reuse_stream_id(&self, stream_id: &str) {
        *self.fixed_stream_id.lock().await = Some(stream_id.to_string());
    }

    /// Fail the next `open` or `resume` with `error`.
    pub async fn reject_next(&self, error: TransportError) {
        *self.reject_next.lock().await = Some(error);
    }

    /// Sending half of an opened stream.
    pub async fn sender(&self, stream_id: &str) -> ChannelSender {
        self.senders
            .lock()
            .await
            .get(stream_id)
            .cloned()
            .unwrap_or_else(|| panic!("no channel opened for {stream_id}"))
    }

    /// Forget the sending half of a stream, closing the channel.
    pub async fn hang_up(&self, stream_id: &str) {
        self.senders.lock().await.remove(stream_id);
    }

    pub async fn stop_requests(&self) -> Vec<String> {
        self.stops.lock().await.clone()
    }

    async fn next_channel(&self) -> Result<StreamChannel, TransportError> {
        if let Some(error) = self.reject_next.lock().await.take() {
            return Err(error);
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let stream_id = self
            .fixed_stream_id
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| format!("stream-{n}"));
        let (sender, channel) = stream_channel(&stream_id, 64);
        self.senders.lock().await.insert(stream_id, sender);
        Ok(channel)
    }
}

#[async_trait]
impl Transport for ManualTransport {
    async fn open(&self, _request: &TurnRequest) -> Result<OpenedStream, TransportError> {
        let channel = self.next_channel().await?;
        let message_id = format!("msg-{}", channel.stream_id());
        Ok(OpenedStream {
            channel,
            message_id,
        })
    }

    async fn resume(
        &self,
        _chat_id: &str,
        _message_id: &str,
        _after_seq: Option<u64>,
    ) -> Result<StreamChannel, TransportError> {
        self.next_channel().await
    }

    async fn stop(&self, chat_id: &str) -> Result<(), TransportError> {
        self.stops.lock().await.push(chat_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Cache and notifier
// ============================================================================

/// In-memory cache that counts updates per message.
#[derive(Default)]
pub struct RecordingCache {
    inner: InMemoryMessageCache,
    updates: std::sync::Mutex<HashMap<String, usize>>,
    fail_assistant_adds: AtomicBool,
}

impl RecordingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later insert of an assistant message fail.
    pub fn fail_assistant_adds(&self) {
        self.fail_assistant_adds.store(true, Ordering::SeqCst);
    }

    pub fn update_count(&self, message_id: &str) -> usize {
        self.updates
            .lock()
            .unwrap()
            .get(message_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageCache for RecordingCache {
    async fn get_message(&self, message_id: &str) -> StorageResult<Option<Message>> {
        self.inner.get_message(message_id).await
    }

    async fn add_message(&self, message: Message) -> StorageResult<()> {
        if message.role == Role::Assistant && self.fail_assistant_adds.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".to_string()));
        }
        self.inner.add_message(message).await
    }

    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> StorageResult<()> {
        *self
            .updates
            .lock()
            .unwrap()
            .entry(message_id.to_string())
            .or_default() += 1;
        self.inner.update_message(message_id, patch).await
    }

    async fn remove_messages(&self, message_ids: &[String]) -> StorageResult<()> {
        self.inner.remove_messages(message_ids).await
    }

    async fn chat_messages(&self, chat_id: &str) -> StorageResult<Vec<Message>> {
        self.inner.chat_messages(chat_id).await
    }
}

#[derive(Default)]
pub struct CountingNotifier {
    completed: std::sync::Mutex<Vec<String>>,
}

impl CountingNotifier {
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

impl Notifier for CountingNotifier {
    fn turn_completed(&self, _chat_id: &str, message_id: &str) {
        self.completed.lock().unwrap().push(message_id.to_string());
    }
}

// ============================================================================
// Engine fixture
// ============================================================================

pub struct Fixture {
    pub engine: EngineHandle,
    pub transport: Arc<ManualTransport>,
    pub cache: Arc<RecordingCache>,
    pub notifier: Arc<CountingNotifier>,
    pub events: broadcast::Receiver<EngineEvent>,
}

pub fn fixture() -> Fixture {
    fixture_with(EngineSettings::default())
}

pub fn fixture_with(settings: EngineSettings) -> Fixture {
    let transport = ManualTransport::new();
    let cache = RecordingCache::new();
    let notifier = Arc::new(CountingNotifier::default());

    let engine = EngineHandle::builder(transport.clone(), cache.clone())
        .notifier(notifier.clone())
        .settings(settings)
        .spawn();
    let events = engine.subscribe();

    Fixture {
        engine,
        transport,
        cache,
        notifier,
        events,
    }
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

/// Wait until the engine has applied content up to `seq` for `message_id`.
pub async fn wait_for_seq(
    events: &mut broadcast::Receiver<EngineEvent>,
    message_id: &str,
    seq: u64,
) {
    wait_for(events, |e| {
        matches!(e, EngineEvent::ContentUpdated { message_id: m, last_seq, .. }
            if m == message_id && *last_seq >= seq)
    })
    .await;
}

pub async fn wait_for_terminal(
    events: &mut broadcast::Receiver<EngineEvent>,
    message_id: &str,
) -> EngineEvent {
    wait_for(events, |e| match e {
        EngineEvent::TurnCompleted { message_id: m, .. }
        | EngineEvent::TurnFailed { message_id: m, .. }
        | EngineEvent::StreamDisconnected { message_id: m, .. } => m == message_id,
        _ => false,
    })
    .await
}

// ============================================================================
// Envelopes
// ============================================================================

pub fn envelope(message_id: &str, seq: u64, kind: EnvelopeKind, payload: Value) -> Envelope {
    envelope_in(CHAT, message_id, seq, kind, payload)
}

pub fn envelope_in(
    chat_id: &str,
    message_id: &str,
    seq: u64,
    kind: EnvelopeKind,
    payload: Value,
) -> Envelope {
    Envelope {
        chat_id: chat_id.to_string(),
        message_id: message_id.to_string(),
        stream_id: String::new(),
        seq,
        kind,
        payload,
        ts: None,
    }
}

pub fn text(message_id: &str, seq: u64, text: &str) -> Envelope {
    text_in(CHAT, message_id, seq, text)
}

pub fn text_in(chat_id: &str, message_id: &str, seq: u64, text: &str) -> Envelope {
    envelope_in(
        chat_id,
        message_id,
        seq,
        EnvelopeKind::AssistantText,
        json!({ "text": text }),
    )
}

pub fn complete(message_id: &str, seq: u64) -> Envelope {
    complete_in(CHAT, message_id, seq)
}

pub fn complete_in(chat_id: &str, message_id: &str, seq: u64) -> Envelope {
    envelope_in(chat_id, message_id, seq, EnvelopeKind::Complete, json!({}))
}

pub fn error(message_id: &str, seq: u64, message: &str) -> Envelope {
    envelope(
        message_id,
        seq,
        EnvelopeKind::Error,
        json!({ "message": message, "code": "overloaded" }),
    )
}

/// Persisted assistant message as a cache would hold it after a disconnect.
pub fn persisted_assistant(message_id: &str, content: &str, last_seq: u64) -> Message {
    let mut message = Message::assistant_placeholder(message_id, CHAT, "");
    message.active_stream_id = None;
    message.content_text = content.to_string();
    message.content_render = vec![turnstream::message::RenderEvent::Text {
        text: content.to_string(),
    }];
    message.last_seq = last_seq;
    message
}
