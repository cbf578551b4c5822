//! Transport abstraction.
//!
//! A transport opens and resumes server streams for a chat and hands the
//! engine a [`StreamChannel`] per connection. How bytes move below the
//! envelope boundary is the transport's business.

mod error;
pub mod scripted;

use async_trait::async_trait;
use tokio::sync::mpsc;
use turnstream_protocol::Envelope;

pub use error::TransportError;
pub use scripted::{Script, ScriptStep, ScriptedTransport};

/// Default buffer size of a stream channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A request to start a new assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub chat_id: String,
    /// Id of the user message that opens the turn.
    pub user_message_id: String,
    pub content: String,
}

impl TurnRequest {
    /// Create a request with a freshly generated user message id.
    #[must_use]
    pub fn new(chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_message_id: ulid::Ulid::new().to_string(),
            content: content.into(),
        }
    }
}

/// Result of a successful [`Transport::open`].
#[derive(Debug)]
pub struct OpenedStream {
    pub channel: StreamChannel,
    /// Assistant message the server will fill.
    pub message_id: String,
}

/// Connection state at the time a transport error was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// The transport is (re)connecting on its own.
    Connecting,
    Established,
}

/// One item delivered by a stream channel.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Envelope(Envelope),
    Error {
        phase: ConnectionPhase,
        message: String,
    },
    /// The server ended the connection.
    Closed,
}

/// Receiving half of one transport connection.
#[derive(Debug)]
pub struct StreamChannel {
    stream_id: String,
    receiver: mpsc::Receiver<ChannelSignal>,
}

impl StreamChannel {
    /// Id of the connection this channel reads from.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Receive the next signal. A dropped sender reads as [`ChannelSignal::Closed`].
    pub async fn recv(&mut self) -> ChannelSignal {
        self.receiver.recv().await.unwrap_or(ChannelSignal::Closed)
    }
}

/// Sending half of a stream channel, held by the transport.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    sender: mpsc::Sender<ChannelSignal>,
}

impl ChannelSender {
    /// Deliver an envelope. Returns false once the engine stopped listening.
    pub async fn envelope(&self, envelope: Envelope) -> bool {
        self.sender
            .send(ChannelSignal::Envelope(envelope))
            .await
            .is_ok()
    }

    /// Report a transport error.
    pub async fn error(&self, phase: ConnectionPhase, message: impl Into<String>) -> bool {
        self.sender
            .send(ChannelSignal::Error {
                phase,
                message: message.into(),
            })
            .await
            .is_ok()
    }

    /// Signal a server-side close.
    pub async fn close(self) {
        let _ = self.sender.send(ChannelSignal::Closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Create a connected sender/channel pair for `stream_id`.
#[must_use]
pub fn stream_channel(
    stream_id: impl Into<String>,
    capacity: usize,
) -> (ChannelSender, StreamChannel) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        ChannelSender { sender },
        StreamChannel {
            stream_id: stream_id.into(),
            receiver,
        },
    )
}

/// Source of server streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a user message and open the stream answering it.
    async fn open(&self, request: &TurnRequest) -> Result<OpenedStream, TransportError>;

    /// Re-open the stream of an existing assistant message.
    ///
    /// The server re-sends everything after `after_seq`, or everything when
    /// `None`.
    async fn resume(
        &self,
        chat_id: &str,
        message_id: &str,
        after_seq: Option<u64>,
    ) -> Result<StreamChannel, TransportError>;

    /// Ask the server to stop generating for a chat.
    async fn stop(&self, chat_id: &str) -> Result<(), TransportError>;
}
