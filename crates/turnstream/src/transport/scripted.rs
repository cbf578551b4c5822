//! Transport that plays pre-recorded envelope scripts.
//!
//! Scripts are queued per chat. Each `open` or `resume` for a chat consumes
//! the next script and plays it into a fresh channel from a background task.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use turnstream_protocol::Envelope;

use super::{
    ConnectionPhase, DEFAULT_CHANNEL_CAPACITY, OpenedStream, StreamChannel, Transport,
    TransportError, TurnRequest, stream_channel,
};

/// One step of a script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Envelope(Envelope),
    Error {
        phase: ConnectionPhase,
        message: String,
    },
    /// Wait before the next step.
    Pause(Duration),
}

/// A recorded server stream.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Connection id; generated when empty.
    pub stream_id: String,
    /// Assistant message id returned from `open`.
    pub message_id: String,
    pub steps: Vec<ScriptStep>,
    /// Keep the channel open after the last step instead of closing it.
    pub hold_open: bool,
}

impl Script {
    /// Build a script from envelopes, taking ids from the first one.
    #[must_use]
    pub fn from_envelopes(envelopes: Vec<Envelope>) -> Self {
        let (stream_id, message_id) = envelopes
            .first()
            .map(|e| (e.stream_id.clone(), e.message_id.clone()))
            .unwrap_or_default();
        Self {
            stream_id,
            message_id,
            steps: envelopes.into_iter().map(ScriptStep::Envelope).collect(),
            hold_open: false,
        }
    }
}

/// Transport backed by per-chat script queues.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    stops: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next `open` or `resume` on `chat_id`.
    pub async fn push_script(&self, chat_id: impl Into<String>, script: Script) {
        self.scripts
            .lock()
            .await
            .entry(chat_id.into())
            .or_default()
            .push_back(script);
    }

    /// Chats for which `stop` was called, in call order.
    pub async fn stop_requests(&self) -> Vec<String> {
        self.stops.lock().await.clone()
    }

    async fn next_script(&self, chat_id: &str) -> Result<Script, TransportError> {
        self.scripts
            .lock()
            .await
            .get_mut(chat_id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| TransportError::rejected(format!("no scripted stream for chat {chat_id}")))
    }
}

fn play(mut script: Script, after_seq: Option<u64>) -> StreamChannel {
    if script.stream_id.is_empty() {
        script.stream_id = ulid::Ulid::new().to_string();
    }
    let (sender, channel) = stream_channel(script.stream_id.clone(), DEFAULT_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        for step in script.steps {
            let delivered = match step {
                ScriptStep::Envelope(envelope) => {
                    if after_seq.is_some_and(|floor| envelope.seq <= floor) {
                        continue;
                    }
                    sender.envelope(envelope).await
                }
                ScriptStep::Error { phase, message } => sender.error(phase, message).await,
                ScriptStep::Pause(delay) => {
                    tokio::time::sleep(delay).await;
                    true
                }
            };
            if !delivered {
                debug!(stream_id = %script.stream_id, "Scripted stream receiver dropped");
                return;
            }
        }
        if script.hold_open {
            // Park until the engine drops the channel.
            while !sender.is_closed() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        } else {
            sender.close().await;
        }
    });

    channel
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, request: &TurnRequest) -> Result<OpenedStream, TransportError> {
        let script = self.next_script(&request.chat_id).await?;
        let message_id = if script.message_id.is_empty() {
            ulid::Ulid::new().to_string()
        } else {
            script.message_id.clone()
        };
        Ok(OpenedStream {
            channel: play(script, None),
            message_id,
        })
    }

    async fn resume(
        &self,
        chat_id: &str,
        _message_id: &str,
        after_seq: Option<u64>,
    ) -> Result<StreamChannel, TransportError> {
        let script = self.next_script(chat_id).await?;
        Ok(play(script, after_seq))
    }

    async fn stop(&self, chat_id: &str) -> Result<(), TransportError> {
        self.stops.lock().await.push(chat_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use turnstream_protocol::EnvelopeKind;

    use super::super::ChannelSignal;
    use super::*;

    fn envelope(seq: u64, kind: EnvelopeKind) -> Envelope {
        Envelope {
            chat_id: "c1".to_string(),
            message_id: "m1".to_string(),
            stream_id: "s1".to_string(),
            seq,
            kind,
            payload: json!({}),
            ts: None,
        }
    }

    #[tokio::test]
    async fn open_plays_script_then_closes() {
        let transport = ScriptedTransport::new();
        transport
            .push_script(
                "c1",
                Script::from_envelopes(vec![
                    envelope(1, EnvelopeKind::AssistantText),
                    envelope(2, EnvelopeKind::Complete),
                ]),
            )
            .await;

        let opened = transport.open(&TurnRequest::new("c1", "hi")).await.unwrap();
        assert_eq!(opened.message_id, "m1");

        let mut channel = opened.channel;
        assert_eq!(channel.stream_id(), "s1");
        assert!(matches!(channel.recv().await, ChannelSignal::Envelope(e) if e.seq == 1));
        assert!(matches!(channel.recv().await, ChannelSignal::Envelope(e) if e.seq == 2));
        assert!(matches!(channel.recv().await, ChannelSignal::Closed));
    }

    #[tokio::test]
    async fn resume_skips_envelopes_at_or_below_cursor() {
        let transport = ScriptedTransport::new();
        transport
            .push_script(
                "c1",
                Script::from_envelopes(vec![
                    envelope(5, EnvelopeKind::AssistantText),
                    envelope(6, EnvelopeKind::Complete),
                ]),
            )
            .await;

        let mut channel = transport.resume("c1", "m1", Some(5)).await.unwrap();
        assert!(matches!(channel.recv().await, ChannelSignal::Envelope(e) if e.seq == 6));
    }

    #[tokio::test]
    async fn open_without_script_is_rejected() {
        let transport = ScriptedTransport::new();
        let err = transport
            .open(&TurnRequest::new("c1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { .. }));
    }

    #[tokio::test]
    async fn stop_is_recorded() {
        let transport = ScriptedTransport::new();
        transport.stop("c1").await.unwrap();
        assert_eq!(transport.stop_requests().await, vec!["c1".to_string()]);
    }
}
