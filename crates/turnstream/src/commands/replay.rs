//! `turnstream replay` - run a recorded envelope stream through the engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use turnstream::config::Config;
use turnstream::engine::{EngineEvent, EngineHandle, EngineSettings, LogNotifier};
use turnstream::message::{Message, Role};
use turnstream::protocol::Envelope;
use turnstream::store::{InMemoryMessageCache, MessageCache};
use turnstream::transport::{Script, ScriptedTransport, TurnRequest};

use super::OutputFormat;

pub struct ReplayOptions {
    pub script: PathBuf,
    pub config: String,
    pub chat: Option<String>,
    pub message: Option<String>,
    pub after_seq: Option<u64>,
    pub format: OutputFormat,
}

pub async fn run(opts: ReplayOptions) -> Result<()> {
    let config = Config::load(&opts.config)
        .await
        .with_context(|| format!("invalid configuration in '{}'", opts.config))?;

    let envelopes = read_script(&opts.script).await?;
    let Some(chat_id) = opts
        .chat
        .clone()
        .or_else(|| envelopes.first().map(|e| e.chat_id.clone()))
    else {
        bail!("script '{}' has no envelopes", opts.script.display());
    };

    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_script(&chat_id, Script::from_envelopes(envelopes))
        .await;
    let cache = Arc::new(InMemoryMessageCache::new());

    let engine = EngineHandle::builder(transport, cache.clone())
        .notifier(Arc::new(LogNotifier))
        .settings(EngineSettings::from(&config))
        .spawn();
    let mut events = engine.subscribe();

    match &opts.message {
        Some(message_id) => {
            // The message being resumed has to exist somewhere; seed an empty one.
            if cache.get_message(message_id).await?.is_none() {
                let mut seed = Message::assistant_placeholder(message_id, &chat_id, "");
                seed.active_stream_id = None;
                seed.last_seq = opts.after_seq.unwrap_or(0);
                cache.add_message(seed).await?;
            }
            engine
                .replay_stream(&chat_id, message_id, opts.after_seq)
                .await?;
        }
        None => {
            engine
                .start_stream(TurnRequest::new(&chat_id, "(recorded turn)"))
                .await?;
        }
    }

    wait_for_streams(&engine, &mut events).await?;

    let messages = engine.chat_messages(&chat_id).await?;
    engine.shutdown().await;

    match opts.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&messages)?),
        OutputFormat::Text => print_transcript(&messages),
    }
    Ok(())
}

async fn read_script(path: &Path) -> Result<Vec<Envelope>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read script '{}'", path.display()))?;

    let mut envelopes = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Envelope::from_json(line) {
            Ok(envelope) => envelopes.push(envelope),
            Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed envelope"),
        }
    }
    info!(envelopes = envelopes.len(), script = %path.display(), "Loaded script");
    Ok(envelopes)
}

/// Block until no stream is open.
async fn wait_for_streams(
    engine: &EngineHandle,
    events: &mut broadcast::Receiver<EngineEvent>,
) -> Result<()> {
    loop {
        if engine.active_streams().await?.is_empty() {
            return Ok(());
        }
        match events.recv().await {
            Ok(EngineEvent::TurnFailed { failure, .. }) => warn!(error = %failure, "Turn failed"),
            Ok(EngineEvent::PermissionRequested { request, .. }) => {
                info!(tool = %request.tool_name, request_id = %request.request_id, "Permission requested");
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

fn print_transcript(messages: &[Message]) {
    for message in messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match message.stream_status {
            Some(status) => println!("[{role}] {} ({status:?})", message.id),
            None => println!("[{role}] {}", message.id),
        }
        if !message.content_text.is_empty() {
            println!("{}", message.content_text);
        }
        println!();
    }
}
