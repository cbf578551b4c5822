//! Per-stream content accumulator.
//!
//! Folds decoded stream events into an ordered render list plus the running
//! message text. The fold touches nothing outside the accumulator, so the
//! snapshot depends only on the seed and the events pushed since.

use turnstream_protocol::{StreamEvent, ToolPayload};

use crate::message::RenderEvent;

use super::tools::{ToolAggregateBuilder, ToolTransition, ToolUpsert};

/// What a single push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The event changed the snapshot.
    Applied,
    /// The event carried nothing renderable and was dropped.
    Ignored,
    /// A tool completion or failure arrived with no matching start; an
    /// aggregate was created for it.
    SynthesizedToolStart,
}

/// Renderable state of an assistant message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentSnapshot {
    pub events: Vec<RenderEvent>,
    pub content_text: String,
}

/// Fold of one stream's content events.
#[derive(Debug, Default, Clone)]
pub struct ContentAccumulator {
    events: Vec<RenderEvent>,
    text: String,
    tools: ToolAggregateBuilder,
    applied: usize,
}

impl ContentAccumulator {
    /// Create an accumulator starting from a message's persisted content.
    #[must_use]
    pub fn new(seed_events: Vec<RenderEvent>, seed_text: String) -> Self {
        let tools = ToolAggregateBuilder::from_events(&seed_events);
        Self {
            events: seed_events,
            text: seed_text,
            tools,
            applied: 0,
        }
    }

    /// Fold one event into the accumulator.
    pub fn push(&mut self, event: &StreamEvent) -> PushOutcome {
        let outcome = match event {
            StreamEvent::AssistantText { text } => self.push_text(text),
            StreamEvent::AssistantThinking { thinking } => self.push_thinking(thinking),
            StreamEvent::ToolStarted(tool) => self.push_tool(ToolTransition::Started, tool),
            StreamEvent::ToolCompleted(tool) => self.push_tool(ToolTransition::Completed, tool),
            StreamEvent::ToolFailed(tool) => self.push_tool(ToolTransition::Failed, tool),
            StreamEvent::PromptSuggestions { suggestions } => {
                if suggestions.is_empty() {
                    PushOutcome::Ignored
                } else {
                    self.events.push(RenderEvent::Suggestions {
                        suggestions: suggestions.clone(),
                    });
                    PushOutcome::Applied
                }
            }
            // Side-channel and lifecycle events never reach the render list.
            StreamEvent::System(_)
            | StreamEvent::PermissionRequest(_)
            | StreamEvent::QueueProcessing(_)
            | StreamEvent::Complete
            | StreamEvent::Cancelled
            | StreamEvent::Error { .. } => PushOutcome::Ignored,
        };

        if outcome != PushOutcome::Ignored {
            self.applied += 1;
        }
        outcome
    }

    fn push_text(&mut self, delta: &str) -> PushOutcome {
        if delta.is_empty() {
            return PushOutcome::Ignored;
        }
        match self.events.last_mut() {
            Some(RenderEvent::Text { text }) => text.push_str(delta),
            _ => self.events.push(RenderEvent::Text {
                text: delta.to_string(),
            }),
        }
        self.text.push_str(delta);
        PushOutcome::Applied
    }

    fn push_thinking(&mut self, delta: &str) -> PushOutcome {
        if delta.is_empty() {
            return PushOutcome::Ignored;
        }
        match self.events.last_mut() {
            Some(RenderEvent::Thinking { thinking }) => thinking.push_str(delta),
            _ => self.events.push(RenderEvent::Thinking {
                thinking: delta.to_string(),
            }),
        }
        PushOutcome::Applied
    }

    fn push_tool(&mut self, transition: ToolTransition, tool: &ToolPayload) -> PushOutcome {
        match self.tools.apply(&mut self.events, transition, tool) {
            ToolUpsert::Synthesized => PushOutcome::SynthesizedToolStart,
            ToolUpsert::Inserted | ToolUpsert::Updated => PushOutcome::Applied,
        }
    }

    /// Current render list and text.
    pub fn snapshot(&self) -> ContentSnapshot {
        ContentSnapshot {
            events: self.events.clone(),
            content_text: self.text.clone(),
        }
    }

    /// Returns true when nothing has been applied on top of the seed.
    pub fn is_empty(&self) -> bool {
        self.applied == 0
    }
}
