//! Tool aggregate builder.
//!
//! Merges `tool_started`, `tool_completed` and `tool_failed` events that share
//! a tool-call id into one [`ToolAggregate`] living at a fixed position in the
//! accumulator's render list.

use std::collections::HashMap;

use serde_json::Value;
use turnstream_protocol::ToolPayload;

use crate::message::{RenderEvent, ToolAggregate, ToolStatus};

/// Which lifecycle event is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolTransition {
    Started,
    Completed,
    Failed,
}

/// Result of applying a tool event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolUpsert {
    /// A new aggregate was appended in `started` state.
    Inserted,
    /// An existing aggregate changed or was confirmed.
    Updated,
    /// A terminal event arrived for an unknown id; the aggregate was created
    /// directly in its terminal state.
    Synthesized,
}

/// Index of tool aggregates by tool-call id.
#[derive(Debug, Default, Clone)]
pub struct ToolAggregateBuilder {
    positions: HashMap<String, usize>,
}

impl ToolAggregateBuilder {
    /// Build an index over tool aggregates already present in `events`.
    #[must_use]
    pub fn from_events(events: &[RenderEvent]) -> Self {
        let positions = events
            .iter()
            .enumerate()
            .filter_map(|(i, event)| match event {
                RenderEvent::Tool(tool) => Some((tool.id.clone(), i)),
                _ => None,
            })
            .collect();
        Self { positions }
    }

    /// Apply one lifecycle event to `events`.
    pub fn apply(
        &mut self,
        events: &mut Vec<RenderEvent>,
        transition: ToolTransition,
        payload: &ToolPayload,
    ) -> ToolUpsert {
        if let Some(&pos) = self.positions.get(&payload.id)
            && let Some(RenderEvent::Tool(existing)) = events.get_mut(pos)
        {
            merge(existing, transition, payload);
            return ToolUpsert::Updated;
        }

        let status = match transition {
            ToolTransition::Started => ToolStatus::Started,
            ToolTransition::Completed => ToolStatus::Completed,
            ToolTransition::Failed => ToolStatus::Failed,
        };
        let aggregate = ToolAggregate {
            id: payload.id.clone(),
            name: payload.name.clone().unwrap_or_default(),
            input: payload.input.clone().unwrap_or(Value::Null),
            status,
            result: match transition {
                ToolTransition::Completed => payload.result.clone(),
                _ => None,
            },
            error: match transition {
                ToolTransition::Failed => payload.error_message(),
                _ => None,
            },
        };

        self.positions.insert(payload.id.clone(), events.len());
        events.push(RenderEvent::Tool(aggregate));

        if transition == ToolTransition::Started {
            ToolUpsert::Inserted
        } else {
            ToolUpsert::Synthesized
        }
    }
}

fn merge(existing: &mut ToolAggregate, transition: ToolTransition, payload: &ToolPayload) {
    if existing.name.is_empty()
        && let Some(name) = &payload.name
    {
        existing.name.clone_from(name);
    }
    if existing.input.is_null()
        && let Some(input) = &payload.input
    {
        existing.input = input.clone();
    }

    // Terminal states are final; a late start or a second terminal event only
    // fills in missing fields.
    if existing.status.is_terminal() {
        return;
    }

    match transition {
        ToolTransition::Started => {}
        ToolTransition::Completed => {
            existing.status = ToolStatus::Completed;
            existing.result = payload.result.clone();
        }
        ToolTransition::Failed => {
            existing.status = ToolStatus::Failed;
            existing.error = payload.error_message();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(id: &str) -> ToolPayload {
        ToolPayload {
            id: id.to_string(),
            name: None,
            input: None,
            result: None,
            error: None,
        }
    }

    fn tool_at(events: &[RenderEvent], index: usize) -> &ToolAggregate {
        match &events[index] {
            RenderEvent::Tool(tool) => tool,
            other => panic!("expected tool event, got {other:?}"),
        }
    }

    #[test]
    fn started_then_completed_merges() {
        let mut builder = ToolAggregateBuilder::default();
        let mut events = Vec::new();

        let started = ToolPayload {
            name: Some("bash".to_string()),
            input: Some(json!({"command": "ls"})),
            ..payload("t1")
        };
        let completed = ToolPayload {
            result: Some(json!("file.txt")),
            ..payload("t1")
        };

        assert_eq!(
            builder.apply(&mut events, ToolTransition::Started, &started),
            ToolUpsert::Inserted
        );
        assert_eq!(
            builder.apply(&mut events, ToolTransition::Completed, &completed),
            ToolUpsert::Updated
        );

        assert_eq!(events.len(), 1);
        let tool = tool_at(&events, 0);
        assert_eq!(tool.status, ToolStatus::Completed);
        assert_eq!(tool.name, "bash");
        assert_eq!(tool.input, json!({"command": "ls"}));
        assert_eq!(tool.result, Some(json!("file.txt")));
    }

    #[test]
    fn completed_without_start_is_synthesized() {
        let mut builder = ToolAggregateBuilder::default();
        let mut events = Vec::new();

        let completed = ToolPayload {
            name: Some("read".to_string()),
            result: Some(json!(1)),
            ..payload("t9")
        };

        assert_eq!(
            builder.apply(&mut events, ToolTransition::Completed, &completed),
            ToolUpsert::Synthesized
        );
        assert_eq!(
            builder.apply(&mut events, ToolTransition::Completed, &completed),
            ToolUpsert::Updated
        );

        assert_eq!(events.len(), 1);
        assert_eq!(tool_at(&events, 0).status, ToolStatus::Completed);
    }

    #[test]
    fn failed_records_error_text() {
        let mut builder = ToolAggregateBuilder::default();
        let mut events = Vec::new();

        builder.apply(&mut events, ToolTransition::Started, &payload("t1"));
        builder.apply(
            &mut events,
            ToolTransition::Failed,
            &ToolPayload {
                error: Some(json!("permission denied")),
                ..payload("t1")
            },
        );

        let tool = tool_at(&events, 0);
        assert_eq!(tool.status, ToolStatus::Failed);
        assert_eq!(tool.error.as_deref(), Some("permission denied"));
        assert!(tool.result.is_none());
    }

    #[test]
    fn late_start_does_not_regress_terminal_status() {
        let mut builder = ToolAggregateBuilder::default();
        let mut events = Vec::new();

        builder.apply(&mut events, ToolTransition::Completed, &payload("t1"));
        builder.apply(
            &mut events,
            ToolTransition::Started,
            &ToolPayload {
                name: Some("grep".to_string()),
                ..payload("t1")
            },
        );

        let tool = tool_at(&events, 0);
        assert_eq!(tool.status, ToolStatus::Completed);
        assert_eq!(tool.name, "grep");
    }

    #[test]
    fn index_is_rebuilt_from_seed_events() {
        let seed = vec![
            RenderEvent::Text {
                text: "checking".to_string(),
            },
            RenderEvent::Tool(ToolAggregate {
                id: "t1".to_string(),
                name: "bash".to_string(),
                input: Value::Null,
                status: ToolStatus::Started,
                result: None,
                error: None,
            }),
        ];
        let mut events = seed.clone();
        let mut builder = ToolAggregateBuilder::from_events(&seed);

        builder.apply(&mut events, ToolTransition::Completed, &payload("t1"));

        assert_eq!(events.len(), 2);
        assert_eq!(tool_at(&events, 1).status, ToolStatus::Completed);
    }
}
