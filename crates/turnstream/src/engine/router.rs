//! Envelope routing.
//!
//! Splits decoded envelopes into content for the accumulator, side-channel
//! traffic (permission prompts, usage telemetry) and lifecycle signals.

use turnstream_protocol::{
    ContextUsage, Envelope, EnvelopeKind, PermissionRequest, QueueProcessing, StreamEvent,
};

/// Terminal envelope outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Complete,
    Cancelled,
    Error {
        message: String,
        code: Option<String>,
    },
}

/// Where an envelope goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Fold into the accumulator.
    Content(StreamEvent),
    Permission(PermissionRequest),
    Usage(ContextUsage),
    QueueProcessing(QueueProcessing),
    Terminal(Terminal),
    /// Nothing to do; the reason is for logging.
    Dropped(&'static str),
}

/// Route one envelope.
///
/// Malformed payloads and unknown kinds are dropped; a `system` envelope
/// without usage data is a silent no-op.
pub fn route(envelope: &Envelope) -> Routed {
    let Some(event) = envelope.decode() else {
        return match envelope.kind {
            EnvelopeKind::Unknown => Routed::Dropped("unknown kind"),
            _ => Routed::Dropped("malformed payload"),
        };
    };

    match event {
        StreamEvent::PermissionRequest(request) => Routed::Permission(request),
        StreamEvent::System(system) => match system.context_usage {
            Some(usage) => Routed::Usage(usage),
            None => Routed::Dropped("system without usage"),
        },
        StreamEvent::QueueProcessing(queue) => Routed::QueueProcessing(queue),
        StreamEvent::Complete => Routed::Terminal(Terminal::Complete),
        StreamEvent::Cancelled => Routed::Terminal(Terminal::Cancelled),
        StreamEvent::Error { message, code } => Routed::Terminal(Terminal::Error { message, code }),
        content => Routed::Content(content),
    }
}
