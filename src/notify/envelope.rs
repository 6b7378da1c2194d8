//! Wire renderings of an event: the JSON envelope, Discord content, and log lines.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::detect::Event;
use crate::time::rfc3339;

/// Discord rejects messages longer than this many characters.
const DISCORD_CONTENT_LIMIT: usize = 2000;

/// Generic JSON envelope posted to webhook sinks.
///
/// Also the data model for body templates: a template can reference
/// `{{type}}`, `{{severity}}`, `{{subject}}`, `{{occurred_at}}`,
/// `{{payload.<key>}}` and `{{sink}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope<'a> {
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: &'static str,
    /// Severity name.
    pub severity: &'static str,
    /// Peer id or `"self"`.
    pub subject: &'a str,
    /// RFC 3339 timestamp.
    pub occurred_at: String,
    /// Event details.
    pub payload: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a Event> for Envelope<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            event_type: event.event_type.as_str(),
            severity: event.severity.as_str(),
            subject: &event.subject,
            occurred_at: rfc3339(event.occurred_at),
            payload: &event.payload,
        }
    }
}

/// Template data: the envelope plus the sink it is rendered for.
#[derive(Serialize)]
pub(crate) struct TemplateData<'a> {
    #[serde(flatten)]
    pub envelope: Envelope<'a>,
    pub sink: &'a str,
}

/// Serializes the JSON envelope for `event`.
///
/// # Errors
///
/// Returns the serializer error; it cannot fail for well-formed events.
pub fn envelope_json(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&Envelope::from(event))
}

/// Renders the Discord `{"content": ...}` body for `event`.
///
/// # Errors
///
/// Returns the serializer error; it cannot fail for well-formed events.
pub fn discord_json(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    #[derive(Serialize)]
    struct Content<'a> {
        content: &'a str,
    }
    serde_json::to_vec(&Content {
        content: &discord_content(event),
    })
}

/// Human-readable Discord message, truncated to Discord's limit.
#[must_use]
pub fn discord_content(event: &Event) -> String {
    let mut content = format!(
        "**[{}] {}** `{}`",
        event.severity.as_str().to_uppercase(),
        event.event_type,
        event.subject
    );
    for (key, value) in &event.payload {
        let _ = write!(content, "\n{key}: {value}");
    }

    if content.chars().count() > DISCORD_CONTENT_LIMIT {
        content = content.chars().take(DISCORD_CONTENT_LIMIT - 1).collect();
        content.push('…');
    }
    content
}

/// One-line rendering used by stdout sinks and CLI output.
#[must_use]
pub fn event_line(event: &Event) -> String {
    let mut line = format!(
        "{} {:<8} {:<22} {}",
        rfc3339(event.occurred_at),
        event.severity,
        event.event_type,
        event.subject
    );
    for (key, value) in &event.payload {
        let _ = write!(line, " {key}={value}");
    }
    line
}
