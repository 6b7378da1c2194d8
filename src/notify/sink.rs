//! Sink definitions and the registry that performs single delivery attempts.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use super::envelope::{TemplateData, discord_json, envelope_json, event_line};
use super::{DeliveryError, Envelope, HttpClient, HttpRequest};
use crate::detect::Event;

/// Shared destination for stdout sinks; tests substitute a buffer.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Returns a writer over the process's standard output.
#[must_use]
pub fn stdout_writer() -> SharedWriter {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

/// Kind of delivery target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// One line per event on standard output.
    Stdout,
    /// HTTP POST of the JSON envelope (or a rendered template).
    Webhook,
    /// HTTP POST of a Discord `{"content": ...}` message.
    Discord,
    /// Logged at debug level, nothing sent.
    Debug,
}

impl SinkKind {
    /// All kinds, for validation messages.
    pub const ALL: [Self; 4] = [Self::Stdout, Self::Webhook, Self::Discord, Self::Debug];

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Webhook => "webhook",
            Self::Discord => "discord",
            Self::Debug => "debug",
        }
    }

    /// Returns true if the kind posts to a URL.
    #[must_use]
    pub const fn needs_endpoint(self) -> bool {
        matches!(self, Self::Webhook | Self::Discord)
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("unknown sink type '{s}': expected stdout, webhook, discord, or debug")
            })
    }
}

/// A named delivery target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sink {
    /// Unique name referenced by routes.
    pub name: String,
    /// What kind of target this is.
    pub kind: SinkKind,
    /// URL for HTTP kinds.
    pub endpoint: Option<url::Url>,
    /// Optional Handlebars body for webhook sinks.
    pub body_template: Option<String>,
    /// Extra headers for HTTP kinds.
    pub headers: http::HeaderMap,
}

impl Sink {
    /// Creates a sink with no endpoint.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: SinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoint: None,
            body_template: None,
            headers: http::HeaderMap::new(),
        }
    }

    /// Sets the endpoint URL.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: url::Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the body template.
    #[must_use]
    pub fn with_body_template(mut self, template: impl Into<String>) -> Self {
        self.body_template = Some(template.into());
        self
    }

    /// Sets the extra headers.
    #[must_use]
    pub fn with_headers(mut self, headers: http::HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Every configured sink plus the shared resources needed to reach them.
///
/// # Type Parameters
///
/// - `H`: The HTTP client shared by webhook and discord sinks
pub struct SinkRegistry<H> {
    sinks: Vec<Sink>,
    client: H,
    stdout: SharedWriter,
    templates: Handlebars<'static>,
}

impl<H> fmt::Debug for SinkRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("sinks", &self.sinks)
            .finish_non_exhaustive()
    }
}

impl<H: HttpClient> SinkRegistry<H> {
    /// Builds a registry, compiling body templates up front.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Template`] if a body template does not parse.
    pub fn new(sinks: Vec<Sink>, client: H) -> Result<Self, DeliveryError> {
        let mut templates = Handlebars::new();
        // Bodies are JSON or plain text, never HTML
        templates.register_escape_fn(handlebars::no_escape);
        templates.set_strict_mode(false);

        for sink in &sinks {
            if let Some(template) = &sink.body_template {
                templates
                    .register_template_string(&sink.name, template)
                    .map_err(|e| DeliveryError::Template(format!("sink '{}': {e}", sink.name)))?;
            }
        }

        Ok(Self {
            sinks,
            client,
            stdout: stdout_writer(),
            templates,
        })
    }

    /// Redirects stdout sinks to `writer`.
    #[must_use]
    pub fn with_stdout(mut self, writer: SharedWriter) -> Self {
        self.stdout = writer;
        self
    }

    /// Looks up a sink by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Sink> {
        self.sinks.iter().find(|s| s.name == name)
    }

    /// All sinks in configured order.
    #[must_use]
    pub fn sinks(&self) -> &[Sink] {
        &self.sinks
    }

    /// Makes one delivery attempt of `event` to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] describing why the attempt failed; the
    /// caller decides whether to retry.
    pub async fn send_once(&self, sink: &Sink, event: &Event) -> Result<(), DeliveryError> {
        match sink.kind {
            SinkKind::Stdout => self.write_line(event),
            SinkKind::Debug => {
                tracing::debug!(
                    sink = %sink.name,
                    event_type = %event.event_type,
                    subject = %event.subject,
                    key = %event.dedup_key,
                    "Debug sink received event"
                );
                Ok(())
            }
            SinkKind::Webhook | SinkKind::Discord => {
                let request = self.build_request(sink, event)?;
                self.post(request).await
            }
        }
    }

    fn write_line(&self, event: &Event) -> Result<(), DeliveryError> {
        let line = event_line(event);
        let mut writer = self
            .stdout
            .lock()
            .map_err(|_| DeliveryError::Io(std::io::Error::other("stdout writer poisoned")))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }

    fn build_request(&self, sink: &Sink, event: &Event) -> Result<HttpRequest, DeliveryError> {
        let url = sink
            .endpoint
            .clone()
            .ok_or_else(|| DeliveryError::MissingEndpoint(sink.name.clone()))?;

        let body = match sink.kind {
            SinkKind::Discord => discord_json(event)?,
            _ if sink.body_template.is_some() => self.render(sink, event)?,
            _ => envelope_json(event)?,
        };

        let mut request = HttpRequest::post(url).with_json_body(body);
        for (name, value) in &sink.headers {
            request.headers.insert(name, value.clone());
        }
        Ok(request)
    }

    fn render(&self, sink: &Sink, event: &Event) -> Result<Vec<u8>, DeliveryError> {
        let data = TemplateData {
            envelope: Envelope::from(event),
            sink: &sink.name,
        };
        self.templates
            .render(&sink.name, &data)
            .map(String::into_bytes)
            .map_err(|e| DeliveryError::Template(e.to_string()))
    }

    async fn post(&self, request: HttpRequest) -> Result<(), DeliveryError> {
        let response = self.client.request(request).await?;
        if response.is_success() {
            return Ok(());
        }
        Err(DeliveryError::NonSuccessStatus {
            status: response.status,
            body: response.body_text().map(ToString::to_string),
        })
    }
}
