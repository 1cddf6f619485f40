//! Email assembly for drip sends.
//!
//! Renders a campaign's subject and body for one user, derives a plain-text
//! body by stripping markup, and attaches the rendered HTML as an alternative
//! part when the two differ.

use campaign_core::{CampaignError, CampaignResult, TemplateEngine, User};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Everything a builder needs from a campaign, with the sender already
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailSpec {
    pub subject_template: String,
    pub body_template: String,
    pub from_email: String,
    pub from_email_name: Option<String>,
}

impl EmailSpec {
    /// `"{name} <{address}>"` when a display name is set, else the address.
    pub fn from_header(&self) -> String {
        match self.from_email_name.as_deref() {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.from_email),
            _ => self.from_email.clone(),
        }
    }
}

/// A rendered message ready for a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub id: Uuid,
    pub subject: String,
    /// Plain-text primary body.
    pub body: String,
    pub from: String,
    pub to: Vec<String>,
    /// `(content, mimetype)` pairs.
    pub alternatives: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
}

impl EmailMessage {
    pub fn new(subject: String, body: String, from: String, to: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            body,
            from,
            to,
            alternatives: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn attach_alternative(&mut self, content: String, mimetype: &str) {
        self.alternatives.push((content, mimetype.to_string()));
    }

    pub fn html(&self) -> Option<&str> {
        self.alternatives
            .iter()
            .find(|(_, mimetype)| mimetype == "text/html")
            .map(|(content, _)| content.as_str())
    }

    /// Format as an RFC 5322 message; `multipart/alternative` when an HTML
    /// part is attached.
    pub fn to_mime(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", self.from));
        out.push_str(&format!("To: {}\r\n", self.to.join(", ")));
        out.push_str(&format!("Subject: {}\r\n", self.subject));
        out.push_str(&format!("Date: {}\r\n", self.created_at.to_rfc2822()));
        out.push_str(&format!("Message-ID: <{}@drip>\r\n", self.id));
        out.push_str("MIME-Version: 1.0\r\n");

        let Some(html) = self.html() else {
            out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
            out.push_str(&self.body);
            return out;
        };

        let boundary = format!("drip-{}", self.id.simple());
        out.push_str(&format!(
            "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
        ));
        out.push_str(&format!(
            "--{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            self.body
        ));
        out.push_str(&format!(
            "--{boundary}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}\r\n"
        ));
        out.push_str(&format!("--{boundary}--\r\n"));
        out
    }
}

/// Remove every markup tag (and HTML comment) from `html`. A `<` that does
/// not open a tag is kept.
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '<' {
            out.push(c);
            continue;
        }
        let opens_tag = chars
            .peek()
            .is_some_and(|(_, next)| next.is_ascii_alphabetic() || matches!(next, '/' | '!'));
        if !opens_tag {
            out.push(c);
            continue;
        }
        let rest = &html[i..];
        let close = if rest.starts_with("<!--") { "-->" } else { ">" };
        match rest.find(close) {
            Some(end) => {
                let resume = i + end + close.len();
                while chars.peek().is_some_and(|(j, _)| *j < resume) {
                    chars.next();
                }
            }
            // Unterminated tag: drop the remainder.
            None => break,
        }
    }
    out
}

/// The standard builder. Subject, body, and plain text are rendered once and
/// memoized for the lifetime of the builder.
pub struct DripEmail<'a> {
    spec: &'a EmailSpec,
    user: &'a User,
    renderer: &'a dyn TemplateEngine,
    context: Option<serde_json::Value>,
    subject: Option<String>,
    body: Option<String>,
    plain: Option<String>,
}

impl<'a> DripEmail<'a> {
    pub fn new(spec: &'a EmailSpec, user: &'a User, renderer: &'a dyn TemplateEngine) -> Self {
        Self {
            spec,
            user,
            renderer,
            context: None,
            subject: None,
            body: None,
            plain: None,
        }
    }

    fn context(&mut self) -> &serde_json::Value {
        let user = self.user;
        self.context
            .get_or_insert_with(|| serde_json::json!({ "user": user.to_context() }))
    }

    pub fn subject(&mut self) -> CampaignResult<String> {
        if let Some(subject) = &self.subject {
            return Ok(subject.clone());
        }
        let spec = self.spec;
        let template = &spec.subject_template;
        let renderer = self.renderer;
        let rendered = renderer.render(template, self.context())?;
        // Header values are single-line.
        let rendered = rendered.lines().map(str::trim).collect::<Vec<_>>().join(" ");
        self.subject = Some(rendered.clone());
        Ok(rendered)
    }

    pub fn body(&mut self) -> CampaignResult<String> {
        if let Some(body) = &self.body {
            return Ok(body.clone());
        }
        let spec = self.spec;
        let template = &spec.body_template;
        let renderer = self.renderer;
        let rendered = renderer.render_html(template, self.context())?;
        self.body = Some(rendered.clone());
        Ok(rendered)
    }

    pub fn plain(&mut self) -> CampaignResult<String> {
        if let Some(plain) = &self.plain {
            return Ok(plain.clone());
        }
        let plain = strip_tags(&self.body()?);
        self.plain = Some(plain.clone());
        Ok(plain)
    }

    pub fn email(&mut self) -> CampaignResult<EmailMessage> {
        let subject = self.subject()?;
        let body = self.body()?;
        let plain = self.plain()?;
        let has_markup = plain.len() != body.len();

        let mut message = EmailMessage::new(
            subject,
            plain,
            self.spec.from_header(),
            vec![self.user.email.clone()],
        );
        if has_markup {
            message.attach_alternative(body, "text/html");
        }
        debug!(
            to = %self.user.email,
            html = has_markup,
            "Drip email built"
        );
        Ok(message)
    }
}

/// Strategy for turning a campaign and a user into a message.
pub trait EmailBuilderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(
        &self,
        spec: &EmailSpec,
        user: &User,
        renderer: &dyn TemplateEngine,
    ) -> CampaignResult<EmailMessage>;
}

/// Builds messages with [`DripEmail`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardEmailFactory;

impl EmailBuilderFactory for StandardEmailFactory {
    fn name(&self) -> &str {
        "standard"
    }

    fn build(
        &self,
        spec: &EmailSpec,
        user: &User,
        renderer: &dyn TemplateEngine,
    ) -> CampaignResult<EmailMessage> {
        DripEmail::new(spec, user, renderer).email()
    }
}

/// Named builder strategies; `"standard"` is always registered.
pub struct BuilderRegistry {
    factories: DashMap<String, Arc<dyn EmailBuilderFactory>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: DashMap::new(),
        };
        registry.register(Arc::new(StandardEmailFactory));
        registry
    }

    pub fn register(&self, factory: Arc<dyn EmailBuilderFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn resolve(&self, name: &str) -> CampaignResult<Arc<dyn EmailBuilderFactory>> {
        self.factories
            .get(name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| CampaignError::config(format!("unknown email builder '{name}'")))
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
