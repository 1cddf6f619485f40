//! Message template rendering engine.

use crate::error::{CampaignError, CampaignResult};

/// Renders a template string against a JSON context.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, template: &str, context: &serde_json::Value) -> CampaignResult<String>;

    /// Render markup: every string in the context is HTML-escaped before
    /// substitution, so values cannot inject tags.
    fn render_html(&self, template: &str, context: &serde_json::Value) -> CampaignResult<String> {
        self.render(template, &escape_context(context))
    }
}

/// Escape the characters that are significant in HTML text and attributes.
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

/// Copy of `context` with every string value HTML-escaped.
pub fn escape_context(context: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match context {
        Value::String(s) => Value::String(escape_html(s)),
        Value::Array(items) => Value::Array(items.iter().map(escape_context).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), escape_context(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Simple template renderer using `{{ variable.path }}` syntax.
///
/// Unknown paths render as an empty string.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    fn lookup<'a>(context: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
        path.split('.')
            .try_fold(context, |current, segment| current.get(segment))
    }

    fn stringify(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl TemplateEngine for TemplateRenderer {
    fn render(&self, template: &str, context: &serde_json::Value) -> CampaignResult<String> {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                CampaignError::Template(format!("unterminated placeholder at byte {start}"))
            })?;
            let path = after[..end].trim();
            if path.is_empty() {
                return Err(CampaignError::Template("empty placeholder".to_string()));
            }
            if let Some(value) = Self::lookup(context, path) {
                result.push_str(&Self::stringify(value));
            }
            rest = &after[end + 2..];
        }
        result.push_str(rest);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_nested_paths() {
        let ctx = json!({"user": {"first_name": "Ada", "attributes": {"seats": 3}}});
        let out = TemplateRenderer
            .render("Hi {{ user.first_name }}, you have {{user.attributes.seats}} seats", &ctx)
            .unwrap();
        assert_eq!(out, "Hi Ada, you have 3 seats");
    }

    #[test]
    fn test_missing_value_renders_empty() {
        let out = TemplateRenderer
            .render("[{{ user.nickname }}]", &json!({"user": {}}))
            .unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_render_html_escapes_values() {
        let ctx = json!({"user": {"first_name": "<b>x</b> & 'co'", "seats": 2}});
        let out = TemplateRenderer
            .render_html("<p>{{ user.first_name }} / {{ user.seats }}</p>", &ctx)
            .unwrap();
        assert_eq!(out, "<p>&lt;b&gt;x&lt;/b&gt; &amp; &#x27;co&#x27; / 2</p>");

        let raw = TemplateRenderer.render("{{ user.first_name }}", &ctx).unwrap();
        assert_eq!(raw, "<b>x</b> & 'co'");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = TemplateRenderer.render("Hi {{ user", &json!({})).unwrap_err();
        assert!(matches!(err, CampaignError::Template(_)));
    }
}
