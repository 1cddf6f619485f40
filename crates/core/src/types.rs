use crate::error::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A candidate recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_staff: bool,
    pub date_joined: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

const SCALAR_FIELDS: &[&str] = &[
    "id",
    "email",
    "username",
    "first_name",
    "last_name",
    "is_active",
    "is_staff",
    "date_joined",
    "last_login",
];

fn default_true() -> bool {
    true
}

impl User {
    pub fn new(email: impl Into<String>, date_joined: DateTime<Utc>) -> Self {
        let email = email.into();
        let username = email.split('@').next().unwrap_or_default().to_string();
        Self {
            id: Uuid::new_v4(),
            email,
            username,
            first_name: String::new(),
            last_name: String::new(),
            is_active: true,
            is_staff: false,
            date_joined,
            last_login: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Resolve a field path such as `date_joined` or `attributes.plan.tier`.
    /// `__` is accepted as a separator alongside `.`.
    ///
    /// Missing attribute keys resolve to [`FieldValue::Null`]; unknown
    /// top-level fields are an error.
    pub fn field(&self, path: &str) -> CampaignResult<FieldValue> {
        Self::check_field_path(path)?;
        let normalized = path.replace("__", ".");
        let mut segments = normalized.split('.');
        let head = segments.next().unwrap_or_default();
        let value = match head {
            "id" => FieldValue::Text(self.id.to_string()),
            "email" => FieldValue::Text(self.email.clone()),
            "username" => FieldValue::Text(self.username.clone()),
            "first_name" => FieldValue::Text(self.first_name.clone()),
            "last_name" => FieldValue::Text(self.last_name.clone()),
            "is_active" => FieldValue::Bool(self.is_active),
            "is_staff" => FieldValue::Bool(self.is_staff),
            "date_joined" => FieldValue::DateTime(self.date_joined),
            "last_login" => self
                .last_login
                .map_or(FieldValue::Null, FieldValue::DateTime),
            _ => {
                let key = segments.next().unwrap_or_default();
                let mut current = self.attributes.get(key);
                for segment in segments {
                    current = current.and_then(|v| v.get(segment));
                }
                current.map_or(FieldValue::Null, FieldValue::from_json)
            }
        };
        Ok(value)
    }

    /// Validate a field path without resolving it against a user.
    pub fn check_field_path(path: &str) -> CampaignResult<()> {
        let normalized = path.replace("__", ".");
        let mut segments = normalized.split('.');
        let head = segments.next().unwrap_or_default();
        if head == "attributes" {
            return match segments.next() {
                Some(key) if !key.is_empty() => Ok(()),
                _ => Err(CampaignError::rule("attribute path needs a key")),
            };
        }
        if !SCALAR_FIELDS.contains(&head) {
            return Err(CampaignError::rule(format!("unsupported field '{head}'")));
        }
        if segments.next().is_some() {
            return Err(CampaignError::rule(format!(
                "field '{head}' has no nested values (path '{path}')"
            )));
        }
        Ok(())
    }

    /// JSON view used as the template rendering context.
    pub fn to_context(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "full_name".to_string(),
                serde_json::Value::String(self.full_name()),
            );
        }
        value
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// A resolved field value on a candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    DateTime(DateTime<Utc>),
}

impl FieldValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Whether a rule narrows the candidate set or subtracts from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleMethod {
    #[default]
    Filter,
    Exclude,
}

/// Comparison applied between a candidate's field and the rule value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lookup {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Regex,
    IRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    Range,
    In,
    IsNull,
}

/// One declarative predicate on a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub method: RuleMethod,
    pub field: String,
    pub lookup: Lookup,
    /// Raw comparison value; may be symbolic (`now-7 days`, `today`).
    pub value: String,
}

impl FilterRule {
    pub fn filter(field: impl Into<String>, lookup: Lookup, value: impl Into<String>) -> Self {
        Self {
            method: RuleMethod::Filter,
            field: field.into(),
            lookup,
            value: value.into(),
        }
    }

    pub fn exclude(field: impl Into<String>, lookup: Lookup, value: impl Into<String>) -> Self {
        Self {
            method: RuleMethod::Exclude,
            ..Self::filter(field, lookup, value)
        }
    }
}

/// Persisted campaign definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    /// Entity type whose creation triggers an evaluation of this campaign.
    #[serde(default)]
    pub trigger_entity: Option<String>,
    #[serde(default)]
    pub rules: Vec<FilterRule>,
    pub subject_template: String,
    pub body_template: String,
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub from_email_name: Option<String>,
}

impl Campaign {
    pub fn new(
        name: impl Into<String>,
        subject_template: impl Into<String>,
        body_template: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            trigger_entity: None,
            rules: Vec::new(),
            subject_template: subject_template.into(),
            body_template: body_template.into(),
            from_email: None,
            from_email_name: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_rules(mut self, rules: Vec<FilterRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_sender(mut self, address: impl Into<String>, name: Option<&str>) -> Self {
        self.from_email = Some(address.into());
        self.from_email_name = name.map(str::to_string);
        self
    }

    pub fn triggered_by(mut self, entity: impl Into<String>) -> Self {
        self.trigger_entity = Some(entity.into());
        self
    }

    pub fn validate(&self) -> CampaignResult<()> {
        if self.name.trim().is_empty() {
            return Err(CampaignError::config("campaign must define a name"));
        }
        Ok(())
    }
}

/// Durable proof that a user received a campaign send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub user_id: Uuid,
    pub date: DateTime<Utc>,
    pub from_email: String,
    pub from_email_name: Option<String>,
    pub subject: String,
    pub body: String,
}
