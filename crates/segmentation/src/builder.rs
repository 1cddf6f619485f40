//! Rule builder: fluent API for constructing a campaign's filter rules.

use campaign_core::{FilterRule, Lookup};

#[derive(Debug, Default, Clone)]
pub struct RuleBuilder {
    rules: Vec<FilterRule>,
}

impl RuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(
        mut self,
        field: impl Into<String>,
        lookup: Lookup,
        value: impl Into<String>,
    ) -> Self {
        self.rules.push(FilterRule::filter(field, lookup, value));
        self
    }

    pub fn exclude(
        mut self,
        field: impl Into<String>,
        lookup: Lookup,
        value: impl Into<String>,
    ) -> Self {
        self.rules.push(FilterRule::exclude(field, lookup, value));
        self
    }

    /// Users who joined within the last `days` days of the campaign's now.
    pub fn joined_within_days(self, days: u32) -> Self {
        self.filter("date_joined", Lookup::Gte, format!("now-{days} days"))
    }

    /// Users who joined more than `days` days before the campaign's now.
    pub fn joined_before_days(self, days: u32) -> Self {
        self.filter("date_joined", Lookup::Lt, format!("now-{days} days"))
    }

    pub fn attribute_equals(self, key: &str, value: impl Into<String>) -> Self {
        self.filter(format!("attributes.{key}"), Lookup::Exact, value)
    }

    pub fn active_only(self) -> Self {
        self.filter("is_active", Lookup::Exact, "true")
    }

    pub fn without_staff(self) -> Self {
        self.exclude("is_staff", Lookup::Exact, "true")
    }

    pub fn build(self) -> Vec<FilterRule> {
        self.rules
    }
}
