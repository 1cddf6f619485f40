//! Rule evaluator: narrows a base candidate set by a campaign's filter rules.

use campaign_core::{CampaignResult, FilterRule, RuleMethod, User};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::predicates::{compile_rule, CompiledRule};

/// A campaign's rules compiled against one effective `now`.
///
/// A candidate survives when it satisfies every inclusion rule and no
/// exclusion rule, so the result does not depend on rule order.
#[derive(Debug, Default)]
pub struct RuleEvaluator {
    includes: Vec<CompiledRule>,
    excludes: Vec<CompiledRule>,
}

impl RuleEvaluator {
    pub fn compile(rules: &[FilterRule], now: DateTime<Utc>) -> CampaignResult<Self> {
        let mut evaluator = Self::default();
        for rule in rules {
            let compiled = compile_rule(rule, now).inspect_err(|e| {
                warn!(
                    field = %rule.field,
                    lookup = ?rule.lookup,
                    value = %rule.value,
                    error = %e,
                    "Filter rule rejected"
                );
            })?;
            match compiled.method {
                RuleMethod::Filter => evaluator.includes.push(compiled),
                RuleMethod::Exclude => evaluator.excludes.push(compiled),
            }
        }
        Ok(evaluator)
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.includes.len() + self.excludes.len()
    }

    pub fn matches(&self, user: &User) -> CampaignResult<bool> {
        for rule in &self.includes {
            if !rule.matches(user)? {
                return Ok(false);
            }
        }
        for rule in &self.excludes {
            if rule.matches(user)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Filter `candidates`, keeping their order. The first failing rule
    /// aborts the whole evaluation.
    pub fn apply(&self, candidates: Vec<User>) -> CampaignResult<Vec<User>> {
        if self.is_empty() {
            return Ok(candidates);
        }
        let before = candidates.len();
        let mut kept = Vec::with_capacity(before);
        for user in candidates {
            if self.matches(&user)? {
                kept.push(user);
            }
        }
        debug!(
            rules = self.rule_count(),
            before,
            after = kept.len(),
            "Filter rules applied"
        );
        Ok(kept)
    }
}

/// Compile `rules` at `now` and apply them to `base`.
pub fn apply_rules(
    rules: &[FilterRule],
    base: Vec<User>,
    now: DateTime<Utc>,
) -> CampaignResult<Vec<User>> {
    RuleEvaluator::compile(rules, now)?.apply(base)
}
