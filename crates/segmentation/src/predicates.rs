//! Lookup compilation: each filter rule becomes a pure predicate over a
//! candidate's resolved field value.

use campaign_core::{CampaignError, CampaignResult, FieldValue, FilterRule, Lookup, RuleMethod};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use regex::RegexBuilder;
use std::cmp::Ordering;

type Matcher = Box<dyn Fn(&FieldValue) -> CampaignResult<bool> + Send + Sync>;

/// A filter rule bound to a point in time and ready to evaluate.
pub struct CompiledRule {
    pub method: RuleMethod,
    pub field: String,
    lookup: Lookup,
    matcher: Matcher,
}

impl std::fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRule")
            .field("method", &self.method)
            .field("field", &self.field)
            .field("lookup", &self.lookup)
            .finish_non_exhaustive()
    }
}

impl CompiledRule {
    pub fn matches(&self, user: &campaign_core::User) -> CampaignResult<bool> {
        let value = user.field(&self.field)?;
        (self.matcher)(&value).map_err(|e| match e {
            CampaignError::RuleEvaluation(msg) => {
                CampaignError::rule(format!("{} {:?}: {msg}", self.field, self.lookup))
            }
            other => other,
        })
    }
}

/// A comparison value, parsed once into every shape it can take.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub raw: String,
    pub datetime: Option<DateTime<Utc>>,
    pub number: Option<f64>,
    pub boolean: Option<bool>,
}

impl Operand {
    /// Parse a value compared by ordering. Symbolic times (`now`,
    /// `now-7 days`, `today+1 week`) resolve against `now`; a malformed or
    /// out-of-range symbolic time is an error.
    pub fn parse(raw: &str, now: DateTime<Utc>) -> CampaignResult<Self> {
        let trimmed = raw.trim();
        let datetime = match parse_relative(trimmed, now)? {
            Some(dt) => Some(dt),
            None => parse_absolute(trimmed),
        };
        Ok(Self::with_datetime(trimmed, datetime))
    }

    /// Parse a value compared as text or by equality. A `now`/`today` form
    /// that does not resolve is kept as a literal (`now-playing`).
    pub fn parse_lenient(raw: &str, now: DateTime<Utc>) -> Self {
        let trimmed = raw.trim();
        let datetime = parse_relative(trimmed, now)
            .ok()
            .flatten()
            .or_else(|| parse_absolute(trimmed));
        Self::with_datetime(trimmed, datetime)
    }

    fn with_datetime(trimmed: &str, datetime: Option<DateTime<Utc>>) -> Self {
        let boolean = match trimmed.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        };
        Self {
            raw: trimmed.to_string(),
            datetime,
            number: trimmed.parse::<f64>().ok(),
            boolean,
        }
    }
}

fn parse_relative(value: &str, now: DateTime<Utc>) -> CampaignResult<Option<DateTime<Utc>>> {
    let lower = value.to_ascii_lowercase();
    let (base, rest) = if let Some(rest) = lower.strip_prefix("now") {
        (now, rest)
    } else if let Some(rest) = lower.strip_prefix("today") {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        (midnight, rest)
    } else {
        return Ok(None);
    };

    let rest = rest.trim();
    if rest.is_empty() {
        return Ok(Some(base));
    }

    let (sign, components) = if let Some(tail) = rest.strip_prefix('+') {
        (1, tail)
    } else if let Some(tail) = rest.strip_prefix('-') {
        (-1, tail)
    } else {
        // A word that merely starts with "now"/"today".
        return Ok(None);
    };

    let malformed = || CampaignError::rule(format!("malformed relative time '{value}'"));
    let out_of_range = || CampaignError::rule(format!("relative time '{value}' is out of range"));

    let mut delta = TimeDelta::zero();
    for component in components.split(',') {
        let step = parse_component(component.trim()).ok_or_else(malformed)??;
        delta = delta.checked_add(&step).ok_or_else(out_of_range)?;
    }
    let shifted = if sign > 0 {
        base.checked_add_signed(delta)
    } else {
        base.checked_sub_signed(delta)
    };
    shifted.map(Some).ok_or_else(out_of_range)
}

/// `None` when the component is not `<amount> <unit>`; `Some(Err)` when it
/// is but the amount overflows.
fn parse_component(component: &str) -> Option<CampaignResult<TimeDelta>> {
    let mut parts = component.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let unit = unit.strip_suffix('s').unwrap_or(unit);
    let delta = match unit {
        "second" => TimeDelta::try_seconds(amount),
        "minute" => TimeDelta::try_minutes(amount),
        "hour" => TimeDelta::try_hours(amount),
        "day" => TimeDelta::try_days(amount),
        "week" => TimeDelta::try_weeks(amount),
        _ => return None,
    };
    Some(delta.ok_or_else(|| {
        CampaignError::rule(format!("'{component}' is out of range"))
    }))
}

fn parse_absolute(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn as_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        FieldValue::Bool(b) => Some(b.to_string()),
        FieldValue::Number(n) => Some(n.to_string()),
        FieldValue::Text(s) => Some(s.clone()),
        FieldValue::DateTime(dt) => Some(dt.to_rfc3339()),
    }
}

/// Order a field value against an operand. `None` means the value is null.
fn order(value: &FieldValue, operand: &Operand) -> CampaignResult<Option<Ordering>> {
    let mismatch = || {
        CampaignError::rule(format!(
            "cannot compare {value:?} with '{}'",
            operand.raw
        ))
    };
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::DateTime(dt) => operand.datetime.map(|o| Some(dt.cmp(&o))).ok_or_else(mismatch),
        FieldValue::Number(n) => operand
            .number
            .and_then(|o| n.partial_cmp(&o))
            .map(Some)
            .ok_or_else(mismatch),
        FieldValue::Bool(b) => operand.boolean.map(|o| Some(b.cmp(&o))).ok_or_else(mismatch),
        FieldValue::Text(s) => {
            if let Some(o) = operand.datetime {
                if let Some(dt) = parse_absolute(s) {
                    return Ok(Some(dt.cmp(&o)));
                }
            }
            if let (Ok(n), Some(o)) = (s.parse::<f64>(), operand.number) {
                return Ok(n.partial_cmp(&o));
            }
            Ok(Some(s.as_str().cmp(operand.raw.as_str())))
        }
    }
}

fn equals(value: &FieldValue, operand: &Operand) -> CampaignResult<bool> {
    match value {
        FieldValue::Null => Ok(matches!(
            operand.raw.to_ascii_lowercase().as_str(),
            "null" | "none"
        )),
        _ => Ok(order(value, operand)? == Some(Ordering::Equal)),
    }
}

fn text_matcher(operand: Operand, insensitive: bool, test: fn(&str, &str) -> bool) -> Matcher {
    let needle = if insensitive {
        operand.raw.to_lowercase()
    } else {
        operand.raw
    };
    Box::new(move |value| {
        Ok(as_text(value).is_some_and(|text| {
            if insensitive {
                test(&text.to_lowercase(), &needle)
            } else {
                test(&text, &needle)
            }
        }))
    })
}

fn ordering_matcher(operand: Operand, accept: fn(Ordering) -> bool) -> Matcher {
    Box::new(move |value| Ok(order(value, &operand)?.is_some_and(accept)))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Compile one rule against the instance's effective `now`.
pub fn compile_rule(rule: &FilterRule, now: DateTime<Utc>) -> CampaignResult<CompiledRule> {
    campaign_core::User::check_field_path(&rule.field)?;

    // Ordering lookups reparse strictly; everything else compares as text.
    let text = Operand::parse_lenient(&rule.value, now);
    let matcher: Matcher = match rule.lookup {
        Lookup::Exact => Box::new(move |value| equals(value, &text)),
        Lookup::IExact => text_matcher(text, true, |a, b| a == b),
        Lookup::Contains => text_matcher(text, false, |a, b| a.contains(b)),
        Lookup::IContains => text_matcher(text, true, |a, b| a.contains(b)),
        Lookup::StartsWith => text_matcher(text, false, |a, b| a.starts_with(b)),
        Lookup::IStartsWith => text_matcher(text, true, |a, b| a.starts_with(b)),
        Lookup::EndsWith => text_matcher(text, false, |a, b| a.ends_with(b)),
        Lookup::IEndsWith => text_matcher(text, true, |a, b| a.ends_with(b)),
        Lookup::Regex | Lookup::IRegex => {
            let re = RegexBuilder::new(&rule.value)
                .case_insensitive(rule.lookup == Lookup::IRegex)
                .build()
                .map_err(|e| CampaignError::rule(format!("invalid regex '{}': {e}", rule.value)))?;
            Box::new(move |value| Ok(as_text(value).is_some_and(|text| re.is_match(&text))))
        }
        Lookup::Gt => ordering_matcher(Operand::parse(&rule.value, now)?, Ordering::is_gt),
        Lookup::Gte => ordering_matcher(Operand::parse(&rule.value, now)?, Ordering::is_ge),
        Lookup::Lt => ordering_matcher(Operand::parse(&rule.value, now)?, Ordering::is_lt),
        Lookup::Lte => ordering_matcher(Operand::parse(&rule.value, now)?, Ordering::is_le),
        Lookup::Range => {
            let bounds = split_list(&rule.value)
                .map(|item| Operand::parse(item, now))
                .collect::<CampaignResult<Vec<_>>>()?;
            let [low, high]: [Operand; 2] = bounds.try_into().map_err(|_| {
                CampaignError::rule(format!(
                    "range on '{}' needs exactly two bounds, got '{}'",
                    rule.field, rule.value
                ))
            })?;
            Box::new(move |value| {
                let above = order(value, &low)?.is_some_and(Ordering::is_ge);
                let below = order(value, &high)?.is_some_and(Ordering::is_le);
                Ok(above && below)
            })
        }
        Lookup::In => {
            let items: Vec<Operand> = split_list(&rule.value)
                .map(|item| Operand::parse_lenient(item, now))
                .collect();
            Box::new(move |value| {
                for item in &items {
                    if equals(value, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            })
        }
        Lookup::IsNull => {
            let expect_null = text.boolean.ok_or_else(|| {
                CampaignError::rule(format!(
                    "isnull on '{}' expects true or false, got '{}'",
                    rule.field, rule.value
                ))
            })?;
            Box::new(move |value| Ok(value.is_null() == expect_null))
        }
    };

    Ok(CompiledRule {
        method: rule.method,
        field: rule.field.clone(),
        lookup: rule.lookup,
        matcher,
    })
}
