//! Time shifting: a campaign instance's "now" is the clock's now moved by a
//! whole number of days.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use campaign_core::Campaign;

use crate::audience::Audience;
use crate::drip::{Drip, DripContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct TimeShift {
    days: i64,
}

impl TimeShift {
    pub const NONE: Self = Self { days: 0 };

    pub fn days(days: i64) -> Self {
        Self { days }
    }

    pub fn as_days(&self) -> i64 {
        self.days
    }

    pub fn is_zero(&self) -> bool {
        self.days == 0
    }

    /// Move `now` by the shift. Shifts past the representable range clamp to
    /// the earliest or latest instant.
    pub fn apply(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_zero() {
            return now;
        }
        let limit = if self.days > 0 {
            DateTime::<Utc>::MAX_UTC
        } else {
            DateTime::<Utc>::MIN_UTC
        };
        TimeDelta::try_days(self.days)
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(limit)
    }
}

impl fmt::Display for TimeShift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}d", self.days)
    }
}

/// Lazy sequence of sibling instances, one per day offset in
/// `[-past, future)`. Cloning restarts from the current position.
#[derive(Clone)]
pub struct Walk {
    campaign: Arc<Campaign>,
    audience: Arc<dyn Audience>,
    ctx: DripContext,
    offsets: Range<i64>,
}

impl Walk {
    pub(crate) fn new(
        campaign: Arc<Campaign>,
        audience: Arc<dyn Audience>,
        ctx: DripContext,
        past: u32,
        future: u32,
    ) -> Self {
        Self {
            campaign,
            audience,
            ctx,
            offsets: -i64::from(past)..i64::from(future),
        }
    }
}

impl Iterator for Walk {
    type Item = Drip;

    fn next(&mut self) -> Option<Drip> {
        let days = self.offsets.next()?;
        Some(Drip::from_parts(
            Arc::clone(&self.campaign),
            Arc::clone(&self.audience),
            self.ctx.clone(),
            TimeShift::days(days),
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.offsets.size_hint()
    }
}

impl ExactSizeIterator for Walk {}

impl fmt::Debug for Walk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Walk")
            .field("campaign", &self.campaign.name)
            .field("offsets", &self.offsets)
            .finish()
    }
}
