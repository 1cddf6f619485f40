//! Campaign instances and the prune → build → record → send pipeline.

use campaign_channels::{BuilderRegistry, EmailMessage, EmailSpec, Transport};
use campaign_core::{
    Campaign, CampaignError, CampaignResult, Clock, DripConfig, SentRecord, SystemClock,
    TemplateEngine, TemplateRenderer, User,
};
use campaign_segmentation::RuleEvaluator;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audience::{AllUsers, Audience};
use crate::shift::{TimeShift, Walk};
use crate::store::DripStore;

/// Collaborators and settings shared by every instance of every campaign.
#[derive(Clone)]
pub struct DripContext {
    pub store: Arc<dyn DripStore>,
    pub transport: Arc<dyn Transport>,
    pub renderer: Arc<dyn TemplateEngine>,
    pub clock: Arc<dyn Clock>,
    pub builders: Arc<BuilderRegistry>,
    pub config: DripConfig,
}

impl DripContext {
    pub fn new(store: Arc<dyn DripStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            renderer: Arc::new(TemplateRenderer),
            clock: Arc::new(SystemClock),
            builders: Arc::new(BuilderRegistry::new()),
            config: DripConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DripConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateEngine>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_builders(mut self, builders: Arc<BuilderRegistry>) -> Self {
        self.builders = builders;
        self
    }
}

/// One day of a simulated walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub shift: TimeShift,
    pub now: DateTime<Utc>,
    /// Candidates after rule evaluation.
    pub candidates: usize,
    /// Candidates who have not yet been sent this campaign as of `now`.
    pub pending: usize,
}

/// A campaign bound to a time shift.
///
/// The definition and shift never change; the candidate set is computed on
/// first use and cached for the lifetime of the instance.
pub struct Drip {
    campaign: Arc<Campaign>,
    audience: Arc<dyn Audience>,
    ctx: DripContext,
    shift: TimeShift,
    queryset: Option<Vec<User>>,
}

impl fmt::Debug for Drip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drip")
            .field("campaign", &self.campaign.name)
            .field("shift", &self.shift)
            .field("cached", &self.queryset.as_ref().map(Vec::len))
            .finish()
    }
}

impl Drip {
    pub fn new(campaign: Campaign, ctx: DripContext) -> CampaignResult<Self> {
        campaign.validate()?;
        Ok(Self::from_parts(
            Arc::new(campaign),
            Arc::new(AllUsers),
            ctx,
            TimeShift::NONE,
        ))
    }

    pub(crate) fn from_parts(
        campaign: Arc<Campaign>,
        audience: Arc<dyn Audience>,
        ctx: DripContext,
        shift: TimeShift,
    ) -> Self {
        Self {
            campaign,
            audience,
            ctx,
            shift,
            queryset: None,
        }
    }

    /// Replace the base candidate set.
    pub fn with_audience(mut self, audience: Arc<dyn Audience>) -> Self {
        self.audience = audience;
        self.queryset = None;
        self
    }

    /// A sibling instance at `shift`, with its own empty cache.
    pub fn shifted(&self, shift: TimeShift) -> Self {
        Self::from_parts(
            Arc::clone(&self.campaign),
            Arc::clone(&self.audience),
            self.ctx.clone(),
            shift,
        )
    }

    pub fn name(&self) -> &str {
        &self.campaign.name
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub fn shift(&self) -> TimeShift {
        self.shift
    }

    /// The clock's current time moved by this instance's shift.
    pub fn now(&self) -> DateTime<Utc> {
        self.shift.apply(self.ctx.clock.now())
    }

    /// Sibling instances for every day offset in `[-past, future)`.
    pub fn walk(&self, past: u32, future: u32) -> Walk {
        Walk::new(
            Arc::clone(&self.campaign),
            Arc::clone(&self.audience),
            self.ctx.clone(),
            past,
            future,
        )
    }

    pub fn apply_queryset_rules(&self, base: Vec<User>) -> CampaignResult<Vec<User>> {
        let rules = self.ctx.store.list_filter_rules(&self.campaign)?;
        RuleEvaluator::compile(&rules, self.now())?.apply(base)
    }

    /// Candidates after rule evaluation, distinct by user id. Computed once
    /// per instance.
    pub fn get_queryset(&mut self) -> CampaignResult<&[User]> {
        if self.queryset.is_none() {
            let base = self.audience.base_set(self.ctx.store.as_ref(), self.now())?;
            let filtered = self.apply_queryset_rules(base)?;
            let mut seen = HashSet::with_capacity(filtered.len());
            let distinct: Vec<User> = filtered.into_iter().filter(|u| seen.insert(u.id)).collect();
            debug!(
                campaign = %self.campaign.name,
                shift = %self.shift,
                candidates = distinct.len(),
                "Candidate set resolved"
            );
            self.queryset = Some(distinct);
        }
        Ok(self.queryset.as_deref().unwrap_or_default())
    }

    /// Drop every candidate who already has a sent record for this campaign
    /// dated at or before `now()`. Returns how many were removed.
    pub fn prune(&mut self) -> CampaignResult<usize> {
        let candidate_ids: Vec<Uuid> = self.get_queryset()?.iter().map(|u| u.id).collect();
        if candidate_ids.is_empty() {
            return Ok(0);
        }
        let already = self
            .ctx
            .store
            .sent_user_ids(self.campaign.id, &candidate_ids, self.now())?;

        let Some(candidates) = self.queryset.as_mut() else {
            return Ok(0);
        };
        let before = candidates.len();
        candidates.retain(|u| !already.contains(&u.id));
        let removed = before - candidates.len();

        metrics::counter!("drip.pruned", "campaign" => self.campaign.name.clone())
            .increment(removed as u64);
        debug!(
            campaign = %self.campaign.name,
            removed,
            remaining = candidates.len(),
            "Already-sent users pruned"
        );
        Ok(removed)
    }

    /// Resolve the sender and templates. Fails when no sender address is
    /// configured on the campaign or globally.
    pub fn email_spec(&self) -> CampaignResult<EmailSpec> {
        let from_email = self
            .campaign
            .from_email
            .clone()
            .filter(|address| !address.trim().is_empty())
            .or_else(|| self.ctx.config.from_email.clone())
            .filter(|address| !address.trim().is_empty())
            .ok_or_else(|| {
                CampaignError::config(format!(
                    "no sender address for campaign '{}' and no default configured",
                    self.campaign.name
                ))
            })?;

        Ok(EmailSpec {
            subject_template: self.campaign.subject_template.clone(),
            body_template: self.campaign.body_template.clone(),
            from_email,
            from_email_name: self.campaign.from_email_name.clone(),
        })
    }

    /// Build the message for `user`. With `commit`, record the send and then
    /// hand the message to the transport.
    ///
    /// The sent record is written before transport, so a transport failure
    /// leaves the record in place and the user is not retried.
    pub fn build_email(&self, user: &User, commit: bool) -> CampaignResult<EmailMessage> {
        let spec = self.email_spec()?;
        let builder = self.ctx.builders.resolve(&self.ctx.config.email_builder)?;
        let message = builder.build(&spec, user, self.ctx.renderer.as_ref())?;

        if commit {
            let record = SentRecord {
                id: Uuid::new_v4(),
                campaign_id: self.campaign.id,
                user_id: user.id,
                date: self.ctx.clock.now(),
                from_email: spec.from_email.clone(),
                from_email_name: spec.from_email_name.clone(),
                subject: message.subject.clone(),
                body: message.html().unwrap_or(&message.body).to_string(),
            };
            self.ctx.store.create_sent_record(record)?;

            if let Err(e) = self.ctx.transport.send(&message) {
                metrics::counter!("drip.transport_failures", "campaign" => self.campaign.name.clone())
                    .increment(1);
                warn!(
                    campaign = %self.campaign.name,
                    user_id = %user.id,
                    error = %e,
                    "Transport failed after send was recorded"
                );
                return Err(e.into());
            }
            debug!(
                campaign = %self.campaign.name,
                user_id = %user.id,
                "Drip email sent"
            );
        }

        Ok(message)
    }

    /// Send to every remaining candidate and return how many were sent.
    pub fn send(&mut self) -> CampaignResult<usize> {
        let candidates = self.get_queryset()?.to_vec();
        let continue_on_error = self.ctx.config.continue_on_error;
        let mut count = 0;
        let mut failed = 0;
        for user in &candidates {
            match self.build_email(user, true) {
                Ok(_) => count += 1,
                Err(e) if continue_on_error => {
                    failed += 1;
                    warn!(
                        campaign = %self.campaign.name,
                        user_id = %user.id,
                        error = %e,
                        "Skipping user after send failure"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        metrics::counter!("drip.sent", "campaign" => self.campaign.name.clone())
            .increment(count as u64);
        if failed > 0 {
            warn!(campaign = %self.campaign.name, failed, "Some sends failed");
        }
        Ok(count)
    }

    /// Prune and send. `None` when the campaign is disabled.
    pub fn run(&mut self) -> CampaignResult<Option<usize>> {
        if !self.campaign.enabled {
            debug!(campaign = %self.campaign.name, "Campaign disabled, skipping run");
            return Ok(None);
        }
        let pruned = self.prune()?;
        let sent = self.send()?;
        info!(
            campaign = %self.campaign.name,
            shift = %self.shift,
            pruned,
            sent,
            "Drip run complete"
        );
        Ok(Some(sent))
    }

    /// Candidate counts for each day in `[-past, future)` without sending.
    pub fn timeline(&self, past: u32, future: u32) -> CampaignResult<Vec<TimelineEntry>> {
        self.walk(past, future)
            .map(|mut day| -> CampaignResult<TimelineEntry> {
                let candidates = day.get_queryset()?.len();
                day.prune()?;
                let pending = day.get_queryset()?.len();
                Ok(TimelineEntry {
                    shift: day.shift(),
                    now: day.now(),
                    candidates,
                    pending,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use campaign_channels::RecordingTransport;
    use campaign_core::{Lookup, MockClock};
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;

    struct Harness {
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
        clock: Arc<MockClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                transport: Arc::new(RecordingTransport::new()),
                clock: Arc::new(MockClock::new(
                    Utc.with_ymd_and_hms(2024, 5, 10, 15, 0, 0).unwrap(),
                )),
            }
        }

        fn ctx(&self) -> DripContext {
            DripContext::new(self.store.clone(), self.transport.clone())
                .with_clock(self.clock.clone())
                .with_config(DripConfig::default().with_from_email("drips@example.com"))
        }

        fn add_user(&self, email: &str, joined_days_ago: i64) -> User {
            let user = User::new(email, self.clock.now() - Duration::days(joined_days_ago));
            self.store.insert_user(user.clone()).unwrap();
            user
        }
    }

    fn welcome() -> Campaign {
        Campaign::new("welcome", "Welcome {{ user.email }}", "<p>Hello</p>").with_rules(vec![
            campaign_core::FilterRule::filter("date_joined", Lookup::Gte, "now-1 day"),
        ])
    }

    #[test]
    fn test_now_applies_shift() {
        let h = Harness::new();
        let drip = Drip::new(welcome(), h.ctx()).unwrap();
        assert_eq!(drip.now(), h.clock.now());
        assert_eq!(
            drip.shifted(TimeShift::days(-2)).now(),
            h.clock.now() - Duration::days(2)
        );
    }

    #[test]
    fn test_nameless_campaign_rejected() {
        let h = Harness::new();
        let err = Drip::new(Campaign::new("", "s", "b"), h.ctx()).unwrap_err();
        assert!(matches!(err, CampaignError::Config(_)));
    }

    #[test]
    fn test_queryset_is_cached() {
        let h = Harness::new();
        h.add_user("a@example.com", 0);
        let mut drip = Drip::new(welcome(), h.ctx()).unwrap();
        let first = drip.get_queryset().unwrap().to_vec();
        // A user added after the first evaluation does not appear.
        h.add_user("b@example.com", 0);
        let second = drip.get_queryset().unwrap().to_vec();
        assert_eq!(first, second);
        assert_eq!(h.store.query_count(), 1);
    }

    #[test]
    fn test_queryset_is_distinct() {
        let h = Harness::new();
        let user = h.add_user("a@example.com", 0);
        let audience = crate::audience::FnAudience(
            move |_: &dyn DripStore, _: DateTime<Utc>| -> CampaignResult<Vec<User>> {
                Ok(vec![user.clone(), user.clone()])
            },
        );
        let mut drip = Drip::new(welcome(), h.ctx())
            .unwrap()
            .with_audience(Arc::new(audience));
        assert_eq!(drip.get_queryset().unwrap().len(), 1);
    }

    #[test]
    fn test_prune_uses_inclusive_now() {
        let h = Harness::new();
        let user = h.add_user("a@example.com", 0);
        let mut drip = Drip::new(welcome(), h.ctx()).unwrap();
        // Record stamped exactly at the instance's now.
        drip.build_email(&user, true).unwrap();
        assert_eq!(drip.prune().unwrap(), 1);
        assert!(drip.get_queryset().unwrap().is_empty());
    }

    #[test]
    fn test_prune_only_counts_current_candidates() {
        let h = Harness::new();
        let fresh = h.add_user("fresh@example.com", 0);
        let veteran = h.add_user("veteran@example.com", 30);
        let campaign = welcome();
        let seed = Drip::new(campaign.clone(), h.ctx()).unwrap();
        seed.build_email(&veteran, true).unwrap();

        let mut drip = Drip::new(campaign, h.ctx()).unwrap();
        assert_eq!(drip.prune().unwrap(), 0);
        assert_eq!(drip.get_queryset().unwrap(), &[fresh][..]);
    }

    #[test]
    fn test_prune_ignores_records_after_shifted_now() {
        let h = Harness::new();
        let user = h.add_user("a@example.com", 0);
        let campaign = welcome();
        Drip::new(campaign.clone(), h.ctx())
            .unwrap()
            .build_email(&user, true)
            .unwrap();

        // Yesterday the user had joined within a day (rule) and had not yet
        // been sent anything.
        let mut yesterday = Drip::new(campaign, h.ctx())
            .unwrap()
            .shifted(TimeShift::days(-1));
        assert_eq!(yesterday.prune().unwrap(), 0);
        assert_eq!(yesterday.get_queryset().unwrap().len(), 1);
    }

    #[test]
    fn test_build_without_commit_records_nothing() {
        let h = Harness::new();
        let user = h.add_user("a@example.com", 0);
        let drip = Drip::new(welcome(), h.ctx()).unwrap();
        let message = drip.build_email(&user, false).unwrap();
        assert_eq!(message.subject, "Welcome a@example.com");
        assert!(h.store.sent_records().is_empty());
        assert_eq!(h.transport.count(), 0);
    }

    #[test]
    fn test_campaign_sender_wins_over_default() {
        let h = Harness::new();
        let user = h.add_user("a@example.com", 0);
        let drip = Drip::new(welcome().with_sender("a@b.com", Some("Team")), h.ctx()).unwrap();
        let message = drip.build_email(&user, true).unwrap();
        assert_eq!(message.from, "Team <a@b.com>");
        let record = &h.store.sent_records()[0];
        assert_eq!(record.from_email, "a@b.com");
        assert_eq!(record.from_email_name.as_deref(), Some("Team"));
        assert_eq!(record.body, "<p>Hello</p>");
    }

    #[derive(Default)]
    struct CountingRenderer {
        calls: Mutex<usize>,
    }

    impl TemplateEngine for CountingRenderer {
        fn render(&self, template: &str, context: &serde_json::Value) -> CampaignResult<String> {
            *self.calls.lock() += 1;
            TemplateRenderer.render(template, context)
        }
    }

    #[test]
    fn test_missing_sender_fails_before_render() {
        let h = Harness::new();
        let user = h.add_user("a@example.com", 0);
        let renderer = Arc::new(CountingRenderer::default());
        let ctx = DripContext::new(h.store.clone(), h.transport.clone())
            .with_clock(h.clock.clone())
            .with_renderer(renderer.clone());
        let drip = Drip::new(welcome(), ctx).unwrap();

        let err = drip.build_email(&user, true).unwrap_err();
        assert!(matches!(err, CampaignError::Config(_)));
        assert_eq!(*renderer.calls.lock(), 0);
        assert!(h.store.sent_records().is_empty());
    }

    #[test]
    fn test_unknown_builder_is_config_error() {
        let h = Harness::new();
        let user = h.add_user("a@example.com", 0);
        let mut config = DripConfig::default().with_from_email("drips@example.com");
        config.email_builder = "fancy".to_string();
        let drip = Drip::new(welcome(), h.ctx().with_config(config)).unwrap();
        assert!(matches!(
            drip.build_email(&user, false),
            Err(CampaignError::Config(_))
        ));
    }

    #[test]
    fn test_transport_failure_keeps_record_and_aborts() {
        let h = Harness::new();
        h.add_user("a@example.com", 0);
        h.add_user("b@example.com", 0);
        h.add_user("c@example.com", 0);
        h.transport.fail_for("b@example.com");

        let campaign = welcome();
        let mut drip = Drip::new(campaign.clone(), h.ctx()).unwrap();
        let err = drip.run().unwrap_err();
        assert!(matches!(err, CampaignError::Transport(_)));
        // a sent, b recorded but undelivered, c untouched.
        assert_eq!(h.transport.count(), 1);
        assert_eq!(h.store.sent_records().len(), 2);

        // Resuming does not retry b.
        let mut again = Drip::new(campaign, h.ctx()).unwrap();
        assert_eq!(again.run().unwrap(), Some(1));
        assert_eq!(h.transport.sent()[1].to, vec!["c@example.com".to_string()]);
    }

    #[test]
    fn test_continue_on_error_skips_failed_user() {
        let h = Harness::new();
        h.add_user("a@example.com", 0);
        h.add_user("b@example.com", 0);
        h.add_user("c@example.com", 0);
        h.transport.fail_for("b@example.com");

        let mut config = DripConfig::default().with_from_email("drips@example.com");
        config.continue_on_error = true;
        let mut drip = Drip::new(welcome(), h.ctx().with_config(config)).unwrap();
        assert_eq!(drip.run().unwrap(), Some(2));
        assert_eq!(h.store.sent_records().len(), 3);
    }

    #[test]
    fn test_bad_rule_aborts_run_without_records() {
        let h = Harness::new();
        h.add_user("a@example.com", 0);
        let campaign = welcome().with_rules(vec![campaign_core::FilterRule::filter(
            "favorite_color",
            Lookup::Exact,
            "green",
        )]);
        let mut drip = Drip::new(campaign, h.ctx()).unwrap();
        assert!(matches!(
            drip.run(),
            Err(CampaignError::RuleEvaluation(_))
        ));
        assert!(h.store.sent_records().is_empty());
    }

    #[test]
    fn test_timeline_counts_each_day() {
        let h = Harness::new();
        h.add_user("today@example.com", 0);
        h.add_user("two-days@example.com", 2);
        let drip = Drip::new(welcome(), h.ctx()).unwrap();

        let timeline = drip.timeline(3, 2).unwrap();
        let shifts: Vec<i64> = timeline.iter().map(|e| e.shift.as_days()).collect();
        assert_eq!(shifts, vec![-3, -2, -1, 0, 1]);
        let counts: Vec<usize> = timeline.iter().map(|e| e.candidates).collect();
        // Joins after a shifted now still satisfy `>= now-1 day`.
        assert_eq!(counts, vec![2, 2, 2, 1, 1]);
        assert!(h.store.sent_records().is_empty());
    }
}
