//! Trigger dispatcher: runs campaigns when a watched entity is created and
//! on the scheduled sweep.
//!
//! At most one run per campaign is in flight in this process at a time; a
//! trigger that arrives while the campaign is running is skipped. This is
//! what keeps overlapping runs from computing the same candidates before
//! either has recorded its sends.

use campaign_core::{Campaign, CampaignError, CampaignResult};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audience::Audience;
use crate::drip::{Drip, DripContext};

#[derive(Debug)]
pub enum RunOutcome {
    Sent(usize),
    Disabled,
    AlreadyRunning,
    Failed(CampaignError),
}

#[derive(Debug)]
pub struct CampaignRun {
    pub campaign: String,
    pub outcome: RunOutcome,
}

impl CampaignRun {
    pub fn sent(&self) -> usize {
        match self.outcome {
            RunOutcome::Sent(count) => count,
            _ => 0,
        }
    }
}

/// Removes the campaign from the in-flight set when the run ends.
struct InFlight<'a> {
    running: &'a DashMap<Uuid, ()>,
    id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

pub struct TriggerDispatcher {
    ctx: DripContext,
    audiences: DashMap<String, Arc<dyn Audience>>,
    running: DashMap<Uuid, ()>,
}

impl TriggerDispatcher {
    pub fn new(ctx: DripContext) -> Self {
        Self {
            ctx,
            audiences: DashMap::new(),
            running: DashMap::new(),
        }
    }

    /// Use `audience` as the base set for the campaign named `campaign`.
    pub fn register_audience(&self, campaign: impl Into<String>, audience: Arc<dyn Audience>) {
        self.audiences.insert(campaign.into(), audience);
    }

    /// Run every enabled campaign triggered by creation of `entity_type`.
    pub fn on_entity_created(&self, entity_type: &str) -> CampaignResult<Vec<CampaignRun>> {
        let campaigns = self.ctx.store.list_enabled_campaigns(Some(entity_type))?;
        info!(
            entity_type,
            campaigns = campaigns.len(),
            "Entity created, evaluating triggered campaigns"
        );
        Ok(campaigns.into_iter().map(|c| self.run_campaign(c)).collect())
    }

    /// Scheduled re-evaluation of every enabled campaign.
    pub fn run_all(&self) -> CampaignResult<Vec<CampaignRun>> {
        let campaigns = self.ctx.store.list_enabled_campaigns(None)?;
        let runs: Vec<CampaignRun> = campaigns.into_iter().map(|c| self.run_campaign(c)).collect();
        let sent: usize = runs.iter().map(CampaignRun::sent).sum();
        info!(campaigns = runs.len(), sent, "Scheduled sweep complete");
        Ok(runs)
    }

    pub fn run_campaign(&self, campaign: Campaign) -> CampaignRun {
        let name = campaign.name.clone();
        if self.running.insert(campaign.id, ()).is_some() {
            warn!(campaign = %name, "Campaign already running, trigger skipped");
            return CampaignRun {
                campaign: name,
                outcome: RunOutcome::AlreadyRunning,
            };
        }
        let _guard = InFlight {
            running: &self.running,
            id: campaign.id,
        };

        let outcome = match self.instance(campaign).and_then(|mut drip| drip.run()) {
            Ok(Some(count)) => RunOutcome::Sent(count),
            Ok(None) => RunOutcome::Disabled,
            Err(e) => {
                error!(campaign = %name, error = %e, "Campaign run failed");
                RunOutcome::Failed(e)
            }
        };
        CampaignRun {
            campaign: name,
            outcome,
        }
    }

    fn instance(&self, campaign: Campaign) -> CampaignResult<Drip> {
        let audience = self.audiences.get(&campaign.name).map(|a| Arc::clone(a.value()));
        let drip = Drip::new(campaign, self.ctx.clone())?;
        Ok(match audience {
            Some(audience) => drip.with_audience(audience),
            None => drip,
        })
    }

    pub fn is_running(&self, campaign_id: &Uuid) -> bool {
        self.running.contains_key(campaign_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audience::FnAudience;
    use crate::store::{DripStore, MemoryStore};
    use campaign_channels::RecordingTransport;
    use campaign_core::{DripConfig, User};
    use chrono::{DateTime, Utc};

    fn setup() -> (Arc<MemoryStore>, Arc<RecordingTransport>, TriggerDispatcher) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let ctx = DripContext::new(store.clone(), transport.clone())
            .with_config(DripConfig::default().with_from_email("drips@example.com"));
        (store, transport, TriggerDispatcher::new(ctx))
    }

    #[test]
    fn test_entity_trigger_runs_matching_campaigns_only() {
        let (store, transport, dispatcher) = setup();
        store.insert_user(User::new("a@example.com", Utc::now())).unwrap();
        store
            .upsert_campaign(Campaign::new("order-thanks", "Thanks", "Body").triggered_by("order"))
            .unwrap();
        store
            .upsert_campaign(Campaign::new("signup", "Hi", "Body").triggered_by("profile"))
            .unwrap();

        let runs = dispatcher.on_entity_created("order").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].campaign, "order-thanks");
        assert_eq!(runs[0].sent(), 1);
        assert_eq!(transport.count(), 1);

        // Second creation event: already sent, nothing new.
        let runs = dispatcher.on_entity_created("order").unwrap();
        assert_eq!(runs[0].sent(), 0);
    }

    #[test]
    fn test_failed_campaign_does_not_stop_sweep() {
        let (store, _transport, dispatcher) = setup();
        store.insert_user(User::new("a@example.com", Utc::now())).unwrap();
        store
            .upsert_campaign(Campaign::new("a-broken", "{{ oops", "Body"))
            .unwrap();
        store.upsert_campaign(Campaign::new("b-fine", "Hi", "Body")).unwrap();

        let runs = dispatcher.run_all().unwrap();
        assert!(matches!(runs[0].outcome, RunOutcome::Failed(CampaignError::Template(_))));
        assert!(matches!(runs[1].outcome, RunOutcome::Sent(1)));
        assert!(!dispatcher.is_running(&store.get_campaign("a-broken").unwrap().unwrap().id));
    }

    #[test]
    fn test_registered_audience_is_used() {
        let (store, _transport, dispatcher) = setup();
        store.insert_user(User::new("a@example.com", Utc::now())).unwrap();
        store.insert_user(User::new("vip@example.com", Utc::now())).unwrap();
        store.upsert_campaign(Campaign::new("vip", "Hi", "Body")).unwrap();
        dispatcher.register_audience(
            "vip",
            Arc::new(FnAudience(
                |store: &dyn DripStore, _: DateTime<Utc>| -> CampaignResult<Vec<User>> {
                    store.query_users(&|u| u.email.starts_with("vip"))
                },
            )),
        );

        let runs = dispatcher.run_all().unwrap();
        assert_eq!(runs[0].sent(), 1);
    }

    #[test]
    fn test_overlapping_trigger_is_skipped() {
        let (store, transport, dispatcher) = setup();
        let dispatcher = Arc::new(dispatcher);
        store.insert_user(User::new("a@example.com", Utc::now())).unwrap();
        let campaign = Campaign::new("welcome", "Hi", "Body");
        store.upsert_campaign(campaign.clone()).unwrap();

        // An audience that re-enters the dispatcher mid-run, as an
        // overlapping trigger would.
        let inner = Arc::clone(&dispatcher);
        let nested = Arc::new(parking_lot::Mutex::new(None));
        let nested_slot = Arc::clone(&nested);
        let reentrant = campaign.clone();
        dispatcher.register_audience(
            "welcome",
            Arc::new(FnAudience(
                move |store: &dyn DripStore, _: DateTime<Utc>| -> CampaignResult<Vec<User>> {
                    let run = inner.run_campaign(reentrant.clone());
                    *nested_slot.lock() = Some(run);
                    store.query_users(&|_| true)
                },
            )),
        );

        let run = dispatcher.run_campaign(campaign);
        assert_eq!(run.sent(), 1);
        let nested = nested.lock().take().unwrap();
        assert!(matches!(nested.outcome, RunOutcome::AlreadyRunning));
        assert_eq!(transport.count(), 1);
    }
}
