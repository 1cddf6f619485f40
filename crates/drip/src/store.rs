//! Persistence seam for campaigns, candidates, and sent records.
//!
//! `MemoryStore` is the development/test backend. Production: implement
//! [`DripStore`] over a transactional database.

use campaign_core::{Campaign, CampaignError, CampaignResult, FilterRule, SentRecord, User};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;
use uuid::Uuid;

pub trait DripStore: Send + Sync {
    fn list_filter_rules(&self, campaign: &Campaign) -> CampaignResult<Vec<FilterRule>>;

    /// Users satisfying `predicate`, in a stable order.
    fn query_users(&self, predicate: &dyn Fn(&User) -> bool) -> CampaignResult<Vec<User>>;

    /// Append a sent record. Creation of a single record is atomic.
    fn create_sent_record(&self, record: SentRecord) -> CampaignResult<SentRecord>;

    /// Sent records for a campaign, optionally for one user, optionally only
    /// those dated at or before `until`.
    fn find_sent_records(
        &self,
        campaign_id: Uuid,
        user_id: Option<Uuid>,
        until: Option<DateTime<Utc>>,
    ) -> CampaignResult<Vec<SentRecord>>;

    /// Which of `user_ids` have a sent record for the campaign dated at or
    /// before `until`.
    fn sent_user_ids(
        &self,
        campaign_id: Uuid,
        user_ids: &[Uuid],
        until: DateTime<Utc>,
    ) -> CampaignResult<HashSet<Uuid>>;

    /// Enabled campaigns, optionally only those triggered by `trigger_entity`.
    fn list_enabled_campaigns(&self, trigger_entity: Option<&str>) -> CampaignResult<Vec<Campaign>>;

    fn get_campaign(&self, name: &str) -> CampaignResult<Option<Campaign>>;

    /// Insert or replace the campaign with this name. A replacement keeps
    /// the stored id.
    fn upsert_campaign(&self, campaign: Campaign) -> CampaignResult<()>;

    fn insert_user(&self, user: User) -> CampaignResult<()>;
}

/// Seed data for a [`MemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
}

impl Fixtures {
    pub fn from_path(path: &Path) -> CampaignResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<Vec<User>>,
    campaigns: DashMap<String, Campaign>,
    sent: RwLock<Vec<SentRecord>>,
    user_queries: AtomicUsize,
    sent_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixtures(fixtures: Fixtures) -> CampaignResult<Self> {
        let store = Self::new();
        let (users, campaigns) = (fixtures.users.len(), fixtures.campaigns.len());
        for user in fixtures.users {
            store.insert_user(user)?;
        }
        for campaign in fixtures.campaigns {
            store.upsert_campaign(campaign)?;
        }
        info!(users, campaigns, "Memory store seeded from fixtures");
        Ok(store)
    }

    pub fn sent_records(&self) -> Vec<SentRecord> {
        self.sent.read().clone()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// Number of candidate and sent-record queries served so far.
    pub fn query_count(&self) -> usize {
        self.user_queries.load(Ordering::Relaxed) + self.sent_queries.load(Ordering::Relaxed)
    }
}

impl DripStore for MemoryStore {
    fn list_filter_rules(&self, campaign: &Campaign) -> CampaignResult<Vec<FilterRule>> {
        Ok(self
            .campaigns
            .get(&campaign.name)
            .map(|c| c.rules.clone())
            .unwrap_or_else(|| campaign.rules.clone()))
    }

    fn query_users(&self, predicate: &dyn Fn(&User) -> bool) -> CampaignResult<Vec<User>> {
        self.user_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .users
            .read()
            .iter()
            .filter(|u| predicate(u))
            .cloned()
            .collect())
    }

    fn create_sent_record(&self, record: SentRecord) -> CampaignResult<SentRecord> {
        self.sent.write().push(record.clone());
        Ok(record)
    }

    fn find_sent_records(
        &self,
        campaign_id: Uuid,
        user_id: Option<Uuid>,
        until: Option<DateTime<Utc>>,
    ) -> CampaignResult<Vec<SentRecord>> {
        self.sent_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .sent
            .read()
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .filter(|r| user_id.map_or(true, |id| r.user_id == id))
            .filter(|r| until.map_or(true, |t| r.date <= t))
            .cloned()
            .collect())
    }

    fn sent_user_ids(
        &self,
        campaign_id: Uuid,
        user_ids: &[Uuid],
        until: DateTime<Utc>,
    ) -> CampaignResult<HashSet<Uuid>> {
        self.sent_queries.fetch_add(1, Ordering::Relaxed);
        let wanted: HashSet<&Uuid> = user_ids.iter().collect();
        Ok(self
            .sent
            .read()
            .iter()
            .filter(|r| r.campaign_id == campaign_id && r.date <= until)
            .filter(|r| wanted.contains(&r.user_id))
            .map(|r| r.user_id)
            .collect())
    }

    fn list_enabled_campaigns(&self, trigger_entity: Option<&str>) -> CampaignResult<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|c| c.enabled)
            .filter(|c| trigger_entity.map_or(true, |t| c.trigger_entity.as_deref() == Some(t)))
            .map(|c| c.value().clone())
            .collect();
        campaigns.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(campaigns)
    }

    fn get_campaign(&self, name: &str) -> CampaignResult<Option<Campaign>> {
        Ok(self.campaigns.get(name).map(|c| c.value().clone()))
    }

    fn upsert_campaign(&self, mut campaign: Campaign) -> CampaignResult<()> {
        campaign.validate()?;
        match self.campaigns.entry(campaign.name.clone()) {
            Entry::Occupied(mut existing) => {
                // Sent records reference the id, so a redefinition keeps it.
                campaign.id = existing.get().id;
                existing.insert(campaign);
            }
            Entry::Vacant(slot) => {
                slot.insert(campaign);
            }
        }
        Ok(())
    }

    fn insert_user(&self, user: User) -> CampaignResult<()> {
        let mut users = self.users.write();
        if users.iter().any(|u| u.id == user.id) {
            return Err(CampaignError::Store(format!("duplicate user id {}", user.id)));
        }
        users.push(user);
        Ok(())
    }
}
