//! Base candidate sets. Rule-based campaigns use [`AllUsers`]; campaigns
//! defined by a hand-written query supply their own [`Audience`].

use campaign_core::{CampaignResult, User};
use chrono::{DateTime, Utc};

use crate::store::DripStore;

pub trait Audience: Send + Sync {
    /// The unfiltered candidates as of `now` (the instance's shifted time).
    fn base_set(&self, store: &dyn DripStore, now: DateTime<Utc>) -> CampaignResult<Vec<User>>;
}

/// Every user in the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllUsers;

impl Audience for AllUsers {
    fn base_set(&self, store: &dyn DripStore, _now: DateTime<Utc>) -> CampaignResult<Vec<User>> {
        store.query_users(&|_| true)
    }
}

/// Audience backed by a closure.
pub struct FnAudience<F>(pub F);

impl<F> Audience for FnAudience<F>
where
    F: Fn(&dyn DripStore, DateTime<Utc>) -> CampaignResult<Vec<User>> + Send + Sync,
{
    fn base_set(&self, store: &dyn DripStore, now: DateTime<Utc>) -> CampaignResult<Vec<User>> {
        (self.0)(store, now)
    }
}
