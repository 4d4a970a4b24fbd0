//! Grant ledger (§4.4): policy-ordered grant queue for one user's pour.
//! Structurally templated on the teacher's priority queue (pop
//! highest-priority item, skip ones that don't apply), applied here to
//! "pop cheapest grant, skip time-expired ones".

use crate::db::models::Grant;
use crate::db::stores::GrantStore;

/// Grants for one user, already fetched and ordered by policy priority
/// (§4.4: lowest `unit_cost_per_ounce` first, ties broken by grant id).
/// Consumed front-to-back over the life of one `PourSession`.
pub struct GrantLedger {
    queue: Vec<Grant>,
}

impl GrantLedger {
    /// Fetch every active grant for `user_id` and order it into policy
    /// priority order.
    pub async fn load(store: &GrantStore, user_id: i64) -> anyhow::Result<Self> {
        let mut grants = store.get_grants(user_id).await?;
        grants.sort_by(|a, b| {
            a.priority_key()
                .partial_cmp(&b.priority_key())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(Self { queue: grants })
    }

    #[cfg(test)]
    pub fn from_grants(mut grants: Vec<Grant>) -> Self {
        grants.sort_by(|a, b| {
            a.priority_key()
                .partial_cmp(&b.priority_key())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { queue: grants }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop the head grant, skipping any that are already time-expired.
    /// Per §9's Open Question, an exhausted queue simply yields `None` —
    /// there is no fallible-iterator special case to preserve in Rust.
    pub fn next_grant(&mut self, now: chrono::DateTime<chrono::Utc>) -> Option<Grant> {
        while !self.queue.is_empty() {
            let candidate = self.queue.remove(0);
            if !candidate.is_time_expired(now) {
                return Some(candidate);
            }
        }
        None
    }

    /// True once `ounces_consumed` on `grant` is at or beyond its
    /// allowance.
    pub fn is_exhausted(&self, grant: &Grant, ounces_consumed: f64) -> bool {
        grant.is_volume_exhausted(ounces_consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn grant(id: i64, cost: f64, allowance: f64, expires_in: Option<i64>) -> Grant {
        Grant {
            id,
            user_id: 1,
            policy_id: 1,
            unit_cost_per_ounce: cost,
            allowance_ounces: allowance,
            expires_at: expires_in.map(|mins| Utc::now() + Duration::minutes(mins)),
        }
    }

    #[test]
    fn orders_by_cost_then_id() {
        let mut ledger = GrantLedger::from_grants(vec![
            grant(2, 0.10, 16.0, None),
            grant(1, 0.10, 16.0, None),
            grant(3, 0.05, 16.0, None),
        ]);
        let now = Utc::now();
        assert_eq!(ledger.next_grant(now).unwrap().id, 3);
        assert_eq!(ledger.next_grant(now).unwrap().id, 1);
        assert_eq!(ledger.next_grant(now).unwrap().id, 2);
        assert!(ledger.next_grant(now).is_none());
    }

    #[test]
    fn skips_time_expired_grants_on_pop() {
        let mut ledger = GrantLedger::from_grants(vec![
            grant(1, 0.05, 16.0, Some(-5)), // already expired
            grant(2, 0.10, 16.0, None),
        ]);
        let now = Utc::now();
        let g = ledger.next_grant(now).unwrap();
        assert_eq!(g.id, 2);
        assert!(ledger.next_grant(now).is_none());
    }

    #[test]
    fn exhausted_iterator_yields_none_with_no_special_casing() {
        let mut ledger = GrantLedger::from_grants(vec![]);
        assert!(ledger.is_empty());
        assert!(ledger.next_grant(Utc::now()).is_none());
    }

    #[test]
    fn is_exhausted_at_or_beyond_allowance() {
        let ledger = GrantLedger::from_grants(vec![]);
        let g = grant(1, 0.05, 16.0, None);
        assert!(!ledger.is_exhausted(&g, 15.9));
        assert!(ledger.is_exhausted(&g, 16.0));
        assert!(ledger.is_exhausted(&g, 16.1));
    }
}
