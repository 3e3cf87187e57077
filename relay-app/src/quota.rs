//! Per-owner daily message quota for the web channel.

use crate::config::QuotaConfig;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    /// Allowed, but the owner is close to the limit.
    Warning,
    Blocked,
}

#[async_trait]
pub trait QuotaCheck: Send + Sync {
    /// Counts the message when it is allowed. Blocked messages are not counted.
    async fn check_and_increment(&self, owner_id: &str) -> anyhow::Result<QuotaDecision>;

    /// Returns one counted message when nothing was generated for it.
    async fn refund(&self, owner_id: &str) -> anyhow::Result<()>;
}

/// In-memory counter that resets at UTC midnight.
pub struct DailyMessageQuota {
    daily_limit: u32,
    warning_threshold: u32,
    usage: DashMap<String, (NaiveDate, u32)>,
}

impl DailyMessageQuota {
    pub fn new(daily_limit: u32, warning_threshold: u32) -> Self {
        Self {
            daily_limit,
            warning_threshold,
            usage: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &QuotaConfig) -> Self {
        Self::new(cfg.daily_limit, cfg.warning_threshold)
    }

    fn decide(&self, owner_id: &str, today: NaiveDate) -> QuotaDecision {
        let mut entry = self
            .usage
            .entry(owner_id.to_string())
            .or_insert((today, 0));
        let (day, count) = entry.value_mut();
        if *day != today {
            *day = today;
            *count = 0;
        }

        if *count >= self.daily_limit {
            tracing::info!(
                owner_id,
                count = *count,
                limit = self.daily_limit,
                "daily quota exhausted"
            );
            return QuotaDecision::Blocked;
        }
        *count += 1;
        if *count >= self.warning_threshold {
            QuotaDecision::Warning
        } else {
            QuotaDecision::Allowed
        }
    }

    fn give_back(&self, owner_id: &str, today: NaiveDate) {
        if let Some(mut entry) = self.usage.get_mut(owner_id) {
            let (day, count) = entry.value_mut();
            if *day == today && *count > 0 {
                *count -= 1;
            }
        }
    }

    pub fn used_today(&self, owner_id: &str) -> u32 {
        let today = Utc::now().date_naive();
        self.usage
            .get(owner_id)
            .filter(|entry| entry.0 == today)
            .map_or(0, |entry| entry.1)
    }
}

#[async_trait]
impl QuotaCheck for DailyMessageQuota {
    async fn check_and_increment(&self, owner_id: &str) -> anyhow::Result<QuotaDecision> {
        Ok(self.decide(owner_id, Utc::now().date_naive()))
    }

    async fn refund(&self, owner_id: &str) -> anyhow::Result<()> {
        self.give_back(owner_id, Utc::now().date_naive());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).expect("valid date")
    }

    #[test]
    fn warns_near_the_limit_then_blocks() {
        let quota = DailyMessageQuota::new(3, 2);
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Allowed);
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Warning);
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Warning);
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Blocked);
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Blocked);
        assert_eq!(quota.decide("u2", day(1)), QuotaDecision::Allowed);
    }

    #[test]
    fn counter_resets_on_a_new_day() {
        let quota = DailyMessageQuota::new(1, 1);
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Warning);
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Blocked);
        assert_eq!(quota.decide("u1", day(2)), QuotaDecision::Warning);
    }

    #[test]
    fn refund_only_touches_the_current_day() {
        let quota = DailyMessageQuota::new(1, 1);
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Warning);
        quota.give_back("u1", day(1));
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Warning);

        quota.give_back("u1", day(2));
        assert_eq!(quota.decide("u1", day(1)), QuotaDecision::Blocked);
        quota.give_back("nobody", day(1));
        assert!(quota.usage.get("nobody").is_none());
    }

    #[tokio::test]
    async fn check_and_increment_counts_today() {
        let quota = DailyMessageQuota::new(10, 8);
        let decision = quota
            .check_and_increment("u1")
            .await
            .expect("quota check");
        assert_eq!(decision, QuotaDecision::Allowed);
        assert_eq!(quota.used_today("u1"), 1);
        assert_eq!(quota.used_today("nobody"), 0);
    }
}
