//! Monthly budget for the constrained model tier.
//!
//! Tier selection asks a [`BudgetGuard`] whether the desired tier may be
//! used. The guard answers from the usage ledger kept in storage; if it
//! cannot answer, the run proceeds on the requested tier.

use std::future::Future;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tracing::{debug, warn};

use bulkresearch_shared::{BudgetSnapshot, ModelTier, Result};
use bulkresearch_storage::Storage;

/// Decides whether a model tier may be dispatched.
pub trait BudgetGuard {
    /// Whether `tier` is within budget right now.
    fn is_allowed(&self, tier: ModelTier) -> impl Future<Output = Result<bool>>;

    /// A tier that is always allowed, to use instead of `tier`.
    fn fallback(&self, tier: ModelTier) -> ModelTier;

    /// Current usage of the budgeted tier.
    fn snapshot(&self) -> impl Future<Output = Result<BudgetSnapshot>>;
}

/// Result of [`resolve_tier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierResolution {
    pub requested: ModelTier,
    pub tier: ModelTier,
    pub downgraded: bool,
}

/// Pick the tier to dispatch a window with.
///
/// A guard failure is logged and treated as "allowed".
pub async fn resolve_tier<G: BudgetGuard>(guard: &G, requested: ModelTier) -> TierResolution {
    let allowed = match guard.is_allowed(requested).await {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!(tier = %requested, error = %e, "budget check failed, keeping requested tier");
            true
        }
    };

    if allowed {
        debug!(tier = %requested, "tier within budget");
        return TierResolution {
            requested,
            tier: requested,
            downgraded: false,
        };
    }

    let tier = guard.fallback(requested);
    warn!(requested = %requested, fallback = %tier, "tier over budget, downgrading");
    TierResolution {
        requested,
        tier,
        downgraded: tier != requested,
    }
}

/// Budget backed by the storage usage ledger.
///
/// Only `constrained_tier` is counted; every other tier is always allowed.
pub struct LedgerBudget<'a> {
    storage: &'a Storage,
    constrained_tier: ModelTier,
    monthly_limit: u64,
}

impl<'a> LedgerBudget<'a> {
    pub fn new(storage: &'a Storage, constrained_tier: ModelTier, monthly_limit: u64) -> Self {
        Self {
            storage,
            constrained_tier,
            monthly_limit,
        }
    }

    async fn used_this_month(&self) -> Result<u64> {
        self.storage
            .tier_usage_since(self.constrained_tier.as_str(), month_start(Utc::now()))
            .await
    }
}

impl BudgetGuard for LedgerBudget<'_> {
    async fn is_allowed(&self, tier: ModelTier) -> Result<bool> {
        if tier != self.constrained_tier {
            return Ok(true);
        }
        let used = self.used_this_month().await?;
        Ok(used < self.monthly_limit)
    }

    fn fallback(&self, tier: ModelTier) -> ModelTier {
        let mut candidate = tier;
        while candidate == self.constrained_tier && candidate != ModelTier::Sonar {
            candidate = candidate.downgrade();
        }
        candidate
    }

    async fn snapshot(&self) -> Result<BudgetSnapshot> {
        let used = self.used_this_month().await?;
        Ok(BudgetSnapshot::new(used, self.monthly_limit))
    }
}

/// Midnight UTC on the first day of `now`'s month.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}
