//! Token Bucket Rate Limiter
//!
//! Admission control applied before any outbound call to the remote store.
//! Two independent scopes are checked: the tenant's plan-based bucket and a
//! per-caller-IP anti-abuse bucket. A call is admitted only when both allow
//! it, and tokens are deducted from both or neither.
//!
//! ## Algorithm
//!
//! Token bucket: each bucket starts full at `capacity` and refills at
//! `refill_per_sec`, computed lazily from elapsed time at check time — no
//! background timer. `try_acquire` either deducts `cost` and admits, or
//! rejects with a `retry_after` hint equal to the time until enough tokens
//! accrue.
//!
//! ## Blocking Behavior
//!
//! This component never makes network calls and never yields: all state sits
//! behind one `std::sync::Mutex` and every operation completes synchronously.
//! Rejection is immediate; waiting out `retry_after` is the caller's choice
//! (the batch queue does, request handlers don't).
//!
//! Buckets for scopes unseen longer than the configured idle period are
//! pruned by the facade's background sweep to bound memory.

use crate::config::{BucketParams, LimiterConfig};
use rowgate_core::TenantPlan;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Admission scope: one bucket per distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Tenant(String),
    Ip(String),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Tenant(id) => write!(f, "tenant:{id}"),
            Scope::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed,
    Throttled { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Allowed => None,
            Decision::Throttled { retry_after } => Some(*retry_after),
        }
    }
}

struct Bucket {
    tokens: f64,
    params: BucketParams,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(params: BucketParams, now: Instant) -> Self {
        Self {
            tokens: params.capacity,
            params,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens =
                (self.tokens + elapsed * self.params.refill_per_sec).min(self.params.capacity);
            self.last_refill = now;
        }
        self.last_seen = now;
    }

    /// Time until `cost` tokens will be available.
    fn time_until(&self, cost: f64) -> Duration {
        let deficit = (cost - self.tokens).max(0.0);
        if self.params.refill_per_sec <= 0.0 {
            return Duration::from_secs(u64::MAX / 2);
        }
        Duration::from_secs_f64(deficit / self.params.refill_per_sec)
    }
}

/// Tenant- and IP-scoped token-bucket limiter.
pub struct RateLimiter {
    config: LimiterConfig,
    buckets: Mutex<HashMap<Scope, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn params_for(&self, scope: &Scope, plan: TenantPlan) -> BucketParams {
        match scope {
            Scope::Tenant(_) => self.config.for_plan(plan),
            Scope::Ip(_) => self.config.ip,
        }
    }

    /// Check-and-deduct on a single scope.
    pub fn try_acquire(&self, scope: Scope, plan: TenantPlan, cost: f64) -> Decision {
        let now = Instant::now();
        let params = self.params_for(&scope, plan);
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(scope.clone())
            .or_insert_with(|| Bucket::new(params, now));
        bucket.refill(now);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            trace!(scope = %scope, remaining = bucket.tokens, "admitted");
            Decision::Allowed
        } else {
            let retry_after = bucket.time_until(cost);
            debug!(scope = %scope, retry_after_ms = retry_after.as_millis(), "throttled");
            Decision::Throttled { retry_after }
        }
    }

    /// Check both the tenant bucket and (optionally) the caller-IP bucket;
    /// deduct from both only if both admit. On rejection the hint is the
    /// longer of the two waits.
    pub fn admit(
        &self,
        tenant_id: &str,
        plan: TenantPlan,
        caller_ip: Option<&str>,
        cost: f64,
    ) -> Decision {
        let now = Instant::now();
        let tenant_scope = Scope::Tenant(tenant_id.to_string());
        let tenant_params = self.config.for_plan(plan);
        let ip_scope = caller_ip.map(|ip| Scope::Ip(ip.to_string()));

        let mut buckets = self.buckets.lock().unwrap();

        let mut worst_wait: Option<Duration> = None;
        for (scope, params) in std::iter::once((&tenant_scope, tenant_params))
            .chain(ip_scope.iter().map(|s| (s, self.config.ip)))
        {
            let bucket = buckets
                .entry(scope.clone())
                .or_insert_with(|| Bucket::new(params, now));
            bucket.refill(now);
            if bucket.tokens < cost {
                let wait = bucket.time_until(cost);
                worst_wait = Some(worst_wait.map_or(wait, |w| w.max(wait)));
            }
        }

        if let Some(retry_after) = worst_wait {
            debug!(
                tenant = tenant_id,
                retry_after_ms = retry_after.as_millis(),
                "admission throttled"
            );
            return Decision::Throttled { retry_after };
        }

        // Both allowed; deduct from both.
        for scope in std::iter::once(&tenant_scope).chain(ip_scope.iter()) {
            if let Some(bucket) = buckets.get_mut(scope) {
                bucket.tokens -= cost;
            }
        }
        Decision::Allowed
    }

    /// Drop buckets unseen for longer than the configured idle period.
    /// Returns the number pruned.
    pub fn prune_idle(&self) -> usize {
        let max_idle = Duration::from_millis(self.config.idle_prune_ms);
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.last_seen) < max_idle);
        let pruned = before - buckets.len();
        if pruned > 0 {
            debug!(pruned, remaining = buckets.len(), "pruned idle rate buckets");
        }
        pruned
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: f64, refill: f64) -> RateLimiter {
        let params = BucketParams {
            capacity,
            refill_per_sec: refill,
        };
        RateLimiter::new(LimiterConfig {
            free: params,
            pro: params,
            enterprise: params,
            ip: params,
            idle_prune_ms: 10 * 60 * 1000,
        })
    }

    fn tenant(id: &str) -> Scope {
        Scope::Tenant(id.to_string())
    }

    #[test]
    fn test_capacity_then_throttle() {
        let limiter = limiter(5.0, 1.0);

        for _ in 0..5 {
            assert!(limiter
                .try_acquire(tenant("t1"), TenantPlan::Pro, 1.0)
                .is_allowed());
        }

        let decision = limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 1.0);
        let retry_after = decision.retry_after().expect("should be throttled");
        // One token at 1/s: the hint should be about a second.
        assert!(retry_after > Duration::from_millis(900));
        assert!(retry_after <= Duration::from_millis(1100));
    }

    #[test]
    fn test_scopes_are_independent() {
        let limiter = limiter(2.0, 1.0);

        assert!(limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 2.0).is_allowed());
        assert!(!limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 1.0).is_allowed());

        // t2 has its own bucket
        assert!(limiter.try_acquire(tenant("t2"), TenantPlan::Pro, 1.0).is_allowed());
    }

    #[test]
    fn test_admit_requires_both_scopes() {
        let limiter = limiter(2.0, 0.1);

        // Drain the IP bucket through another tenant
        assert!(limiter
            .admit("t1", TenantPlan::Pro, Some("10.0.0.1"), 2.0)
            .is_allowed());

        // t2's bucket is full but the shared IP bucket is empty
        let decision = limiter.admit("t2", TenantPlan::Pro, Some("10.0.0.1"), 1.0);
        assert!(!decision.is_allowed());

        // A different IP admits fine
        assert!(limiter
            .admit("t2", TenantPlan::Pro, Some("10.0.0.2"), 1.0)
            .is_allowed());
    }

    #[test]
    fn test_admit_deducts_nothing_on_rejection() {
        let limiter = limiter(1.0, 0.1);

        // IP bucket empty after this
        assert!(limiter
            .admit("t1", TenantPlan::Pro, Some("10.0.0.1"), 1.0)
            .is_allowed());

        // Rejected on the IP scope; the t2 tenant bucket must be untouched
        assert!(!limiter
            .admit("t2", TenantPlan::Pro, Some("10.0.0.1"), 1.0)
            .is_allowed());
        assert!(limiter
            .admit("t2", TenantPlan::Pro, Some("10.0.0.2"), 1.0)
            .is_allowed());
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = limiter(2.0, 100.0); // fast refill for the test

        assert!(limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 2.0).is_allowed());
        assert!(!limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 1.0).is_allowed());

        std::thread::sleep(Duration::from_millis(30)); // ~3 tokens at 100/s

        assert!(limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 1.0).is_allowed());
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let limiter = limiter(3.0, 1000.0);

        assert!(limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 3.0).is_allowed());
        std::thread::sleep(Duration::from_millis(50)); // would refill ~50 tokens

        // Only capacity (3) should be available
        assert!(limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 3.0).is_allowed());
        assert!(!limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 1.0).is_allowed());
    }

    #[test]
    fn test_prune_idle() {
        let params = BucketParams {
            capacity: 5.0,
            refill_per_sec: 1.0,
        };
        let limiter = RateLimiter::new(LimiterConfig {
            free: params,
            pro: params,
            enterprise: params,
            ip: params,
            idle_prune_ms: 0, // everything is instantly idle
        });

        limiter.try_acquire(tenant("t1"), TenantPlan::Pro, 1.0);
        limiter.try_acquire(tenant("t2"), TenantPlan::Pro, 1.0);
        assert_eq!(limiter.bucket_count(), 2);

        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(limiter.prune_idle(), 2);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_plan_tiers_differ() {
        let free = BucketParams {
            capacity: 1.0,
            refill_per_sec: 0.1,
        };
        let enterprise = BucketParams {
            capacity: 10.0,
            refill_per_sec: 5.0,
        };
        let limiter = RateLimiter::new(LimiterConfig {
            free,
            pro: free,
            enterprise,
            ip: enterprise,
            idle_prune_ms: 60_000,
        });

        assert!(limiter.try_acquire(tenant("small"), TenantPlan::Free, 1.0).is_allowed());
        assert!(!limiter.try_acquire(tenant("small"), TenantPlan::Free, 1.0).is_allowed());

        for _ in 0..10 {
            assert!(limiter
                .try_acquire(tenant("big"), TenantPlan::Enterprise, 1.0)
                .is_allowed());
        }
    }
}
