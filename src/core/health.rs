//! Provider health tracking.
//!
//! One record per provider id, created lazily on first reference. Every
//! read-modify-write happens under a single lock, so concurrent failures
//! never under-count and a success never races a failure.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Health status of a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Recent failures; still eligible
    Degraded,
    /// Skipped until `cooldown_until`
    Unavailable,
}

/// Health record of one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    /// Unavailable providers are skipped until their cooldown elapses
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.cooldown_until) {
            (HealthStatus::Unavailable, Some(until)) => now >= until,
            _ => true,
        }
    }
}

/// When a provider is taken out of rotation, and for how long
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Consecutive failures that mark a provider unavailable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown applied when the threshold is first reached
    #[serde(default = "default_cooldown_base_ms")]
    pub cooldown_base_ms: u64,

    #[serde(default = "default_cooldown_max_ms")]
    pub cooldown_max_ms: u64,

    /// Growth of the cooldown for each failure past the threshold
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_base_ms() -> u64 {
    30_000
}
fn default_cooldown_max_ms() -> u64 {
    600_000
}
fn default_cooldown_multiplier() -> f64 {
    2.0
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_base_ms: default_cooldown_base_ms(),
            cooldown_max_ms: default_cooldown_max_ms(),
            cooldown_multiplier: default_cooldown_multiplier(),
        }
    }
}

impl HealthPolicy {
    /// Cooldown after `failures` consecutive failures (at or past the threshold)
    pub fn cooldown_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.failure_threshold);
        let millis = self.cooldown_base_ms as f64 * self.cooldown_multiplier.powi(exponent as i32);
        let capped = millis.min(self.cooldown_max_ms as f64) as i64;

        Duration::milliseconds(capped)
    }
}

/// Shared health state for all providers
#[derive(Debug, Default)]
pub struct HealthTracker {
    policy: HealthPolicy,
    records: Mutex<HashMap<String, ProviderHealth>>,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ProviderHealth>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current record (healthy if never referenced)
    pub fn get(&self, provider_id: &str) -> ProviderHealth {
        self.records()
            .get(provider_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_eligible(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        self.records()
            .get(provider_id)
            .map_or(true, |health| health.is_eligible(now))
    }

    /// Reset to healthy
    pub fn record_success(&self, provider_id: &str) -> ProviderHealth {
        let mut records = self.records();
        let health = records.entry(provider_id.to_string()).or_default();
        *health = ProviderHealth::default();
        health.clone()
    }

    /// Count a failure and return the updated record
    pub fn record_failure(&self, provider_id: &str, now: DateTime<Utc>) -> ProviderHealth {
        let mut records = self.records();
        let health = records.entry(provider_id.to_string()).or_default();

        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        if health.consecutive_failures >= self.policy.failure_threshold {
            health.status = HealthStatus::Unavailable;
            health.cooldown_until = Some(now + self.policy.cooldown_for(health.consecutive_failures));
        } else {
            health.status = HealthStatus::Degraded;
            health.cooldown_until = None;
        }

        health.clone()
    }

    /// Copy of every record, sorted by provider id
    pub fn snapshot(&self) -> Vec<(String, ProviderHealth)> {
        let mut entries: Vec<_> = self
            .records()
            .iter()
            .map(|(id, health)| (id.clone(), health.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
