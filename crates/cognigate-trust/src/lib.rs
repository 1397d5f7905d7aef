//! Cognigate Trust - quantified trust with decay.
//!
//! The scoring function is pure and deterministic so that any decision can
//! be replayed from its recorded inputs. Stored scores are only mutated
//! through the entity store, which gives each entity an exclusive critical
//! section per update.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use cognigate_types::{
    Entity, EntityId, EntityStatus, RiskLevel, TrustSnapshot, TrustTier, TRUST_SCORE_MAX,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Half-life of an idle entity's score, in days.
pub const HALF_LIFE_DAYS: f64 = 7.0;

/// Negative deltas are amplified by this factor before being applied.
/// Trust is slow to earn and fast to lose.
pub const FAILURE_MULTIPLIER: i64 = 3;

/// A scored action outcome. Base deltas are signed; negative ones are
/// amplified by [`FAILURE_MULTIPLIER`] inside [`score`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustSignal {
    Success(RiskLevel),
    Failure(RiskLevel),
    EscalationAppropriate,
    EscalationUnnecessary,
    ViolationMinor,
    ViolationMajor,
    ViolationSevere,
}

impl TrustSignal {
    /// Base delta before failure amplification.
    pub fn base_delta(&self) -> i64 {
        match self {
            TrustSignal::Success(RiskLevel::Low) => 5,
            TrustSignal::Success(RiskLevel::Medium) => 10,
            TrustSignal::Success(RiskLevel::High) => 20,
            TrustSignal::Success(RiskLevel::Critical) => 40,
            TrustSignal::Failure(RiskLevel::Low) => -10,
            TrustSignal::Failure(RiskLevel::Medium) => -30,
            TrustSignal::Failure(RiskLevel::High) => -60,
            TrustSignal::Failure(RiskLevel::Critical) => -120,
            TrustSignal::EscalationAppropriate => 5,
            TrustSignal::EscalationUnnecessary => -15,
            TrustSignal::ViolationMinor => -50,
            TrustSignal::ViolationMajor => -100,
            TrustSignal::ViolationSevere => -200,
        }
    }
}

/// Compute a new trust score: exponential decay over the idle window,
/// then the (possibly amplified) signal delta, clamped to [0, 1000].
///
/// Pure and deterministic: identical inputs always produce identical
/// outputs.
pub fn score(current: u32, idle_days: f64, signal: Option<TrustSignal>) -> u32 {
    let decayed = decay(current, idle_days);
    let delta = match signal {
        Some(s) => {
            let base = s.base_delta();
            if base < 0 {
                base * FAILURE_MULTIPLIER
            } else {
                base
            }
        }
        None => 0,
    };
    (decayed as i64 + delta).clamp(0, TRUST_SCORE_MAX as i64) as u32
}

/// Exponential decay with a 7-day half-life. Monotonic in `idle_days`.
pub fn decay(current: u32, idle_days: f64) -> u32 {
    if idle_days <= 0.0 {
        return current.min(TRUST_SCORE_MAX);
    }
    let factor = 0.5_f64.powf(idle_days / HALF_LIFE_DAYS);
    ((current.min(TRUST_SCORE_MAX) as f64) * factor).round() as u32
}

/// Tier for a score. Always recomputed, never cached apart from the score.
pub fn tier(score: u32) -> TrustTier {
    TrustTier::from_score(score)
}

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("entity suspended: {0}")]
    EntitySuspended(EntityId),

    #[error("entity already registered: {0}")]
    AlreadyRegistered(EntityId),

    /// Transient scoring failure; callers retry with backoff.
    #[error("trust calculation failed: {0}")]
    CalculationFailed(String),
}

impl TrustError {
    pub fn error_code(&self) -> &'static str {
        match self {
            TrustError::EntityNotFound(_) => "E1003",
            TrustError::EntitySuspended(_) => "E1002",
            TrustError::AlreadyRegistered(_) => "E1004",
            TrustError::CalculationFailed(_) => "E1005",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TrustError::CalculationFailed(_))
    }
}

/// Concurrent entity store. Each mutation runs under the entry's
/// exclusive shard lock, so score updates never lose a write.
pub struct EntityStore {
    entities: DashMap<EntityId, Entity>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
        }
    }

    pub fn register(&self, entity: Entity) -> Result<(), TrustError> {
        match self.entities.entry(entity.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TrustError::AlreadyRegistered(entity.id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entity);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &EntityId) -> Result<Entity, TrustError> {
        self.entities
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| TrustError::EntityNotFound(id.clone()))
    }

    /// Suspend an entity. Entities are never deleted.
    pub fn suspend(&self, id: &EntityId) -> Result<(), TrustError> {
        let mut entry = self
            .entities
            .get_mut(id)
            .ok_or_else(|| TrustError::EntityNotFound(id.clone()))?;
        entry.status = EntityStatus::Suspended;
        Ok(())
    }

    pub fn reinstate(&self, id: &EntityId) -> Result<(), TrustError> {
        let mut entry = self
            .entities
            .get_mut(id)
            .ok_or_else(|| TrustError::EntityNotFound(id.clone()))?;
        entry.status = EntityStatus::Active;
        Ok(())
    }

    pub fn set_grants(
        &self,
        id: &EntityId,
        grants: Vec<String>,
        denies: Vec<String>,
    ) -> Result<(), TrustError> {
        let mut entry = self
            .entities
            .get_mut(id)
            .ok_or_else(|| TrustError::EntityNotFound(id.clone()))?;
        entry.explicit_grants = grants;
        entry.explicit_denies = denies;
        Ok(())
    }

    /// Apply a scored outcome: decay over the idle window since the last
    /// action, add the signal delta, store the clamped result. The whole
    /// read-modify-write runs under the entity's exclusive lock.
    pub fn apply_signal(
        &self,
        id: &EntityId,
        signal: TrustSignal,
        now: DateTime<Utc>,
    ) -> Result<TrustSnapshot, TrustError> {
        let mut entry = self
            .entities
            .get_mut(id)
            .ok_or_else(|| TrustError::EntityNotFound(id.clone()))?;
        if entry.status == EntityStatus::Suspended {
            return Err(TrustError::EntitySuspended(id.clone()));
        }
        let idle_days = idle_days_between(entry.last_action_at, now);
        let new_score = score(entry.trust_score, idle_days, Some(signal));
        debug!(
            entity_id = %id,
            old_score = entry.trust_score,
            new_score,
            signal = ?signal,
            "Applied trust signal"
        );
        entry.trust_score = new_score;
        entry.last_action_at = now;
        Ok(TrustSnapshot::from_score(new_score))
    }

    /// Current decayed snapshot without mutating stored state.
    pub fn snapshot(&self, id: &EntityId, now: DateTime<Utc>) -> Result<TrustSnapshot, TrustError> {
        let entry = self
            .entities
            .get(id)
            .ok_or_else(|| TrustError::EntityNotFound(id.clone()))?;
        let idle_days = idle_days_between(entry.last_action_at, now);
        Ok(TrustSnapshot::from_score(decay(entry.trust_score, idle_days)))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

fn idle_days_between(last: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - last).num_seconds();
    if secs <= 0 {
        0.0
    } else {
        secs as f64 / 86_400.0
    }
}

/// Pluggable score source for the decision engine. The local default
/// reads the entity store through a bounded-TTL cache; remote
/// deployments supply their own implementation.
pub trait TrustProvider: Send + Sync {
    fn get_score(&self, entity_id: &EntityId) -> Result<TrustSnapshot, TrustError>;
}

/// Bounded-TTL read cache for trust snapshots. A stale score within the
/// TTL window is an accepted, explicitly bounded tradeoff; writes to the
/// store invalidate the entry.
pub struct ScoreCache {
    entries: DashMap<EntityId, (TrustSnapshot, Instant)>,
    ttl: Duration,
}

impl ScoreCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<TrustSnapshot> {
        let entry = self.entries.get(id)?;
        let (snapshot, inserted) = *entry;
        if inserted.elapsed() <= self.ttl {
            Some(snapshot)
        } else {
            drop(entry);
            self.entries.remove(id);
            None
        }
    }

    pub fn put(&self, id: EntityId, snapshot: TrustSnapshot) {
        self.entries.insert(id, (snapshot, Instant::now()));
    }

    pub fn invalidate(&self, id: &EntityId) {
        self.entries.remove(id);
    }
}

/// In-memory `TrustProvider` over the entity store, fronted by the
/// score cache.
pub struct LocalTrustProvider {
    store: std::sync::Arc<EntityStore>,
    cache: ScoreCache,
}

impl LocalTrustProvider {
    pub fn new(store: std::sync::Arc<EntityStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: ScoreCache::new(cache_ttl),
        }
    }

    pub fn invalidate(&self, id: &EntityId) {
        self.cache.invalidate(id);
    }
}

impl TrustProvider for LocalTrustProvider {
    fn get_score(&self, entity_id: &EntityId) -> Result<TrustSnapshot, TrustError> {
        if let Some(snapshot) = self.cache.get(entity_id) {
            return Ok(snapshot);
        }
        let snapshot = self.store.snapshot(entity_id, Utc::now())?;
        self.cache.put(entity_id.clone(), snapshot);
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    #[test]
    fn seven_idle_days_halve_the_score() {
        assert_eq!(score(500, 7.0, None), 250);
        assert_eq!(score(1000, 14.0, None), 250);
    }

    #[test]
    fn success_high_risk_adds_twenty() {
        let new = score(250, 0.0, Some(TrustSignal::Success(RiskLevel::High)));
        assert_eq!(new, 270);
        assert_eq!(tier(new), TrustTier::Probation);
    }

    #[test]
    fn failure_high_risk_is_amplified_and_clamped() {
        // -60 * 3 = -180, clamped at zero from 100
        assert_eq!(score(100, 0.0, Some(TrustSignal::Failure(RiskLevel::High))), 0);
    }

    #[test]
    fn positive_deltas_are_not_amplified() {
        assert_eq!(score(500, 0.0, Some(TrustSignal::Success(RiskLevel::Critical))), 540);
    }

    #[test]
    fn violations_hit_hard() {
        // -200 * 3 = -600
        assert_eq!(score(1000, 0.0, Some(TrustSignal::ViolationSevere)), 400);
    }

    #[test]
    fn store_applies_signal_atomically_per_entity() {
        let store = EntityStore::new();
        let id = EntityId::new("agent-1");
        let now = Utc::now();
        store.register(Entity::new(id.clone(), 500, now)).unwrap();

        let snap = store
            .apply_signal(&id, TrustSignal::Success(RiskLevel::Medium), now)
            .unwrap();
        assert_eq!(snap.score, 510);
        assert_eq!(store.get(&id).unwrap().trust_score, 510);
    }

    #[test]
    fn store_decays_across_the_idle_window() {
        let store = EntityStore::new();
        let id = EntityId::new("agent-2");
        let start = Utc::now();
        store.register(Entity::new(id.clone(), 500, start)).unwrap();

        let later = start + ChronoDuration::days(7);
        let snap = store.snapshot(&id, later).unwrap();
        assert_eq!(snap.score, 250);
        // Snapshot reads never mutate stored state.
        assert_eq!(store.get(&id).unwrap().trust_score, 500);
    }

    #[test]
    fn suspended_entities_reject_signals() {
        let store = EntityStore::new();
        let id = EntityId::new("agent-3");
        let now = Utc::now();
        store.register(Entity::new(id.clone(), 400, now)).unwrap();
        store.suspend(&id).unwrap();

        let err = store
            .apply_signal(&id, TrustSignal::Success(RiskLevel::Low), now)
            .unwrap_err();
        assert!(matches!(err, TrustError::EntitySuspended(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let store = EntityStore::new();
        let id = EntityId::new("agent-4");
        let now = Utc::now();
        store.register(Entity::new(id.clone(), 100, now)).unwrap();
        assert!(matches!(
            store.register(Entity::new(id, 100, now)),
            Err(TrustError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn cache_expires_after_ttl() {
        let cache = ScoreCache::new(Duration::from_millis(0));
        let id = EntityId::new("agent-5");
        cache.put(id.clone(), TrustSnapshot::from_score(400));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&id).is_none());
    }

    proptest! {
        #[test]
        fn score_stays_in_bounds(
            current in 0u32..=1000,
            idle in 0.0f64..365.0,
            delta_idx in 0usize..13,
        ) {
            let signals = [
                TrustSignal::Success(RiskLevel::Low),
                TrustSignal::Success(RiskLevel::Medium),
                TrustSignal::Success(RiskLevel::High),
                TrustSignal::Success(RiskLevel::Critical),
                TrustSignal::Failure(RiskLevel::Low),
                TrustSignal::Failure(RiskLevel::Medium),
                TrustSignal::Failure(RiskLevel::High),
                TrustSignal::Failure(RiskLevel::Critical),
                TrustSignal::EscalationAppropriate,
                TrustSignal::EscalationUnnecessary,
                TrustSignal::ViolationMinor,
                TrustSignal::ViolationMajor,
                TrustSignal::ViolationSevere,
            ];
            let new = score(current, idle, Some(signals[delta_idx]));
            prop_assert!(new <= 1000);
        }

        #[test]
        fn decay_is_monotonic(current in 0u32..=1000, t1 in 0.0f64..100.0, dt in 0.0f64..100.0) {
            prop_assert!(decay(current, t1 + dt) <= decay(current, t1));
        }
    }
}
