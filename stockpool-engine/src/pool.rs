//! Tiered pool membership.
//!
//! Each instrument is in exactly one state: unranked, basic, watch or core.
//! Every scoring run re-evaluates membership:
//!
//! 1. unranked -> basic when the score reaches the basic threshold
//! 2. basic -> watch, then watch -> core, when the score reaches the next
//!    threshold and the member has dwelt `min_dwell_days` in its tier
//! 3. demotion when the score falls below the tier threshold minus
//!    `demotion_margin`, once the member has dwelt `min_dwell_days`
//! 4. capacity: members ranked beyond a tier's capacity drop one tier.
//!    A member promoted into a full tier during the same run stays where
//!    it was instead, as if the promotion never happened.
//!
//! A degraded score freezes the member's tier for the run.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use stockpool_common::config::{CapacityConfig, ScoringConfig, ThresholdsConfig};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::data::TradingCalendar;
use crate::scoring::ScoreRecord;

// ============================================================================
// Tier
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Unranked,
    Basic,
    Watch,
    Core,
}

impl Tier {
    /// Tiers that hold members, lowest first.
    pub const POOLS: [Tier; 3] = [Tier::Basic, Tier::Watch, Tier::Core];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unranked => "unranked",
            Self::Basic => "basic",
            Self::Watch => "watch",
            Self::Core => "core",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unranked" => Some(Self::Unranked),
            "basic" => Some(Self::Basic),
            "watch" => Some(Self::Watch),
            "core" => Some(Self::Core),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Unranked => Some(Self::Basic),
            Self::Basic => Some(Self::Watch),
            Self::Watch => Some(Self::Core),
            Self::Core => None,
        }
    }

    pub fn lower(&self) -> Self {
        match self {
            Self::Unranked | Self::Basic => Self::Unranked,
            Self::Watch => Self::Basic,
            Self::Core => Self::Watch,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Pools
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMember {
    pub instrument: String,
    pub entered_at: NaiveDate,
    pub last_score: f64,
}

/// Members of one tier keyed by instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub tier: Tier,
    members: BTreeMap<String, PoolMember>,
}

impl Pool {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            members: BTreeMap::new(),
        }
    }

    pub fn from_members(tier: Tier, members: impl IntoIterator<Item = PoolMember>) -> Self {
        Self {
            tier,
            members: members
                .into_iter()
                .map(|m| (m.instrument.clone(), m))
                .collect(),
        }
    }

    pub fn get(&self, instrument: &str) -> Option<&PoolMember> {
        self.members.get(instrument)
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.members.contains_key(instrument)
    }

    pub fn members(&self) -> impl Iterator<Item = &PoolMember> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// All three pools. An instrument is in at most one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolBook {
    pools: BTreeMap<Tier, Pool>,
}

impl Default for PoolBook {
    fn default() -> Self {
        Self {
            pools: Tier::POOLS.iter().map(|t| (*t, Pool::new(*t))).collect(),
        }
    }
}

impl PoolBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored pools; an instrument listed in several tiers is
    /// kept in the highest one.
    pub fn from_pools(pools: impl IntoIterator<Item = Pool>) -> Self {
        let mut book = Self::new();
        let mut pools: Vec<Pool> = pools.into_iter().collect();
        pools.sort_by_key(|p| std::cmp::Reverse(p.tier));
        for pool in pools {
            for member in pool.members.into_values() {
                if book.tier_of(&member.instrument) == Tier::Unranked {
                    book.insert(pool.tier, member);
                }
            }
        }
        book
    }

    pub fn pool(&self, tier: Tier) -> Option<&Pool> {
        self.pools.get(&tier)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn tier_of(&self, instrument: &str) -> Tier {
        self.member(instrument)
            .map(|(tier, _)| tier)
            .unwrap_or(Tier::Unranked)
    }

    pub fn member(&self, instrument: &str) -> Option<(Tier, &PoolMember)> {
        self.pools
            .values()
            .find_map(|p| p.get(instrument).map(|m| (p.tier, m)))
    }

    pub fn len(&self) -> usize {
        self.pools.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, tier: Tier, member: PoolMember) {
        if let Some(pool) = self.pools.get_mut(&tier) {
            pool.members.insert(member.instrument.clone(), member);
        }
    }

    fn remove(&mut self, instrument: &str) -> Option<PoolMember> {
        self.pools
            .values_mut()
            .find_map(|p| p.members.remove(instrument))
    }

    fn set_score(&mut self, instrument: &str, score: f64) {
        for pool in self.pools.values_mut() {
            if let Some(member) = pool.members.get_mut(instrument) {
                member.last_score = score;
            }
        }
    }
}

// ============================================================================
// Transitions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Promotion,
    Demotion,
    Capacity,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promotion => "promotion",
            Self::Demotion => "demotion",
            Self::Capacity => "capacity",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "promotion" => Some(Self::Promotion),
            "demotion" => Some(Self::Demotion),
            "capacity" => Some(Self::Capacity),
            _ => None,
        }
    }
}

/// One membership change, as written to the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolTransition {
    pub instrument: String,
    pub from: Tier,
    pub to: Tier,
    pub score: f64,
    pub date: NaiveDate,
    pub reason: TransitionReason,
}

/// Storage failure for one instrument's membership. Other instruments are
/// unaffected.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Failed to persist pool membership for {instrument}: {reason}")]
pub struct PoolPersistenceError {
    pub instrument: String,
    pub reason: String,
}

// ============================================================================
// Pool Manager
// ============================================================================

/// Thresholds, hysteresis and capacities.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    pub thresholds: ThresholdsConfig,
    pub min_dwell_days: u32,
    pub demotion_margin: f64,
    pub capacity: CapacityConfig,
}

impl From<&ScoringConfig> for PoolPolicy {
    fn from(config: &ScoringConfig) -> Self {
        Self {
            thresholds: config.thresholds,
            min_dwell_days: config.min_dwell_days,
            demotion_margin: config.demotion_margin,
            capacity: config.capacity,
        }
    }
}

impl PoolPolicy {
    pub fn threshold(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Unranked => None,
            Tier::Basic => Some(self.thresholds.basic),
            Tier::Watch => Some(self.thresholds.watch),
            Tier::Core => Some(self.thresholds.core),
        }
    }

    pub fn capacity(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Unranked => None,
            Tier::Basic => Some(self.capacity.basic),
            Tier::Watch => Some(self.capacity.watch),
            Tier::Core => Some(self.capacity.core),
        }
    }

    /// Score still holds `tier` once in it.
    fn holds(&self, tier: Tier, score: f64) -> bool {
        self.threshold(tier)
            .map_or(true, |t| score >= t - self.demotion_margin)
    }
}

/// Member records as they were before each promotion of this run, keyed by
/// instrument and the tier it was promoted into.
type Promotions = HashMap<(String, Tier), Option<PoolMember>>;

/// Applies the membership state machine.
pub struct PoolManager {
    policy: PoolPolicy,
}

impl PoolManager {
    pub fn new(policy: PoolPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Re-evaluate membership for every scored instrument and enforce
    /// capacities. Returns the transitions in the order they were applied.
    pub fn evaluate(
        &self,
        book: &mut PoolBook,
        scores: &[ScoreRecord],
        calendar: &TradingCalendar,
        as_of: NaiveDate,
    ) -> Vec<PoolTransition> {
        let mut transitions = Vec::new();
        let mut promoted = Promotions::new();

        let mut ordered: Vec<&ScoreRecord> = scores.iter().collect();
        ordered.sort_by(|a, b| a.instrument.cmp(&b.instrument));

        for record in ordered {
            let current = book.tier_of(&record.instrument);
            if record.degraded {
                warn!(
                    instrument = %record.instrument,
                    tier = %current,
                    missing = ?record.missing_inputs,
                    "Degraded score, keeping current tier"
                );
                continue;
            }
            book.set_score(&record.instrument, record.composite_score);
            self.evaluate_one(book, record, calendar, as_of, &mut promoted, &mut transitions);
        }

        self.enforce_capacity(book, as_of, &promoted, &mut transitions);

        info!(
            as_of = %as_of,
            scored = scores.len(),
            transitions = transitions.len(),
            members = book.len(),
            "Pool evaluation complete"
        );
        transitions
    }

    /// Trading days the member has spent in its tier, when below the
    /// required dwell.
    fn short_dwell(
        &self,
        book: &PoolBook,
        instrument: &str,
        calendar: &TradingCalendar,
        as_of: NaiveDate,
    ) -> Option<usize> {
        let (_, member) = book.member(instrument)?;
        let dwelt = calendar.trading_days_between(member.entered_at, as_of);
        (dwelt < self.policy.min_dwell_days as usize).then_some(dwelt)
    }

    fn evaluate_one(
        &self,
        book: &mut PoolBook,
        record: &ScoreRecord,
        calendar: &TradingCalendar,
        as_of: NaiveDate,
        promoted: &mut Promotions,
        transitions: &mut Vec<PoolTransition>,
    ) {
        let score = record.composite_score;
        let mut tier = book.tier_of(&record.instrument);

        // Demotion to the highest lower tier the score still holds
        if !self.policy.holds(tier, score) {
            if let Some(dwelt) = self.short_dwell(book, &record.instrument, calendar, as_of) {
                debug!(
                    instrument = %record.instrument,
                    tier = %tier,
                    dwelt,
                    required = self.policy.min_dwell_days,
                    "Demotion held by dwell time"
                );
                return;
            }
            let mut target = tier.lower();
            while !self.policy.holds(target, score) {
                target = target.lower();
            }
            self.move_member(book, &record.instrument, tier, target, score, as_of, TransitionReason::Demotion, transitions);
            return;
        }

        while let Some(next) = tier.next() {
            let Some(threshold) = self.policy.threshold(next) else {
                break;
            };
            if score < threshold {
                break;
            }
            if let Some(dwelt) = self.short_dwell(book, &record.instrument, calendar, as_of) {
                debug!(
                    instrument = %record.instrument,
                    tier = %tier,
                    dwelt,
                    required = self.policy.min_dwell_days,
                    "Promotion held by dwell time"
                );
                break;
            }
            let prior = book.member(&record.instrument).map(|(_, m)| m.clone());
            self.move_member(book, &record.instrument, tier, next, score, as_of, TransitionReason::Promotion, transitions);
            promoted.insert((record.instrument.clone(), next), prior);
            tier = next;
        }
    }

    fn enforce_capacity(
        &self,
        book: &mut PoolBook,
        as_of: NaiveDate,
        promoted: &Promotions,
        transitions: &mut Vec<PoolTransition>,
    ) {
        // Highest tier first so overflow can cascade downwards
        for tier in Tier::POOLS.iter().rev() {
            let Some(capacity) = self.policy.capacity(*tier) else {
                continue;
            };
            let Some(pool) = book.pool(*tier) else {
                continue;
            };
            if pool.len() <= capacity {
                continue;
            }

            let mut ranked: Vec<(String, f64)> = pool
                .members()
                .map(|m| (m.instrument.clone(), m.last_score))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

            warn!(tier = %tier, capacity, members = ranked.len(), "Pool over capacity");
            for (instrument, score) in ranked.into_iter().skip(capacity) {
                if let Some(prior) = promoted.get(&(instrument.clone(), *tier)) {
                    self.undo_promotion(book, &instrument, *tier, prior.as_ref(), score, transitions);
                    continue;
                }
                self.move_member(book, &instrument, *tier, tier.lower(), score, as_of, TransitionReason::Capacity, transitions);
            }
        }
    }

    /// Put a member promoted this run back where it was before the promotion.
    fn undo_promotion(
        &self,
        book: &mut PoolBook,
        instrument: &str,
        tier: Tier,
        prior: Option<&PoolMember>,
        score: f64,
        transitions: &mut Vec<PoolTransition>,
    ) {
        book.remove(instrument);
        if let Some(prior) = prior {
            book.insert(
                tier.lower(),
                PoolMember {
                    last_score: score,
                    ..prior.clone()
                },
            );
        }
        transitions.retain(|t| {
            !(t.instrument == instrument
                && t.to == tier
                && t.reason == TransitionReason::Promotion)
        });
        info!(
            instrument,
            tier = %tier,
            kept = %tier.lower(),
            score,
            "Tier full, promotion not applied"
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn move_member(
        &self,
        book: &mut PoolBook,
        instrument: &str,
        from: Tier,
        to: Tier,
        score: f64,
        as_of: NaiveDate,
        reason: TransitionReason,
        transitions: &mut Vec<PoolTransition>,
    ) {
        book.remove(instrument);
        if to != Tier::Unranked {
            book.insert(
                to,
                PoolMember {
                    instrument: instrument.to_string(),
                    entered_at: as_of,
                    last_score: score,
                },
            );
        }

        info!(instrument, from = %from, to = %to, score, reason = reason.as_str(), "Pool transition");
        transitions.push(PoolTransition {
            instrument: instrument.to_string(),
            from,
            to,
            score,
            date: as_of,
            reason,
        });
    }
}
