//! What one tap is worth.
//!
//! Reading the multiplier is pure: [`MultiplierResolver::current_multiplier`] takes `now` and never mutates,
//! so an expired luck bonus simply stops counting. Rolling a new bonus is a separate, explicit,
//! timestamped mutation.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

pub const DEFAULT_PARTY_MULTIPLIER: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MultiplierSource {
    PartyRoom {
        multiplier: u32,
        room_id: String,
    },
    LuckBonus {
        multiplier: u32,
        expires_at: DateTime<Utc>,
    },
}

impl MultiplierSource {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self {
            MultiplierSource::PartyRoom { .. } => true,
            MultiplierSource::LuckBonus { expires_at, .. } => *expires_at > now,
        }
    }

    fn multiplier(&self) -> u32 {
        match self {
            MultiplierSource::PartyRoom { multiplier, .. }
            | MultiplierSource::LuckBonus { multiplier, .. } => (*multiplier).max(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LuckConfig {
    /// Minimum time between rolls. The first roll also waits this long into the session.
    #[serde(with = "tally::duration_ms")]
    pub roll_every: Duration,
    #[serde(with = "tally::duration_ms")]
    pub bonus_duration: Duration,
}

impl Default for LuckConfig {
    fn default() -> Self {
        Self {
            roll_every: Duration::from_secs(15 * 60),
            bonus_duration: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LuckRoll {
    pub multiplier: u32,
    pub rolled_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Cumulative odds: 2x 40%, 3x 25%, 4x 15%, 5x 10%, 6x 5%, 7x 3%, 8x 1.5%, 9x 0.4%, 10x 0.1%.
const LUCK_TABLE: [(f64, u32); 8] = [
    (0.4, 2),
    (0.65, 3),
    (0.8, 4),
    (0.9, 5),
    (0.95, 6),
    (0.98, 7),
    (0.995, 8),
    (0.999, 9),
];

/// Maps a uniform sample in `[0, 1)` to a luck multiplier.
pub fn luck_value(sample: f64) -> u32 {
    LUCK_TABLE
        .iter()
        .find(|(threshold, _)| sample < *threshold)
        .map_or(10, |(_, value)| *value)
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn to_std(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or_default()
}

fn add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Clone, Debug)]
pub struct MultiplierResolver {
    luck: LuckConfig,
    session_started_at: DateTime<Utc>,
    sources: Vec<MultiplierSource>,
    last_roll: Option<LuckRoll>,
}

impl MultiplierResolver {
    pub fn new(luck: LuckConfig, session_started_at: DateTime<Utc>) -> Self {
        Self {
            luck,
            session_started_at,
            sources: Vec::new(),
            last_roll: None,
        }
    }

    /// Product of every source active at `now`, never less than 1.
    pub fn current_multiplier(&self, now: DateTime<Utc>) -> u64 {
        self.sources
            .iter()
            .filter(|source| source.is_active(now))
            .fold(1u64, |product, source| {
                product.saturating_mul(u64::from(source.multiplier()))
            })
    }

    pub fn sources(&self) -> &[MultiplierSource] {
        &self.sources
    }

    /// Forget luck bonuses that have run out. Purely housekeeping: expired bonuses already
    /// don't count.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) {
        self.sources.retain(|source| source.is_active(now));
    }

    /// Leaves whatever room we were in first.
    pub fn join_party(&mut self, room_id: impl Into<String>, multiplier: u32, now: DateTime<Utc>) {
        let room_id = room_id.into();
        self.prune_expired(now);
        self.remove_party();
        log::info!("Joined party room {room_id} with a {multiplier}x multiplier");
        self.sources.push(MultiplierSource::PartyRoom {
            multiplier: multiplier.max(1),
            room_id,
        });
    }

    pub fn leave_party(&mut self) -> Option<String> {
        let room_id = self.remove_party();
        if let Some(room_id) = &room_id {
            log::info!("Left party room {room_id}");
        }
        room_id
    }

    pub fn party(&self) -> Option<(&str, u32)> {
        self.sources.iter().find_map(|source| match source {
            MultiplierSource::PartyRoom {
                multiplier,
                room_id,
            } => Some((room_id.as_str(), *multiplier)),
            MultiplierSource::LuckBonus { .. } => None,
        })
    }

    /// Replaces any current luck bonus.
    pub fn grant_luck(&mut self, multiplier: u32, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.prune_expired(now);
        self.sources
            .retain(|source| !matches!(source, MultiplierSource::LuckBonus { .. }));
        self.sources.push(MultiplierSource::LuckBonus {
            multiplier: multiplier.max(1),
            expires_at,
        });
    }

    pub fn can_roll(&self, now: DateTime<Utc>) -> bool {
        self.time_to_next_roll(now).is_zero()
    }

    /// Zero when a roll is allowed right now.
    pub fn time_to_next_roll(&self, now: DateTime<Utc>) -> Duration {
        let last = self
            .last_roll
            .map_or(self.session_started_at, |roll| roll.rolled_at);
        let since_session = to_std(now - self.session_started_at);
        let since_last = to_std(now - last);
        let roll_every = self.luck.roll_every;
        roll_every
            .saturating_sub(since_session)
            .max(roll_every.saturating_sub(since_last))
    }

    /// Roll for a luck bonus if one is due at `now`. Rolling again at the same `now` does nothing.
    pub fn roll_luck(&mut self, now: DateTime<Utc>, rng: &mut impl Rng) -> Option<LuckRoll> {
        if self.last_roll.is_some_and(|roll| roll.rolled_at >= now) || !self.can_roll(now) {
            return None;
        }

        let multiplier = luck_value(rng.random::<f64>());
        let roll = LuckRoll {
            multiplier,
            rolled_at: now,
            expires_at: add(now, self.luck.bonus_duration),
        };
        log::info!(
            "Rolled a {multiplier}x luck bonus, good until {}",
            roll.expires_at
        );
        self.grant_luck(roll.multiplier, roll.expires_at, now);
        self.last_roll = Some(roll);
        Some(roll)
    }

    pub fn last_roll(&self) -> Option<LuckRoll> {
        self.last_roll
    }

    /// How long the current luck bonus has left, zero if there is none.
    pub fn luck_time_remaining(&self, now: DateTime<Utc>) -> Duration {
        self.sources
            .iter()
            .filter_map(|source| match source {
                MultiplierSource::LuckBonus { expires_at, .. } => Some(to_std(*expires_at - now)),
                MultiplierSource::PartyRoom { .. } => None,
            })
            .max()
            .unwrap_or_default()
    }

    fn remove_party(&mut self) -> Option<String> {
        let index = self
            .sources
            .iter()
            .position(|source| matches!(source, MultiplierSource::PartyRoom { .. }))?;
        match self.sources.remove(index) {
            MultiplierSource::PartyRoom { room_id, .. } => Some(room_id),
            MultiplierSource::LuckBonus { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
    }

    fn resolver() -> MultiplierResolver {
        MultiplierResolver::new(LuckConfig::default(), at(0))
    }

    #[test]
    fn no_sources_is_one() {
        assert_eq!(resolver().current_multiplier(at(0)), 1);
    }

    #[test]
    fn party_and_luck_multiply() {
        let mut resolver = resolver();
        resolver.join_party("room-1", 2, at(0));
        resolver.grant_luck(3, at(300), at(0));

        assert_eq!(resolver.current_multiplier(at(10)), 6);
    }

    #[test]
    fn reading_twice_gives_the_same_answer() {
        let mut resolver = resolver();
        resolver.join_party("room-1", 2, at(0));
        resolver.grant_luck(4, at(100), at(0));

        for now in [at(50), at(100), at(150)] {
            let before = resolver.sources().to_vec();
            let first = resolver.current_multiplier(now);
            let second = resolver.current_multiplier(now);
            assert_eq!(first, second);
            assert_eq!(resolver.sources(), before.as_slice());
        }
    }

    #[test]
    fn luck_lapses_without_anyone_touching_it() {
        let mut resolver = resolver();
        resolver.join_party("room-1", 2, at(0));
        resolver.grant_luck(3, at(300), at(0));

        assert_eq!(resolver.current_multiplier(at(299)), 6);
        // Gone exactly at `expires_at`.
        assert_eq!(resolver.current_multiplier(at(300)), 2);
        assert_eq!(resolver.luck_time_remaining(at(300)), Duration::ZERO);
        assert_eq!(resolver.luck_time_remaining(at(240)), Duration::from_secs(60));

        resolver.prune_expired(at(301));
        assert_eq!(resolver.sources().len(), 1);
    }

    #[test]
    fn one_party_at_a_time() {
        let mut resolver = resolver();
        resolver.join_party("room-1", 2, at(0));
        resolver.join_party("room-2", 5, at(1));

        assert_eq!(resolver.party(), Some(("room-2", 5)));
        assert_eq!(resolver.current_multiplier(at(2)), 5);
        assert_eq!(resolver.leave_party(), Some("room-2".to_string()));
        assert_eq!(resolver.leave_party(), None);
        assert_eq!(resolver.current_multiplier(at(3)), 1);
    }

    #[test]
    fn zero_multipliers_are_treated_as_one() {
        let mut resolver = resolver();
        resolver.join_party("room-1", 0, at(0));
        assert_eq!(resolver.current_multiplier(at(0)), 1);
    }

    #[test]
    fn rolls_wait_fifteen_minutes_between_each_other() {
        let mut resolver = resolver();
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        assert_eq!(resolver.time_to_next_roll(at(60)), Duration::from_secs(14 * 60));
        assert_eq!(resolver.roll_luck(at(60), &mut rng), None);

        let roll = resolver
            .roll_luck(at(15 * 60), &mut rng)
            .expect("first roll is due after fifteen minutes");
        assert!((2..=10).contains(&roll.multiplier));
        assert_eq!(roll.expires_at, at(20 * 60));
        assert_eq!(
            resolver.current_multiplier(at(16 * 60)),
            u64::from(roll.multiplier)
        );

        // Same timestamp again: nothing changes.
        assert_eq!(resolver.roll_luck(at(15 * 60), &mut rng), None);
        assert_eq!(resolver.last_roll(), Some(roll));

        assert_eq!(resolver.time_to_next_roll(at(25 * 60)), Duration::from_secs(5 * 60));
        assert!(resolver.can_roll(at(30 * 60)));
    }

    #[test]
    fn luck_table_boundaries() {
        assert_eq!(luck_value(0.0), 2);
        assert_eq!(luck_value(0.3999), 2);
        assert_eq!(luck_value(0.4), 3);
        assert_eq!(luck_value(0.8), 5);
        assert_eq!(luck_value(0.9949), 8);
        assert_eq!(luck_value(0.9989), 9);
        assert_eq!(luck_value(0.999), 10);
    }

    #[test]
    fn luck_distribution_roughly_matches_the_odds() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut counts = [0u32; 11];
        for _ in 0..20_000 {
            counts[luck_value(rng.random::<f64>()) as usize] += 1;
        }
        let share = |value: usize| f64::from(counts[value]) / 20_000.0;

        assert!((share(2) - 0.40).abs() < 0.02);
        assert!((share(3) - 0.25).abs() < 0.02);
        assert!((share(4) - 0.15).abs() < 0.02);
        assert_eq!(counts[0] + counts[1], 0);
    }
}
