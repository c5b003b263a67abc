//! Tier selection and the activation/progression decision.
//!
//! Both functions are pure: the same inputs always produce the same output.

use crate::{
    config::Tier,
    model::{Direction, Snapshot},
    state::TickerState,
};

/// Select the highest tier newly crossed by `max_change`.
///
/// A tier qualifies when its threshold is above `last_level` and `max_change` reaches it.
/// Tiers with a non-positive level are ignored. Crossing several tiers in one tick selects the
/// highest of them.
pub fn select_tier(max_change: f64, last_level: f64, tiers: &[Tier]) -> Option<&Tier> {
    tiers
        .iter()
        .filter(|tier| tier.level > 0.0)
        .filter(|tier| tier.threshold() > last_level && max_change >= tier.threshold())
        .max_by(|a, b| a.level.total_cmp(&b.level))
}

/// Outcome of evaluating one snapshot against a symbol's state.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    None,
    NewTrigger(Trigger),
    Progression(Trigger),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub tier: Tier,
    pub direction: Direction,
    /// Reference snapshot the move was measured against.
    pub reference: Snapshot,
    pub max_change: f64,
}

/// Decide whether `snapshot` opens a new episode, progresses the open one, or does nothing.
///
/// The direction of a new episode is derived here once. A progression keeps the open
/// episode's direction, and a move in the opposite direction never progresses it.
pub fn evaluate(tiers: &[Tier], state: &TickerState, snapshot: &Snapshot) -> Decision {
    let reference = &state.window_start_ref;
    let Some(max_change) = snapshot.max_change_from(reference) else {
        return Decision::None;
    };
    let Some(tier) = select_tier(max_change, state.last_triggered_level, tiers) else {
        return Decision::None;
    };

    let direction = Direction::of_move(snapshot.last_price, reference.last_price);
    let trigger = |direction| Trigger {
        tier: tier.clone(),
        direction,
        reference: reference.clone(),
        max_change,
    };

    match &state.episode {
        None => Decision::NewTrigger(trigger(direction)),
        Some(episode) => {
            let last_level = (state.last_triggered_level * 100.0).round() as u32;
            if episode.direction == direction && tier.level_percent() > last_level {
                Decision::Progression(trigger(episode.direction))
            } else {
                Decision::None
            }
        }
    }
}
