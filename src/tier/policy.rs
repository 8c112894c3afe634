//! Pure tier-selection, promotion, and demotion policy functions (§4.7).

use crate::config::{DemotionPolicy, PromotionPolicy, Tier, TierConfig};

/// Size-based tier selection. Hot can never be disabled.
pub fn select_tier(size: u64, config: &TierConfig) -> Tier {
    if size <= config.hot_max_size {
        return Tier::Hot;
    }
    if size <= config.warm_max_size {
        return if config.warm_enabled { Tier::Warm } else { Tier::Hot };
    }
    if config.cold_enabled {
        Tier::Cold
    } else if config.warm_enabled {
        Tier::Warm
    } else {
        Tier::Hot
    }
}

/// In-memory per-path tracking consulted by the promotion/demotion
/// policies; owned by the tier map (§4.7).
#[derive(Debug, Clone)]
pub struct AccessState {
    pub size: u64,
    pub access_count: u64,
    pub last_access_ms: i64,
    pub recent_accesses: Vec<i64>,
}

/// Whether `current_tier` should be promoted given `state`, per the
/// configured [`PromotionPolicy`]. Never promotes from hot.
pub fn should_auto_promote(current_tier: Tier, state: &AccessState, config: &TierConfig, now_ms: i64) -> Option<Tier> {
    if current_tier == Tier::Hot {
        return None;
    }
    let target = match current_tier {
        Tier::Cold => Tier::Warm,
        Tier::Warm => Tier::Hot,
        Tier::Hot => unreachable!(),
    };
    if !target_enabled(target, config) {
        return None;
    }
    if !fits_target(state.size, target, config) {
        return None;
    }

    match config.promotion_policy {
        PromotionPolicy::None => None,
        PromotionPolicy::Aggressive => Some(target),
        PromotionPolicy::OnAccess => {
            let window_start = now_ms - config.promotion_window_ms;
            let recent = state.recent_accesses.iter().filter(|&&t| t >= window_start).count();
            if recent as u32 >= config.promotion_access_threshold {
                Some(target)
            } else {
                None
            }
        }
    }
}

/// Whether `current_tier` should be demoted given `age_ms` (time since last
/// access). Never demotes from cold; skips disabled intermediate tiers.
pub fn should_demote(current_tier: Tier, age_ms: i64, config: &TierConfig) -> Option<Tier> {
    if config.demotion_policy != DemotionPolicy::OnAge {
        return None;
    }
    let day_ms = 24 * 60 * 60 * 1000i64;
    match current_tier {
        Tier::Cold => None,
        Tier::Hot => {
            if age_ms >= config.hot_max_age_days as i64 * day_ms {
                Some(if config.warm_enabled { Tier::Warm } else { Tier::Cold })
            } else {
                None
            }
        }
        Tier::Warm => {
            if age_ms >= config.warm_max_age_days as i64 * day_ms {
                Some(Tier::Cold)
            } else {
                None
            }
        }
    }
}

fn target_enabled(tier: Tier, config: &TierConfig) -> bool {
    match tier {
        Tier::Hot => true,
        Tier::Warm => config.warm_enabled,
        Tier::Cold => config.cold_enabled,
    }
}

fn fits_target(size: u64, tier: Tier, config: &TierConfig) -> bool {
    match tier {
        Tier::Hot => size <= config.hot_max_size,
        Tier::Warm => size <= config.warm_max_size,
        Tier::Cold => true,
    }
}

/// Pushes `timestamp` onto `recent_accesses`, keeping at most
/// `max_recent_accesses` entries within `window_ms` (§4.7: "last 10
/// timestamps within the window").
pub fn push_recent_access(recent: &mut Vec<i64>, timestamp: i64, window_ms: i64, max_recent: usize) {
    recent.retain(|&t| timestamp - t <= window_ms);
    recent.push(timestamp);
    if recent.len() > max_recent {
        recent.remove(0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn selects_hot_at_or_below_threshold() {
        let config = TierConfig { hot_max_size: 100, warm_max_size: 1000, ..TierConfig::default() };
        assert_eq!(select_tier(0, &config), Tier::Hot);
        assert_eq!(select_tier(100, &config), Tier::Hot);
        assert_eq!(select_tier(101, &config), Tier::Warm);
        assert_eq!(select_tier(1001, &config), Tier::Cold);
    }

    #[test]
    fn falls_back_when_warm_disabled() {
        let config = TierConfig { hot_max_size: 100, warm_max_size: 1000, warm_enabled: false, ..TierConfig::default() };
        assert_eq!(select_tier(500, &config), Tier::Hot);
    }

    #[test]
    fn on_access_promotes_after_threshold() {
        let config = TierConfig {
            promotion_policy: PromotionPolicy::OnAccess,
            promotion_access_threshold: 3,
            promotion_window_ms: 60_000,
            warm_max_size: 1_000_000,
            ..TierConfig::default()
        };
        let mut state = AccessState { size: 1024, access_count: 0, last_access_ms: 0, recent_accesses: vec![] };
        push_recent_access(&mut state.recent_accesses, 0, 60_000, 10);
        push_recent_access(&mut state.recent_accesses, 100, 60_000, 10);
        assert!(should_auto_promote(Tier::Warm, &state, &config, 100).is_none());
        push_recent_access(&mut state.recent_accesses, 200, 60_000, 10);
        assert_eq!(should_auto_promote(Tier::Warm, &state, &config, 200), Some(Tier::Hot));
    }

    #[test]
    fn never_demotes_cold() {
        let config = TierConfig::default();
        assert!(should_demote(Tier::Cold, i64::MAX, &config).is_none());
    }
}
