//! Abilities for the power-up game mode.
//!
//! Each player picks one active ability (triggered by hand, once per round)
//! and one passive ability (always on) before the round starts. None of
//! these change the actual target or bounds used for checking guesses.

use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::PowerError;
use crate::types::{Effect, RoundConfig};

pub const GLITCH_DURATION: Duration = Duration::from_millis(5000);
pub const FREEZE_DURATION: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivePower {
    /// Cuts about a quarter of the visible range off the side farther from
    /// the target.
    BinaryScan,
    /// Scrambles the opponent's display for a while.
    Glitch,
    /// Blocks the opponent's input for a while.
    Freeze,
    /// Next submission may carry two comma-separated guesses.
    DoubleShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassivePower {
    /// Immune to Glitch and Freeze.
    Firewall,
    /// Reports how close the last guess was.
    Thermal,
    /// Every fourth guess is not scored.
    Overclock,
}

impl FromStr for ActivePower {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scan" | "binary-scan" => Ok(Self::BinaryScan),
            "glitch" => Ok(Self::Glitch),
            "freeze" => Ok(Self::Freeze),
            "double" | "double-shot" => Ok(Self::DoubleShot),
            other => Err(format!("unknown active ability: {}", other)),
        }
    }
}

impl FromStr for PassivePower {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "firewall" => Ok(Self::Firewall),
            "thermal" => Ok(Self::Thermal),
            "overclock" => Ok(Self::Overclock),
            other => Err(format!("unknown passive ability: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loadout {
    pub active: ActivePower,
    pub passive: PassivePower,
}

/// Bounds shown to the player. Starts equal to the round's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleRange {
    pub min: i32,
    pub max: i32,
}

/// Shrinks `visible` on the side farther from `target`.
///
/// The cut is a quarter of the span (at least one), clamped so that the
/// target stays strictly inside the new bounds.
pub fn binary_scan(visible: VisibleRange, target: i32) -> Result<VisibleRange, PowerError> {
    let below = target - visible.min;
    let above = visible.max - target;
    let cut = ((visible.max - visible.min) / 4).max(1);

    if below > above {
        let step = cut.min(below - 1);
        if step < 1 {
            return Err(PowerError::RangeTooNarrow);
        }
        Ok(VisibleRange {
            min: visible.min + step,
            max: visible.max,
        })
    } else {
        let step = cut.min(above - 1);
        if step < 1 {
            return Err(PowerError::RangeTooNarrow);
        }
        Ok(VisibleRange {
            min: visible.min,
            max: visible.max - step,
        })
    }
}

/// Proximity bucket for the thermal passive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heat {
    Burning,
    Hot,
    Warm,
    Cold,
}

/// Buckets the distance between `value` and `target` as a share of the
/// round's full range, not the visible one.
pub fn heat(value: i32, config: &RoundConfig) -> Heat {
    // Any i32 can be typed in, so distances are taken in i64.
    let span = (i64::from(config.max_range) - i64::from(config.min_range)).max(1) as f64;
    let share = (i64::from(value) - i64::from(config.target_number)).abs() as f64 / span;
    if share < 0.05 {
        Heat::Burning
    } else if share < 0.15 {
        Heat::Hot
    } else if share < 0.30 {
        Heat::Warm
    } else {
        Heat::Cold
    }
}

/// What triggering the active ability produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Narrowed(VisibleRange),
    /// Must be sent to the opponent.
    Inflict { effect: Effect, duration: Duration },
    DoubleShotArmed,
}

/// Per-round ability bookkeeping for one player.
#[derive(Debug, Clone)]
pub struct PowerState {
    loadout: Loadout,
    active_used: bool,
    double_shot_armed: bool,
    visible: VisibleRange,
    glitched_until: Option<Instant>,
    frozen_until: Option<Instant>,
}

impl PowerState {
    pub fn new(loadout: Loadout, config: &RoundConfig) -> Self {
        Self {
            loadout,
            active_used: false,
            double_shot_armed: false,
            visible: VisibleRange {
                min: config.min_range,
                max: config.max_range,
            },
            glitched_until: None,
            frozen_until: None,
        }
    }

    pub fn loadout(&self) -> Loadout {
        self.loadout
    }

    pub fn overclock(&self) -> bool {
        self.loadout.passive == PassivePower::Overclock
    }

    pub fn thermal(&self) -> bool {
        self.loadout.passive == PassivePower::Thermal
    }

    /// Triggers the active ability. It is only consumed on success.
    pub fn activate(&mut self, target: i32) -> Result<Activation, PowerError> {
        if self.active_used {
            return Err(PowerError::AlreadyUsed);
        }
        let activation = match self.loadout.active {
            ActivePower::BinaryScan => {
                self.visible = binary_scan(self.visible, target)?;
                Activation::Narrowed(self.visible)
            }
            ActivePower::Glitch => Activation::Inflict {
                effect: Effect::Glitch,
                duration: GLITCH_DURATION,
            },
            ActivePower::Freeze => Activation::Inflict {
                effect: Effect::Freeze,
                duration: FREEZE_DURATION,
            },
            ActivePower::DoubleShot => {
                self.double_shot_armed = true;
                Activation::DoubleShotArmed
            }
        };
        self.active_used = true;
        Ok(activation)
    }

    pub fn double_shot_armed(&self) -> bool {
        self.double_shot_armed
    }

    /// Disarms and reports a pending double shot.
    pub fn take_double_shot(&mut self) -> bool {
        std::mem::take(&mut self.double_shot_armed)
    }

    /// Applies an opponent's effect. Returns false when the firewall blocked it.
    pub fn receive(&mut self, effect: Effect, duration: Duration, now: Instant) -> bool {
        if self.loadout.passive == PassivePower::Firewall {
            return false;
        }
        let until = Some(now + duration);
        match effect {
            Effect::Glitch => self.glitched_until = until,
            Effect::Freeze => self.frozen_until = until,
        }
        true
    }

    pub fn is_frozen(&self, now: Instant) -> bool {
        self.frozen_until.is_some_and(|t| now < t)
    }

    pub fn is_glitched(&self, now: Instant) -> bool {
        self.glitched_until.is_some_and(|t| now < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GameMode, RoomCode};

    fn config(min: i32, max: i32, target: i32) -> RoundConfig {
        RoundConfig {
            min_range: min,
            max_range: max,
            target_number: target,
            room_id: RoomCode::parse("AB3XZ").unwrap(),
            host_name: "ANA".into(),
            host_avatar: "🐸".into(),
            joiner_name: "BOB".into(),
            joiner_avatar: "🐱".into(),
            game_mode: GameMode::PowerUps,
        }
    }

    #[test]
    fn scan_cuts_farther_side() {
        let visible = VisibleRange { min: 5, max: 100 };
        // Target near the top: the low side is cut.
        let narrowed = binary_scan(visible, 90).unwrap();
        assert_eq!(narrowed, VisibleRange { min: 28, max: 100 });
        // Target near the bottom: the high side is cut.
        let narrowed = binary_scan(visible, 10).unwrap();
        assert_eq!(narrowed, VisibleRange { min: 5, max: 77 });
    }

    #[test]
    fn scan_keeps_target_strictly_inside() {
        for target in 6..100 {
            let mut visible = VisibleRange { min: 5, max: 100 };
            while let Ok(next) = binary_scan(visible, target) {
                let before = visible.max - visible.min;
                assert!(next.max - next.min < before);
                assert!(next.min < target && target < next.max);
                visible = next;
            }
            assert_eq!(visible.max - visible.min, 2, "target {}", target);
        }
    }

    #[test]
    fn scan_refuses_when_nothing_left() {
        let visible = VisibleRange { min: 49, max: 51 };
        assert_eq!(binary_scan(visible, 50), Err(PowerError::RangeTooNarrow));
    }

    #[test]
    fn heat_uses_full_range() {
        let cfg = config(0, 100, 50);
        assert_eq!(heat(52, &cfg), Heat::Burning);
        assert_eq!(heat(60, &cfg), Heat::Hot);
        assert_eq!(heat(25, &cfg), Heat::Warm);
        assert_eq!(heat(95, &cfg), Heat::Cold);
    }

    #[test]
    fn heat_handles_extreme_guesses() {
        let cfg = config(5, 100, 50);
        assert_eq!(heat(i32::MIN, &cfg), Heat::Cold);
        assert_eq!(heat(i32::MAX, &cfg), Heat::Cold);
        let wide = config(i32::MIN, i32::MAX, 0);
        assert_eq!(heat(i32::MIN + 1, &wide), Heat::Cold);
        assert_eq!(heat(1, &wide), Heat::Burning);
    }

    #[test]
    fn active_is_single_use() {
        let cfg = config(5, 100, 50);
        let mut state = PowerState::new(
            Loadout {
                active: ActivePower::Freeze,
                passive: PassivePower::Thermal,
            },
            &cfg,
        );
        assert_eq!(
            state.activate(50),
            Ok(Activation::Inflict {
                effect: Effect::Freeze,
                duration: FREEZE_DURATION
            })
        );
        assert_eq!(state.activate(50), Err(PowerError::AlreadyUsed));
    }

    #[test]
    fn failed_scan_is_not_consumed() {
        let cfg = config(49, 51, 50);
        let mut state = PowerState::new(
            Loadout {
                active: ActivePower::BinaryScan,
                passive: PassivePower::Thermal,
            },
            &cfg,
        );
        assert_eq!(state.activate(50), Err(PowerError::RangeTooNarrow));
        assert!(!state.active_used);
    }

    #[test]
    fn firewall_blocks_effects() {
        let cfg = config(5, 100, 50);
        let now = Instant::now();
        let mut shielded = PowerState::new(
            Loadout {
                active: ActivePower::Glitch,
                passive: PassivePower::Firewall,
            },
            &cfg,
        );
        assert!(!shielded.receive(Effect::Freeze, FREEZE_DURATION, now));
        assert!(!shielded.is_frozen(now));

        let mut exposed = PowerState::new(
            Loadout {
                active: ActivePower::Glitch,
                passive: PassivePower::Overclock,
            },
            &cfg,
        );
        assert!(exposed.receive(Effect::Freeze, FREEZE_DURATION, now));
        assert!(exposed.is_frozen(now + Duration::from_millis(100)));
        assert!(!exposed.is_frozen(now + FREEZE_DURATION));
        assert!(!exposed.is_glitched(now));
    }

    #[test]
    fn parses_ability_names() {
        assert_eq!("scan".parse::<ActivePower>(), Ok(ActivePower::BinaryScan));
        assert_eq!("Overclock".parse::<PassivePower>(), Ok(PassivePower::Overclock));
        assert!("teleport".parse::<ActivePower>().is_err());
    }
}
