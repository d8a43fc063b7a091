//! Game formulas used by the simulated host.
//!
//! Durations scale with how far security sits above its minimum. Grow and
//! weaken take fixed multiples of the hack time.

use std::time::Duration;

use crate::types::TargetState;

/// Grow time as a multiple of hack time.
pub const GROW_TIME_RATIO: f64 = 3.2;

/// Weaken time as a multiple of hack time.
pub const WEAKEN_TIME_RATIO: f64 = 4.0;

/// Security added per hack thread.
pub const HACK_SECURITY_PER_THREAD: f64 = 0.002;

/// Security added per grow thread.
pub const GROW_SECURITY_PER_THREAD: f64 = 0.004;

/// Security removed per weaken thread.
pub const WEAKEN_SECURITY_PER_THREAD: f64 = 0.05;

/// Fraction of money one hack thread steals at zero security.
pub const BASE_HACK_FRACTION: f64 = 0.004;

/// Cap on the per-thread growth factor before the server parameter applies.
const MAX_GROWTH_RATE: f64 = 1.0035;

const BASE_GROWTH_RATE: f64 = 0.03;

fn security_factor(target: &TargetState) -> f64 {
    if target.min_security <= 0.0 {
        return 1.0;
    }
    (target.security / target.min_security).max(1.0)
}

pub fn hack_time(target: &TargetState) -> Duration {
    let ms = target.base_hack_ms as f64 * security_factor(target);
    Duration::from_millis(ms.round() as u64)
}

pub fn grow_time(target: &TargetState) -> Duration {
    hack_time(target).mul_f64(GROW_TIME_RATIO)
}

pub fn weaken_time(target: &TargetState) -> Duration {
    hack_time(target).mul_f64(WEAKEN_TIME_RATIO)
}

/// Fraction of current money one hack thread steals.
pub fn hack_fraction_per_thread(target: &TargetState) -> f64 {
    let difficulty = ((100.0 - target.security) / 100.0).clamp(0.0, 1.0);
    BASE_HACK_FRACTION * difficulty
}

/// Natural log of the money multiplier a single grow thread gives.
fn grow_log_per_thread(target: &TargetState) -> f64 {
    let security = target.security.max(1.0);
    let rate = (1.0 + BASE_GROWTH_RATE / security).min(MAX_GROWTH_RATE);
    rate.ln() * (target.growth / 100.0)
}

/// Grow threads needed to multiply money by `multiplier`.
pub fn grow_threads_for(target: &TargetState, multiplier: f64) -> u64 {
    if multiplier <= 1.0 {
        return 0;
    }
    let per_thread = grow_log_per_thread(target);
    if per_thread <= 0.0 {
        return u64::MAX;
    }
    (multiplier.ln() / per_thread).ceil() as u64
}

/// Weaken threads needed to remove `security`.
pub fn weaken_threads_for(security: f64) -> u64 {
    if security <= 0.0 {
        return 0;
    }
    (security / WEAKEN_SECURITY_PER_THREAD).ceil() as u64
}

/// Applies a hack; returns money stolen.
pub fn apply_hack(target: &mut TargetState, threads: u64) -> f64 {
    let fraction = (hack_fraction_per_thread(target) * threads as f64).min(1.0);
    let stolen = target.money * fraction;
    target.money -= stolen;
    target.security += HACK_SECURITY_PER_THREAD * threads as f64;
    stolen
}

/// Applies a grow; returns the money multiplier achieved.
pub fn apply_grow(target: &mut TargetState, threads: u64) -> f64 {
    let before = target.money.max(1.0);
    let grown = (target.money + threads as f64) * (grow_log_per_thread(target) * threads as f64).exp();
    target.money = grown.min(target.max_money);
    target.security += GROW_SECURITY_PER_THREAD * threads as f64;
    target.money / before
}

/// Applies a weaken; returns security removed.
pub fn apply_weaken(target: &mut TargetState, threads: u64) -> f64 {
    let before = target.security;
    target.security = (target.security - WEAKEN_SECURITY_PER_THREAD * threads as f64)
        .max(target.min_security);
    before - target.security
}
