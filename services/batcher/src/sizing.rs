//! Thread counts per phase.

use fleet_host::formulas::{
    weaken_threads_for, GROW_SECURITY_PER_THREAD, HACK_SECURITY_PER_THREAD,
};
use fleet_host::{Host, TargetState};
use fleet_proto::PhaseKind;

use crate::error::BatchError;
use crate::schedule::Shape;

/// Largest stolen fraction a batch plans for; growing back from zero money
/// is unbounded.
const MAX_STOLEN_FRACTION: f64 = 0.99;

/// Hack threads that steal about `hack_fraction` of current money.
pub fn hack_threads(hack_fraction: f64, per_thread: f64) -> Result<u64, BatchError> {
    if per_thread <= 0.0 {
        return Err(BatchError::invalid("target security is too high to hack"));
    }
    Ok(((hack_fraction / per_thread).floor() as u64).max(1))
}

/// Fraction of money `threads` hack threads take.
pub fn stolen_fraction(threads: u64, per_thread: f64) -> f64 {
    (threads as f64 * per_thread).min(MAX_STOLEN_FRACTION)
}

/// Weaken threads that cancel the security added by the other phases plus
/// any existing excess.
pub fn weaken_threads(hack: u64, grow: u64, excess_security: f64) -> u64 {
    let added = hack as f64 * HACK_SECURITY_PER_THREAD
        + grow as f64 * GROW_SECURITY_PER_THREAD
        + excess_security.max(0.0);
    weaken_threads_for(added).max(1)
}

/// Thread counts for every phase of `shape`, in completion order. Prep
/// batches skip a grow that is not needed.
pub async fn size_phases(
    host: &dyn Host,
    target: &TargetState,
    shape: Shape,
    hack_fraction: f64,
) -> Result<Vec<(PhaseKind, u64)>, BatchError> {
    match shape {
        Shape::Hgw => {
            let per_thread = host.hack_fraction_per_thread(&target.hostname).await?;
            let hack = hack_threads(hack_fraction, per_thread)?;
            let stolen = stolen_fraction(hack, per_thread);
            let grow = host
                .grow_threads_for(&target.hostname, 1.0 / (1.0 - stolen))
                .await?;
            let grow = checked_grow(grow)?.max(1);
            let weaken = weaken_threads(hack, grow, 0.0);
            Ok(vec![
                (PhaseKind::Hack, hack),
                (PhaseKind::Grow, grow),
                (PhaseKind::Weaken, weaken),
            ])
        }
        Shape::Prep => {
            let multiplier = if target.money > 0.0 {
                target.max_money / target.money
            } else {
                target.max_money
            };
            let grow = checked_grow(host.grow_threads_for(&target.hostname, multiplier).await?)?;
            let weaken = weaken_threads(0, grow, target.security - target.min_security);

            let mut phases = Vec::with_capacity(2);
            if grow > 0 {
                phases.push((PhaseKind::Grow, grow));
            }
            phases.push((PhaseKind::Weaken, weaken));
            Ok(phases)
        }
    }
}

fn checked_grow(threads: u64) -> Result<u64, BatchError> {
    if threads == u64::MAX {
        return Err(BatchError::invalid("target cannot be grown"));
    }
    Ok(threads)
}
