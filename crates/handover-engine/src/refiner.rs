//! Handover-time refinement by interval bisection
//!
//! Given a window whose start is served by `source` and whose end is served by
//! `target`, locate the switch to within `precision`. The returned instant is
//! the right end of the final bracket, which is the earliest probed instant
//! known not to be on the source satellite.

use crate::{HandoverError, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refinement {
    pub handover_at: DateTime<Utc>,
    pub iterations: u32,
}

/// ceil(log2(width / precision)) + margin
pub fn iteration_cap(width: Duration, precision: Duration, margin: u32) -> u32 {
    let width_us = width.num_microseconds().unwrap_or(i64::MAX) as f64;
    let precision_us = precision.num_microseconds().unwrap_or(1).max(1) as f64;
    let ratio = width_us / precision_us;
    if ratio <= 1.0 {
        return margin;
    }
    ratio.log2().ceil() as u32 + margin
}

/// Bisect `[start, end]` for the transition from `source` to `target`.
///
/// `probe(t)` returns the assignment at `t` (`None` for no coverage). A probe
/// equal to `source` moves the left edge; anything else moves the right edge.
/// The bracket's right edge must end up carrying `target`; otherwise the
/// assignment went somewhere else mid-window and the result is rejected.
pub fn refine<F>(
    source: &str,
    target: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    precision: Duration,
    margin: u32,
    mut probe: F,
) -> Result<Refinement>
where
    F: FnMut(DateTime<Utc>) -> Result<Option<String>>,
{
    if precision <= Duration::zero() {
        return Err(HandoverError::InvalidWindow(format!(
            "precision must be positive, got {}ms",
            precision.num_milliseconds()
        )));
    }
    if end <= start {
        return Err(HandoverError::InvalidWindow(format!("{} is not before {}", start, end)));
    }
    if source == target {
        return Err(HandoverError::InvalidWindow(format!(
            "source and target are both {}",
            source
        )));
    }

    let cap = iteration_cap(end - start, precision, margin);
    let mut lo = start;
    let mut hi = end;
    let mut hi_assignment = Some(target.to_string());
    let mut iterations = 0u32;

    while hi - lo >= precision {
        if iterations >= cap {
            return Err(HandoverError::RefinementDidNotConverge { iterations });
        }
        let half = Duration::microseconds((hi - lo).num_microseconds().unwrap_or(i64::MAX) / 2);
        let mid = lo + half;
        iterations += 1;

        let assignment = probe(mid)?;
        if assignment.as_deref() == Some(source) {
            lo = mid;
        } else {
            hi = mid;
            hi_assignment = assignment;
        }
    }

    if hi_assignment.as_deref() != Some(target) {
        debug!(
            "Bracket [{}, {}] ends on {:?}, expected {}",
            lo, hi, hi_assignment, target
        );
        return Err(HandoverError::RefinementDidNotConverge { iterations });
    }

    Ok(Refinement {
        handover_at: hi,
        iterations,
    })
}
