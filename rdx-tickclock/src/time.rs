//! Timer bookkeeping shared by the scheduler and the engine's driver.

use crate::common::TimerHandle;
use std::time::Duration;
use tokio::time::Instant;

/// A single armed timer: fire `handle` once `at` has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm {
    pub handle: TimerHandle,
    /// The monotonic instant the timer should fire at.
    pub at: Instant,
    /// The delay that was chosen when arming, measured from the arming `now`.
    pub delay: Duration,
}

/// Hands out monotonically increasing timer handles.
#[derive(Debug, Default)]
pub(crate) struct Generations {
    next: u64,
}

impl Generations {
    pub(crate) fn next_handle(&mut self) -> TimerHandle {
        let handle = TimerHandle(self.next);
        self.next = self.next.wrapping_add(1);
        handle
    }
}

/// Arms a timer `delay` after `now`, failing if the instant overflows the clock.
pub(crate) fn arm_after(
    generations: &mut Generations,
    now: Instant,
    delay: Duration,
) -> Result<Arm, String> {
    let at = now
        .checked_add(delay)
        .ok_or_else(|| format!("{:?} after {:?} overflows the monotonic clock", delay, now))?;
    Ok(Arm {
        handle: generations.next_handle(),
        at,
        delay,
    })
}
