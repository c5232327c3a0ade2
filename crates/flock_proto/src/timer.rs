//! See [`Timers`].

use web_time::Instant;

/// The timers that drive the protocol when no frames arrive.
///
/// The engine never owns callbacks; it records deadlines here, the caller
/// sleeps until [`Timers::next_deadline`], and [`Timers::poll_expired`]
/// turns elapsed deadlines back into typed ticks which the session
/// dispatches internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Periodic sweep for peers that have gone silent.
    Inactivity,
    /// Periodic garbage collection of remembered previous views.
    Cleanup,
    /// One-shot: consensus was not reached in time, rebroadcast the join.
    Consensus,
    /// Periodic retry of queued sends while operational.
    Resend,
    /// Periodic join rebroadcast while converging on a view.
    SendJoin,
}

const TIMER_COUNT: usize = 5;

const fn index(timer: Timer) -> usize {
    match timer {
        Timer::Inactivity => 0,
        Timer::Cleanup => 1,
        Timer::Consensus => 2,
        Timer::Resend => 3,
        Timer::SendJoin => 4,
    }
}

const TIMERS: [Timer; TIMER_COUNT] = [
    Timer::Inactivity,
    Timer::Cleanup,
    Timer::Consensus,
    Timer::Resend,
    Timer::SendJoin,
];

/// Deadline table for every [`Timer`].
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; TIMER_COUNT],
}

impl Timers {
    /// Creates a table with no armed timers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer, replacing any previous deadline.
    pub fn set(&mut self, timer: Timer, at: Instant) {
        self.deadlines[index(timer)] = Some(at);
    }

    /// Disarms a timer.
    pub fn unset(&mut self, timer: Timer) {
        self.deadlines[index(timer)] = None;
    }

    /// Gets whether a timer is armed.
    #[must_use]
    pub const fn is_set(&self, timer: Timer) -> bool {
        self.deadlines[index(timer)].is_some()
    }

    /// Gets the earliest armed deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Takes the earliest timer whose deadline has passed, disarming it.
    ///
    /// Call in a loop: periodic timers re-arm themselves from their
    /// dispatch.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Timer> {
        let timer = TIMERS
            .into_iter()
            .filter(|t| self.deadlines[index(*t)].is_some_and(|at| at <= now))
            .min_by_key(|t| self.deadlines[index(*t)])?;
        self.unset(timer);
        Some(timer)
    }
}

#[cfg(test)]
mod tests {
    use web_time::Duration;

    use super::*;

    #[test]
    fn earliest_deadline_wins() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.set(Timer::Consensus, now + Duration::from_secs(1));
        timers.set(Timer::SendJoin, now + Duration::from_millis(300));

        assert_eq!(Some(now + Duration::from_millis(300)), timers.next_deadline());

        // nothing is due yet
        assert_eq!(None, timers.poll_expired(now));

        // both are due: the earlier one fires first, then the later one
        let later = now + Duration::from_secs(2);
        assert_eq!(Some(Timer::SendJoin), timers.poll_expired(later));
        assert_eq!(Some(Timer::Consensus), timers.poll_expired(later));
        assert_eq!(None, timers.poll_expired(later));
        assert_eq!(None, timers.next_deadline());
    }

    #[test]
    fn unset_disarms() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.set(Timer::Resend, now);
        assert!(timers.is_set(Timer::Resend));
        timers.unset(Timer::Resend);
        assert!(!timers.is_set(Timer::Resend));
        assert_eq!(None, timers.poll_expired(now + Duration::from_secs(1)));
    }
}
