use core::sync::atomic::{AtomicU32, Ordering};

#[macro_export]
macro_rules! int_wrapper {
    ($vis:vis $name:ident : $ty:ty) => {
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display, derive_more::From, derive_more::Into, derive_more::LowerHex, derive_more::UpperHex, derive_more::Binary)]
        #[repr(transparent)]
        $vis struct $name (pub $ty);

        impl $name {
            #[inline(always)]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            #[inline(always)]
            pub const fn from_usize(val: usize) -> Self {
                Self(val as $ty)
            }

            #[inline(always)]
            pub const fn value(self) -> $ty {
                self.0
            }
        }
    };
}

/// Busy-waits while `f` returns `true`, giving up after `attempts` evaluations.
///
/// Returns `true` if the condition cleared within the budget.
#[inline]
pub fn spin_while_bounded(attempts: u32, f: impl Fn() -> bool) -> bool {
    for _ in 0..attempts {
        if !f() {
            return true;
        }
        core::hint::spin_loop();
    }
    !f()
}

/// Event-count based message limiter, safe to use from interrupt context.
///
/// The first `burst` events are allowed, after that one event every `interval`
/// events. There is no clock in the interrupt path, so the window is measured in
/// events rather than time.
#[derive(Debug)]
pub struct RateLimit {
    burst: u32,
    interval: u32,
    events: AtomicU32,
    suppressed: AtomicU32,
}

impl RateLimit {
    pub const fn new(burst: u32, interval: u32) -> Self {
        Self {
            burst,
            interval,
            events: AtomicU32::new(0),
            suppressed: AtomicU32::new(0),
        }
    }

    /// Records an event and returns `Some(suppressed)` if it may be logged,
    /// where `suppressed` is the number of events dropped since the last one
    /// that was allowed.
    pub fn check(&self) -> Option<u32> {
        let n = self.events.fetch_add(1, Ordering::Relaxed);
        let allowed = n < self.burst || (n - self.burst) % self.interval.max(1) == 0;
        if allowed {
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    #[test]
    fn bounded_spin_gives_up() {
        assert!(!spin_while_bounded(16, || true));
        assert!(spin_while_bounded(16, || false));
    }

    #[test]
    fn bounded_spin_sees_late_clear() {
        let reads = Cell::new(0);
        let cleared = spin_while_bounded(10, || {
            reads.set(reads.get() + 1);
            reads.get() < 5
        });
        assert!(cleared);
        assert_eq!(reads.get(), 5);
    }

    #[test]
    fn rate_limit_bursts_then_thins_out() {
        let limit = RateLimit::new(3, 4);
        let allowed: std::vec::Vec<_> = (0..12).map(|_| limit.check()).collect();
        assert_eq!(allowed[0], Some(0));
        assert_eq!(allowed[2], Some(0));
        assert_eq!(allowed[3], Some(0));
        assert_eq!(allowed[4], None);
        assert_eq!(allowed[6], None);
        // events 4, 5, 6 were dropped before event 7 got through
        assert_eq!(allowed[7], Some(3));
    }
}
