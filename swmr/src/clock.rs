//! Monotonic time, in the shape the kernel hands it out.
//!
//! Tick deadlines must never move backwards with wall-clock adjustments, so
//! everything here is `CLOCK_MONOTONIC`. The trait exists so tests can drive
//! tick controllers with a hand-cranked clock instead of real sleeps.

use std::io;
use std::time::Duration;

/// A monotonic instant as `(seconds, nanoseconds)`.
///
/// `nsec` is kept normalized below one second, which makes the derived
/// lexicographic ordering the temporal ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    sec: i64,
    nsec: u32,
}

const NANOS_PER_SEC: u32 = 1_000_000_000;

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    pub fn new(sec: i64, nsec: u32) -> Timespec {
        Timespec {
            sec: sec + i64::from(nsec / NANOS_PER_SEC),
            nsec: nsec % NANOS_PER_SEC,
        }
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    pub fn nsec(&self) -> u32 {
        self.nsec
    }

    /// The instant `duration` later than `self`.
    pub fn after(self, duration: Duration) -> Timespec {
        let mut sec = self.sec + duration.as_secs() as i64;
        let mut nsec = self.nsec + duration.subsec_nanos();
        if nsec >= NANOS_PER_SEC {
            sec += 1;
            nsec -= NANOS_PER_SEC;
        }
        Timespec { sec, nsec }
    }
}

/// Source of monotonic time for tick deadlines.
///
/// A clock failure is fatal to the file handle, hence the fallible `now`.
/// `sleep` is only ever used by the writer's close-time drain loop; readers
/// never suspend inside the engine.
pub trait Clock {
    fn now(&self) -> io::Result<Timespec>;
    fn sleep(&self, duration: Duration);
}

/// The process clock, `clock_gettime(CLOCK_MONOTONIC)` and `nanosleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Monotonic;

impl Clock for Monotonic {
    fn now(&self) -> io::Result<Timespec> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if -1 == unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } {
            return Err(io::Error::last_os_error());
        }
        Ok(Timespec::new(ts.tv_sec as i64, ts.tv_nsec as u32))
    }

    fn sleep(&self, duration: Duration) {
        let mut req = libc::timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        };

        loop {
            let mut rem = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };

            if 0 == unsafe { libc::nanosleep(&req, &mut rem) } {
                break;
            }

            // Resume the remainder after a signal, bail on anything else.
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break;
            }

            req = rem;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, Monotonic, Timespec};
    use std::time::Duration;

    #[test]
    fn ordering_is_temporal() {
        let base = Timespec::new(10, 999_999_999);
        let later = base.after(Duration::from_nanos(1));
        assert_eq!(later, Timespec::new(11, 0));
        assert!(base < later);
        assert!(Timespec::new(9, 5) < Timespec::new(10, 0));
    }

    #[test]
    fn normalizes_nanos() {
        assert_eq!(Timespec::new(1, 1_500_000_000), Timespec::new(2, 500_000_000));
    }

    #[test]
    fn monotonic_does_not_regress() {
        let clock = Monotonic;
        let a = clock.now().unwrap();
        let b = clock.now().unwrap();
        assert!(a <= b);
    }
}
