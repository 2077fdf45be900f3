// A counted semaphore with timed wait
//
// The swapchain scheduling core counts free images and queued
// page flips with these. std has no counting semaphore with a
// timeout, so build one from a mutex and condvar.
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SemWait {
    Ready,
    TimedOut,
}

pub struct TimedSemaphore {
    ts_count: Mutex<u64>,
    ts_cond: Condvar,
}

impl TimedSemaphore {
    pub fn new(initial: u64) -> TimedSemaphore {
        TimedSemaphore {
            ts_count: Mutex::new(initial),
            ts_cond: Condvar::new(),
        }
    }

    /// Increment the counter and wake one waiter.
    pub fn post(&self) {
        let mut count = self.ts_count.lock().unwrap();
        *count += 1;
        self.ts_cond.notify_one();
    }

    /// Decrement the counter, waiting up to `timeout_ns` for it to
    /// become non-zero. A timeout of 0 is a try-wait, u64::MAX waits
    /// forever.
    pub fn wait(&self, timeout_ns: u64) -> SemWait {
        let mut count = self.ts_count.lock().unwrap();

        if timeout_ns == u64::MAX {
            while *count == 0 {
                count = self.ts_cond.wait(count).unwrap();
            }
            *count -= 1;
            return SemWait::Ready;
        }

        let deadline = Duration::from_nanos(timeout_ns);
        let start = std::time::Instant::now();
        while *count == 0 {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return SemWait::TimedOut;
            }
            let (guard, res) = self
                .ts_cond
                .wait_timeout(count, deadline - elapsed)
                .unwrap();
            count = guard;
            if res.timed_out() && *count == 0 {
                return SemWait::TimedOut;
            }
        }
        *count -= 1;
        SemWait::Ready
    }

    /// The current counter value. Only meaningful at quiescence.
    pub fn count(&self) -> u64 {
        *self.ts_count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_wait_counts_down() {
        let sem = TimedSemaphore::new(2);
        assert_eq!(sem.wait(0), SemWait::Ready);
        assert_eq!(sem.wait(0), SemWait::Ready);
        assert_eq!(sem.wait(0), SemWait::TimedOut);
        sem.post();
        assert_eq!(sem.wait(0), SemWait::Ready);
    }

    #[test]
    fn timed_wait_expires() {
        let sem = TimedSemaphore::new(0);
        assert_eq!(sem.wait(5_000_000), SemWait::TimedOut);
    }

    #[test]
    fn post_wakes_waiter() {
        let sem = Arc::new(TimedSemaphore::new(0));
        let sem2 = sem.clone();
        let waiter = std::thread::spawn(move || sem2.wait(u64::MAX));
        std::thread::sleep(std::time::Duration::from_millis(10));
        sem.post();
        assert_eq!(waiter.join().unwrap(), SemWait::Ready);
    }
}
