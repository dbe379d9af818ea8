use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

/// Exit code recorded for processes we did not fork and so cannot
/// collect a real status from (adopted children, force-stopped ones).
pub const EXIT_UNKNOWN: i32 = -1;

/// One-shot process-exit latch. Monitors call `notify_exit` when the
/// process goes away; attach streams and stop paths wait on it or
/// probe it with `is_done`.
#[derive(Debug)]
pub struct ExitNotifier {
    slot: Mutex<Option<i32>>,
    cond: Condvar,
}

impl ExitNotifier {
    pub fn new() -> Self {
        ExitNotifier { slot: Mutex::new(None), cond: Condvar::new() }
    }

    /// Mark the process as exited and wake all waiters. Calling this
    /// more than once keeps the first recorded status.
    pub fn notify_exit(&self, status: i32) {
        // unwrap to propagate the poison as an unwind
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(status);
        }
        self.cond.notify_all();
    }

    /// Wait for the exit, returning the recorded status, or None on
    /// timeout. A None timeout waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<i32> {
        let slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return *slot;
        }

        match timeout {
            Some(t) => {
                let (status, wait_res) =
                    self.cond.wait_timeout_while(slot, t, |status| status.is_none()).unwrap();
                if wait_res.timed_out() {
                    None
                } else {
                    *status
                }
            }
            None => *self.cond.wait_while(slot, |status| status.is_none()).unwrap(),
        }
    }

    /// Non-blocking probe used by streaming loops.
    pub fn is_done(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

impl Default for ExitNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn wait_returns_status() {
        let n = Arc::new(ExitNotifier::new());
        let waiter = Arc::clone(&n);
        let h = thread::spawn(move || waiter.wait(Some(Duration::from_secs(5))));
        n.notify_exit(3);
        assert_eq!(h.join().unwrap(), Some(3));
    }

    #[test]
    fn wait_after_exit_returns_immediately() {
        let n = ExitNotifier::new();
        n.notify_exit(0);
        assert_eq!(n.wait(Some(Duration::from_millis(1))), Some(0));
        assert!(n.is_done());
    }

    #[test]
    fn wait_times_out() {
        let n = ExitNotifier::new();
        assert_eq!(n.wait(Some(Duration::from_millis(10))), None);
        assert!(!n.is_done());
    }

    #[test]
    fn first_status_wins() {
        let n = ExitNotifier::new();
        n.notify_exit(1);
        n.notify_exit(2);
        assert_eq!(n.wait(None), Some(1));
    }
}
