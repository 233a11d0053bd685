use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long `stop` waits for the worker thread to finish an in-flight
/// run before giving up and detaching it.
const STOP_GRACE: Duration = Duration::from_secs(5);

struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Repeats a task with a fixed delay between the end of one run and the
/// start of the next. Slow runs stretch the period; runs never overlap.
pub struct Scheduler {
    name: String,
    signal: Arc<Signal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns the worker. The first run happens after one full `delay`.
    pub fn start<F>(name: &str, delay: Duration, mut task: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::new(Signal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker_signal = Arc::clone(&signal);
        let thread_name = name.to_string();
        let label = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                loop {
                    let mut stopped = worker_signal.stopped.lock().unwrap();
                    while !*stopped {
                        let (guard, timeout) = worker_signal
                            .wake
                            .wait_timeout(stopped, delay)
                            .unwrap();
                        stopped = guard;
                        if timeout.timed_out() {
                            break;
                        }
                    }
                    if *stopped {
                        return;
                    }
                    drop(stopped);

                    // a panicking task must not kill the schedule
                    if catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
                        log::error!("scheduled task '{label}' panicked");
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn scheduler thread: {e}"));

        Self {
            name: name.to_string(),
            signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signals the worker and waits a bounded time for it to exit.
    /// Idempotent.
    pub fn stop(&self) {
        {
            let mut stopped = self.signal.stopped.lock().unwrap();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        self.signal.wake.notify_all();

        let Some(handle) = self.handle.lock().unwrap().take() else {
            return;
        };
        let deadline = std::time::Instant::now() + STOP_GRACE;
        while !handle.is_finished() {
            if std::time::Instant::now() >= deadline {
                log::warn!(
                    "scheduler '{}' did not stop within {STOP_GRACE:?}, detaching",
                    self.name
                );
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            log::error!("scheduler '{}' worker panicked on exit", self.name);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
