use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::hybrid::Shared;

const SYNC_TICK: Duration = Duration::from_secs(1);

/// Periodic background task with a deterministic shutdown handshake: the
/// owner flips the stop flag, wakes the loop, and joins the thread.
#[derive(Debug)]
pub(crate) struct Ticker {
    name: &'static str,
    signal: Arc<TickerSignal>,
    join: Option<thread::JoinHandle<()>>,
}

#[derive(Debug)]
struct TickerSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl Ticker {
    /// Spawns a thread invoking `tick` every `period` until shut down.
    pub(crate) fn spawn(
        name: &'static str,
        period: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Self {
        let signal = Arc::new(TickerSignal {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let loop_signal = signal.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                // Check before waiting: a shutdown signalled while the last
                // tick ran must not be lost to a full extra period.
                let stopped = loop_signal.stopped.lock().expect("ticker signal poisoned");
                if *stopped {
                    break;
                }
                let (stopped, timeout) = loop_signal
                    .condvar
                    .wait_timeout(stopped, period)
                    .expect("ticker signal poisoned");
                if *stopped {
                    break;
                }
                drop(stopped);
                if timeout.timed_out() {
                    tick();
                }
            })
            .expect("failed to spawn ticker thread");
        Self {
            name,
            signal,
            join: Some(join),
        }
    }

    /// Stops the loop and joins the thread. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        {
            let mut stopped = self.signal.stopped.lock().expect("ticker signal poisoned");
            *stopped = true;
        }
        self.signal.condvar.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
            debug!("event=ticker_stopped name={}", self.name);
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scheduled sync: one data sync per second while appends have dirtied the
/// file. Failures are logged and never interrupt writers.
pub(crate) fn spawn_sync_ticker(shared: Arc<Shared>) -> Ticker {
    Ticker::spawn("hybridlog-sync", SYNC_TICK, move || {
        if !shared.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let file = shared
            .state
            .read()
            .expect("hybrid log state poisoned")
            .file
            .clone();
        if let Err(err) = file.sync_data() {
            shared.dirty.store(true, Ordering::Release);
            warn!(
                "event=scheduled_sync_failed path={} error={}",
                shared.path.display(),
                err
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ticker_fires_and_stops() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut ticker = Ticker::spawn("test-ticker", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        ticker.shutdown();
        let ticks = fired.load(Ordering::SeqCst);
        assert!(ticks > 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), ticks);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut ticker = Ticker::spawn("test-ticker", Duration::from_millis(10), || {});
        ticker.shutdown();
        ticker.shutdown();
    }
}
