//! Delayed single-flight scheduling for the deployment worker.
//!
//! One worker thread owns the schedule queue. `schedule()` requests a run
//! after the configured delay; requests arriving while a run is already
//! queued are coalesced into it. At most one job executes at a time, on the
//! ticker thread itself. Shutdown drops any queued-but-not-started run,
//! cancels the token the running job polls, and joins.

use crate::error::Result;
use crate::transport::CancelToken;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

enum TickerMsg {
    Schedule,
    Shutdown,
}

/// Handle to the scheduler thread.
pub struct Ticker {
    tx: Sender<TickerMsg>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn the scheduler thread.
    ///
    /// `cancel` is shared with the job: the job must poll it and return
    /// promptly once it fires.
    pub fn spawn<F>(delay: Duration, cancel: CancelToken, job: F) -> Result<Self>
    where
        F: Fn(&CancelToken) + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let thread_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("relay-ticker".to_string())
            .spawn(move || run_loop(rx, delay, thread_cancel, job))?;

        Ok(Self {
            tx,
            cancel,
            handle: Some(handle),
        })
    }

    /// Request a job run after the delay. Never blocks; coalesces with an
    /// already-queued run.
    pub fn schedule(&self) {
        let _ = self.tx.send(TickerMsg::Schedule);
    }

    /// Shut the scheduler down: drop any queued run, cancel the running job,
    /// wait for the thread to exit.
    pub fn stop(self) {
        // Drop does the work; the method exists so call sites read as intent.
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = self.tx.send(TickerMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop<F>(rx: Receiver<TickerMsg>, delay: Duration, cancel: CancelToken, job: F)
where
    F: Fn(&CancelToken),
{
    loop {
        match rx.recv() {
            Ok(TickerMsg::Schedule) => {}
            Ok(TickerMsg::Shutdown) | Err(_) => return,
        }

        // A run is now queued. Wait out the delay, absorbing duplicate
        // schedule requests so they coalesce into this run.
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(TickerMsg::Schedule) => continue,
                Ok(TickerMsg::Shutdown) => return,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        job(&cancel);
        // Schedule requests sent while the job ran are still in the channel
        // and trigger the next delayed run.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_schedule_runs_job_after_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let ticker = Ticker::spawn(SHORT, CancelToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        ticker.schedule();
        thread::sleep(SHORT * 5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        ticker.stop();
    }

    #[test]
    fn test_rapid_schedules_coalesce_into_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let ticker = Ticker::spawn(SHORT, CancelToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..10 {
            ticker.schedule();
        }
        thread::sleep(SHORT * 5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        ticker.stop();
    }

    #[test]
    fn test_stop_drops_queued_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let ticker = Ticker::spawn(Duration::from_secs(60), CancelToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        ticker.schedule();
        ticker.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_cancels_running_job() {
        let ticker = Ticker::spawn(Duration::from_millis(1), CancelToken::new(), |cancel| {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        ticker.schedule();
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        ticker.stop();
        // The job spins until cancelled; stop must unblock it promptly.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_schedule_during_run_queues_another_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let ticker = Ticker::spawn(SHORT, CancelToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(SHORT * 2);
        })
        .unwrap();

        ticker.schedule();
        thread::sleep(SHORT + SHORT / 2); // First run is now executing.
        ticker.schedule();
        thread::sleep(SHORT * 8);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        ticker.stop();
    }
}
