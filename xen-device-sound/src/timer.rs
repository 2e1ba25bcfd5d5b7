// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Periodic position timer of a PCM device.

use std::{
    sync::mpsc::{channel, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::Result;

/// Calls a tick function once per period on a dedicated thread.
///
/// Stopping joins the thread, so no tick runs after `stop` returns.
pub struct PositionTimer {
    name: String,
    worker: Option<(Sender<()>, JoinHandle<()>)>,
}

impl std::fmt::Debug for PositionTimer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(PositionTimer))
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PositionTimer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker: None,
        }
    }

    pub const fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Arm the timer, replacing any previous schedule.
    pub fn start<F>(&mut self, period: Duration, mut tick: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.stop();
        let (sender, receiver) = channel::<()>();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || loop {
                match receiver.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    // A message or a dropped sender both mean stop.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;
        log::trace!("timer {} armed with a {:?} period", self.name, period);
        self.worker = Some((sender, handle));
        Ok(())
    }

    /// Disarm the timer and wait for a running tick to finish.
    pub fn stop(&mut self) {
        let Some((sender, handle)) = self.worker.take() else {
            return;
        };
        _ = sender.send(());
        if handle.thread().id() == thread::current().id() {
            // Stopped from its own tick: the loop exits on the next wake up.
            return;
        }
        if handle.join().is_err() {
            log::error!("timer {} thread panicked", self.name);
        }
        log::trace!("timer {} disarmed", self.name);
    }
}

impl Drop for PositionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn test_timer_ticks() {
        crate::init_logger();
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut timer = PositionTimer::new("test-timer");
        assert!(!timer.is_running());

        let ticks_clone = ticks.clone();
        timer
            .start(Duration::from_millis(5), move || {
                ticks_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timer.is_running());
        thread::sleep(Duration::from_millis(100));
        timer.stop();
        assert!(!timer.is_running());

        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        thread::sleep(Duration::from_millis(30));
        // No tick once `stop` has returned.
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);

        // Stopping twice is harmless.
        timer.stop();
    }

    #[test]
    fn test_timer_restart_and_drop() {
        crate::init_logger();
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut timer = PositionTimer::new("test-timer");
        for _ in 0..2 {
            let ticks_clone = ticks.clone();
            timer
                .start(Duration::from_millis(5), move || {
                    ticks_clone.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        drop(timer);
        let after_drop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
    }
}
