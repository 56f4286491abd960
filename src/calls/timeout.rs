//! Ring deadline for a call session.
//!
//! The timer runs as its own task and reports back through a callback, which
//! the session uses to push a timeout event into its own queue. Each arming is
//! tagged with an epoch so that a firing which raced with a state change (it
//! was already queued when the timer got cancelled) is recognised as stale.

use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct TimeoutSupervisor {
    task: Option<JoinHandle<()>>,
    epoch: u64,
}

impl TimeoutSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, cancelling any previous one.
    ///
    /// `on_fire` runs once `after` has elapsed, receiving the epoch returned here.
    pub fn arm<F>(&mut self, after: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.disarm();
        self.epoch += 1;
        let epoch = self.epoch;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire(epoch);
        }));
        epoch
    }

    /// Cancel the armed timer. Returns whether one was armed.
    pub fn disarm(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                self.epoch += 1;
                true
            }
            None => false,
        }
    }

    /// Accept a firing reported with `epoch`.
    ///
    /// Returns true exactly once, and only for the currently armed timer.
    pub fn take_fired(&mut self, epoch: u64) -> bool {
        if self.task.is_some() && self.epoch == epoch {
            self.task = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn armed(after: Duration) -> (TimeoutSupervisor, u64, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut timer = TimeoutSupervisor::new();
        let epoch = timer.arm(after, move |epoch| {
            let _ = tx.send(epoch);
        });
        (timer, epoch, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_deadline() {
        let (mut timer, epoch, mut rx) = armed(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(rx.try_recv().is_err(), "fired early");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, epoch);
        assert!(timer.take_fired(fired));
        assert!(!timer.take_fired(fired), "a firing is accepted only once");
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_never_fires() {
        let (mut timer, _, mut rx) = armed(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(timer.disarm());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.disarm());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_is_rejected() {
        let (mut timer, first, mut rx) = armed(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(first));

        // Rearmed before the first firing was consumed.
        let second = timer.arm(Duration::from_secs(60), |_| {});
        assert_ne!(first, second);
        assert!(!timer.take_fired(first));
        assert!(timer.take_fired(second));
    }
}
