use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default liveness timeout when neither backend nor options override it.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Activity signal fed to the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogFood {
    /// `start()` completed.
    Started,
    /// An inbound event with the given name was dispatched.
    Inbound(&'static str),
}

/// Reported when no food arrived within the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Starvation {
    pub timeout: Duration,
    pub last_food: Option<WatchdogFood>,
}

/// Liveness supervisor for one session.
///
/// Feeding is always allowed; the timeout only applies while a
/// [`Watchdog::supervise`] future is running.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    food: watch::Sender<Option<WatchdogFood>>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        let (food, _) = watch::channel(None);
        Self { timeout, food }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn feed(&self, food: WatchdogFood) {
        trace!(?food, "feeding watchdog");
        self.food.send_replace(Some(food));
    }

    /// Resolve with a [`Starvation`] once a full timeout elapses without food,
    /// or `None` when `cancel` fires first.
    pub async fn supervise(&self, cancel: CancellationToken) -> Option<Starvation> {
        let mut rx = self.food.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                fed = tokio::time::timeout(self.timeout, rx.changed()) => match fed {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => return None,
                    Err(_) => {
                        return Some(Starvation {
                            timeout: self.timeout,
                            last_food: rx.borrow().clone(),
                        });
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starves_without_food() {
        let dog = Watchdog::new(Duration::from_secs(30));
        let starvation = dog
            .supervise(CancellationToken::new())
            .await
            .expect("watchdog should starve");
        assert_eq!(starvation.timeout, Duration::from_secs(30));
        assert_eq!(starvation.last_food, None);
    }

    #[tokio::test(start_paused = true)]
    async fn feeding_postpones_starvation() {
        let dog = Arc::new(Watchdog::new(Duration::from_secs(30)));
        let supervisor = {
            let dog = Arc::clone(&dog);
            tokio::spawn(async move { dog.supervise(CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            dog.feed(WatchdogFood::Inbound("message"));
            tokio::task::yield_now().await;
            assert!(!supervisor.is_finished());
        }

        let starvation = supervisor
            .await
            .expect("supervisor join")
            .expect("watchdog should starve after feeding stops");
        assert_eq!(starvation.last_food, Some(WatchdogFood::Inbound("message")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_supervision_quietly() {
        let dog = Watchdog::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(dog.supervise(cancel).await, None);
    }
}
