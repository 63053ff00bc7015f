use tokio::{task::JoinHandle, time::Instant};

/// A single-shot timer. Arming it again replaces the pending callback, so two deadlines can never
/// both fire. Dropping it cancels.
///
/// Must be armed from inside a [`tokio::task::LocalSet`].
#[derive(Default)]
pub struct Countdown {
    task: Option<JoinHandle<()>>,
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, deadline: Instant, on_fire: impl FnOnce() + 'static) {
        self.cancel();
        self.task = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire();
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Armed and not fired yet.
    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use tokio::task::LocalSet;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_pending_callback() {
        LocalSet::new()
            .run_until(async {
                let fired = Rc::new(Cell::new(0));
                let mut countdown = Countdown::new();
                let start = Instant::now();

                for offset in [100, 200, 300] {
                    let fired = Rc::clone(&fired);
                    countdown.arm(start + Duration::from_millis(offset), move || {
                        fired.set(fired.get() + 1)
                    });
                }
                assert!(countdown.is_armed());

                tokio::time::sleep(Duration::from_millis(250)).await;
                assert_eq!(fired.get(), 0);

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(fired.get(), 1);
                assert!(!countdown.is_armed());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels() {
        LocalSet::new()
            .run_until(async {
                let fired = Rc::new(Cell::new(false));
                {
                    let fired = Rc::clone(&fired);
                    let mut countdown = Countdown::new();
                    countdown.arm(Instant::now() + Duration::from_millis(10), move || {
                        fired.set(true)
                    });
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                assert!(!fired.get());
            })
            .await;
    }
}
