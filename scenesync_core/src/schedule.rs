//! Repeating, cancellable work.
//!
//! Two ways to run something periodically:
//! - [`RepeatingTask`] is polled from a tick loop with the current time and
//!   says when it is due. Pose monitors use this so they stay on the same
//!   clock as interpolation.
//! - [`spawn_repeating`] runs a closure on the context's executor until its
//!   token is cancelled.

use scenesync_env::SceneContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared cancel flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Fixed-interval schedule driven by the caller's clock.
#[derive(Debug, Clone)]
pub struct RepeatingTask {
    interval: Duration,
    next_due: Duration,
    token: CancellationToken,
}

impl RepeatingTask {
    /// First run is due one interval after `now`.
    pub fn new(interval: Duration, now: Duration) -> Self {
        Self {
            interval,
            next_due: now + interval,
            token: CancellationToken::new(),
        }
    }

    /// Returns true at most once per call when the task is due.
    ///
    /// If several intervals have passed the schedule skips ahead instead of
    /// firing once per missed interval.
    pub fn poll(&mut self, now: Duration) -> bool {
        if self.token.is_cancelled() || now < self.next_due {
            return false;
        }
        if self.interval.is_zero() {
            self.next_due = now;
            return true;
        }
        while self.next_due <= now {
            self.next_due += self.interval;
        }
        true
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs `f` every `interval` on the context's executor until `token` is
/// cancelled. The first run happens one interval after spawning.
pub fn spawn_repeating<Ctx, F>(
    ctx: Arc<Ctx>,
    name: &str,
    interval: Duration,
    token: CancellationToken,
    mut f: F,
) where
    Ctx: SceneContext,
    F: FnMut() + Send + 'static,
{
    let task_name = name.to_string();
    let runner = ctx.clone();
    ctx.spawn(name, async move {
        loop {
            runner.sleep(interval).await;
            if token.is_cancelled() {
                debug!(task = %task_name, "Repeating task cancelled");
                break;
            }
            f();
        }
    });
}
