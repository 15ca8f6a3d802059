use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::error::ClientError;

/// Tuning for exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Maximum attempts including the first; `0` retries forever.
    pub max_attempts: u32,
    /// Fraction of the delay randomised in either direction, in `[0, 1]`.
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 5,
            jitter_fraction: 0.2,
        }
    }
}

impl BackoffConfig {
    fn normalized(mut self) -> Self {
        if self.initial_delay.is_zero() {
            self.initial_delay = Duration::from_millis(100);
        }
        if self.max_delay.is_zero() {
            self.max_delay = Duration::from_secs(10);
        }
        if self.multiplier <= 0.0 {
            self.multiplier = 2.0;
        }
        self.jitter_fraction = self.jitter_fraction.clamp(0.0, 1.0);
        self
    }
}

/// Tracks attempts and produces successive delays.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config: config.normalized(),
            attempt: 0,
        }
    }

    /// Delay before the next attempt. A server hint (e.g. Retry-After) wins
    /// when it exceeds the computed backoff. Returns zero once the attempt
    /// budget is spent.
    pub fn next(&mut self, server_hint: Duration) -> Duration {
        self.attempt += 1;

        if self.config.max_attempts > 0 && self.attempt > self.config.max_attempts {
            return Duration::ZERO;
        }

        let mut delay = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi((self.attempt - 1) as i32);
        delay = delay.min(self.config.max_delay.as_secs_f64());

        if self.config.jitter_fraction > 0.0 {
            let jitter = rand::thread_rng()
                .gen_range(-self.config.jitter_fraction..=self.config.jitter_fraction);
            delay *= 1.0 + jitter;
        }

        let mut result = Duration::from_secs_f64(delay.max(0.0));
        if server_hint > result {
            result = server_hint;
        }
        result
    }

    /// Attempts consumed so far (1-indexed after the first `next`).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts
    }
}

/// Create a linked cancellation handle/token pair. The token is cheap to
/// clone and hand to every in-flight operation; firing the handle wakes all
/// of them.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side of [`cancel_pair`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never fire.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the handle fires. Pends forever when the handle is gone
    /// without having fired (nothing can cancel any more).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Outcome of one attempt inside [`run_with_backoff`].
pub enum Attempt<T> {
    /// Finished; stop retrying.
    Done(T),
    /// Transient failure; retry after the backoff delay. `hint` is a
    /// server-provided minimum wait.
    Retry {
        error: ClientError,
        hint: Option<Duration>,
    },
    /// Terminal failure; a retry with the same inputs cannot succeed.
    Abort(ClientError),
}

/// Drives `op` under the backoff policy until it succeeds, aborts, exhausts
/// its attempt budget (returning the last transient error), or `cancel`
/// fires mid-sleep (returning [`ClientError::Cancelled`]).
pub async fn run_with_backoff<T, F, Fut>(
    config: BackoffConfig,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut backoff = Backoff::new(config);

    loop {
        match op().await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(error) => return Err(error),
            Attempt::Retry { error, hint } => {
                let delay = backoff.next(hint.unwrap_or(Duration::ZERO));
                if backoff.exhausted() {
                    return Err(error);
                }
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                }
            }
        }
    }
}
