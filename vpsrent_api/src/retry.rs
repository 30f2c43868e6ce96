//! Retry with error classification and step pipelines with rollback.
//!
//! Upstream calls return [`OpResult`], wrapping errors as [`OpError::Transient`]
//! (worth retrying) or [`OpError::Fatal`] (not). Only the operation itself can
//! make that call, the retry loop just obeys it.

use log::warn;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug)]
pub enum OpError {
    /// A failure that may succeed on retry
    Transient(anyhow::Error),
    /// A failure that should not be retried
    Fatal(anyhow::Error),
}

impl OpError {
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            OpError::Transient(e) | OpError::Fatal(e) => e,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, OpError::Transient(_))
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::Transient(e) => write!(f, "transient error: {}", e),
            OpError::Fatal(e) => write!(f, "fatal error: {}", e),
        }
    }
}

impl std::error::Error for OpError {}

pub type OpResult<T> = Result<T, OpError>;

#[macro_export]
macro_rules! op_fatal {
    ($($arg:tt)*) => {
        return Err($crate::retry::OpError::Fatal(anyhow::anyhow!($($arg)*)))
    };
}

#[macro_export]
macro_rules! op_transient {
    ($($arg:tt)*) => {
        return Err($crate::retry::OpError::Transient(anyhow::anyhow!($($arg)*)))
    };
}

/// Exponential backoff settings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 3,
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Retry an async operation, short-circuiting on [`OpError::Fatal`].
pub async fn retry_async<F, Fut, T>(policy: RetryPolicy, mut f: F) -> Result<T, anyhow::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OpResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(OpError::Fatal(e)) => return Err(e),
            Err(OpError::Transient(e)) => {
                if attempt >= policy.max_retries {
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "Transient error (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    policy.max_retries,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type StepFn<Ctx> = Box<dyn FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), anyhow::Error>> + Send>;

struct PipelineStep<Ctx> {
    name: String,
    action: StepFn<Ctx>,
    rollback: Option<StepFn<Ctx>>,
}

/// A sequence of steps over a shared context. If step N fails, the rollbacks
/// of steps 0..N-1 run in reverse order and the original error is returned.
pub struct Pipeline<Ctx> {
    ctx: Ctx,
    steps: Vec<PipelineStep<Ctx>>,
}

impl<Ctx> Pipeline<Ctx>
where
    Ctx: Send + 'static,
{
    pub fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            steps: Vec::new(),
        }
    }

    pub fn step(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), anyhow::Error>> + Send + 'static,
    ) -> Self {
        self.steps.push(PipelineStep {
            name: name.into(),
            action: Box::new(action),
            rollback: None,
        });
        self
    }

    /// The rollback runs only if this step succeeded and a later step fails.
    pub fn step_with_rollback(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), anyhow::Error>> + Send + 'static,
        rollback: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), anyhow::Error>> + Send + 'static,
    ) -> Self {
        self.steps.push(PipelineStep {
            name: name.into(),
            action: Box::new(action),
            rollback: Some(Box::new(rollback)),
        });
        self
    }

    /// Returns the context on success so callers can extract step outputs.
    pub async fn execute(mut self) -> Result<Ctx, anyhow::Error> {
        let mut completed: Vec<StepFn<Ctx>> = Vec::new();
        let steps: Vec<PipelineStep<Ctx>> = self.steps.drain(..).collect();

        for step in steps {
            match (step.action)(&mut self.ctx).await {
                Ok(()) => {
                    if let Some(rollback) = step.rollback {
                        completed.push(rollback);
                    }
                }
                Err(e) => {
                    warn!(
                        "Pipeline step '{}' failed: {}, rolling back {} steps",
                        step.name,
                        e,
                        completed.len()
                    );
                    for rollback in completed.into_iter().rev() {
                        if let Err(rb_err) = (rollback)(&mut self.ctx).await {
                            warn!("Rollback failed: {}", rb_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(self.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_recovers_from_transient() {
        let counter = AtomicU32::new(0);
        let result: Result<&str, anyhow::Error> = retry_async(
            RetryPolicy::default().with_min_delay(Duration::from_millis(1)),
            || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(OpError::Transient(anyhow::anyhow!("try again")))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_on_fatal() {
        let counter = AtomicU32::new(0);
        let result: Result<(), anyhow::Error> = retry_async(
            RetryPolicy::default().with_min_delay(Duration::from_millis(1)),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::Fatal(anyhow::anyhow!("nope"))) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let result: Result<(), anyhow::Error> = retry_async(
            RetryPolicy::default()
                .with_min_delay(Duration::from_millis(1))
                .with_max_retries(2),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::Transient(anyhow::anyhow!("always"))) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pipeline_rolls_back_in_reverse() {
        let order = Arc::new(tokio::sync::Mutex::new(Vec::<&'static str>::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let result = Pipeline::<()>::new(())
            .step_with_rollback(
                "one",
                |_ctx| Box::pin(async { Ok(()) }),
                move |_ctx| {
                    let o = o1.clone();
                    Box::pin(async move {
                        o.lock().await.push("rollback1");
                        Ok(())
                    })
                },
            )
            .step_with_rollback(
                "two",
                |_ctx| Box::pin(async { Ok(()) }),
                move |_ctx| {
                    let o = o2.clone();
                    Box::pin(async move {
                        o.lock().await.push("rollback2");
                        Ok(())
                    })
                },
            )
            .step("boom", |_ctx| {
                Box::pin(async { Err(anyhow::anyhow!("boom")) })
            })
            .execute()
            .await;

        assert!(result.is_err());
        assert_eq!(*order.lock().await, vec!["rollback2", "rollback1"]);
    }

    #[tokio::test]
    async fn pipeline_failed_step_does_not_roll_itself_back() {
        let ran = AtomicU32::new(0);
        let ran = Arc::new(ran);
        let r = ran.clone();

        let result = Pipeline::<()>::new(())
            .step_with_rollback(
                "first_fails",
                |_ctx| Box::pin(async { Err(anyhow::anyhow!("immediate")) }),
                move |_ctx| {
                    let r = r.clone();
                    Box::pin(async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                },
            )
            .execute()
            .await;

        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pipeline_context_flows_between_steps() {
        struct Ctx {
            value: u32,
        }

        let ctx = Pipeline::new(Ctx { value: 0 })
            .step("set", |ctx| {
                Box::pin(async move {
                    ctx.value = 21;
                    Ok(())
                })
            })
            .step("double", |ctx| {
                Box::pin(async move {
                    ctx.value *= 2;
                    Ok(())
                })
            })
            .execute()
            .await
            .unwrap();

        assert_eq!(ctx.value, 42);
    }
}
