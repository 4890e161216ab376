use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, Span, error, info};

use crate::error::JobError;

/// Unit of work the engine dispatches. Infallible: failures are reported by
/// the job itself (see [`WrappedJob`]).
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self);
}

/// A named, fallible unit of work registered by callers.
#[async_trait]
pub trait NamedJob: Send + Sync {
    fn name(&self) -> String;

    async fn run(&self) -> Result<(), JobError>;
}

#[async_trait]
impl<J: NamedJob + ?Sized> NamedJob for Arc<J> {
    fn name(&self) -> String {
        (**self).name()
    }

    async fn run(&self) -> Result<(), JobError> {
        (**self).run().await
    }
}

/// Adapts an async closure into a [`NamedJob`].
///
/// Without an explicit name the closure's type name is used, which points at
/// the function that defined it.
pub struct FuncJob<F> {
    name: String,
    f: F,
}

impl<F, Fut> FuncJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            name: std::any::type_name::<F>().to_string(),
            f,
        }
    }

    pub fn named(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> NamedJob for FuncJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self) -> Result<(), JobError> {
        (self.f)().await
    }
}

/// Logs every invocation of a [`NamedJob`]: start, completion, or failure
/// with the error text. The job's own result is not altered, only reported.
pub struct WrappedJob {
    job: Arc<dyn NamedJob>,
    span: Span,
}

impl WrappedJob {
    pub fn new(job: Arc<dyn NamedJob>, span: Span) -> Self {
        Self { job, span }
    }

    pub fn name(&self) -> String {
        self.job.name()
    }
}

#[async_trait]
impl Job for WrappedJob {
    async fn run(&self) {
        let name = self.job.name();
        async {
            info!(job = %name, "job started");
            match self.job.run().await {
                Ok(()) => info!(job = %name, "job completed"),
                Err(e) => error!(job = %name, error = %e, "job failed"),
            }
        }
        .instrument(self.span.clone())
        .await
    }
}
