//! Job dispatch.
//!
//! The processor is a closed table from [`JobType`] to handler. It holds no
//! business logic: it builds the handler context, calls the handler, and
//! reports what came back.

pub mod command;

pub use command::CommandHandler;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::Span;

use crate::error::{Error, Result};
use crate::model::{Job, JobError, JobId, JobType};

/// What a handler gets to work with.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: JobId,
    pub job_type: JobType,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub correlation_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The job's `job.execute` span. Log inside it to keep job fields
    /// attached to handler output.
    pub span: Span,
}

impl HandlerContext {
    fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            user_id: job.user_id.clone(),
            payload: job.payload.clone(),
            correlation_id: job.correlation_id.clone(),
            attempt: job.attempts,
            span: Span::current(),
        }
    }

    /// Decode the payload into the handler's input type. A payload that
    /// does not decode is a permanent failure.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            HandlerError::permanent(format!("invalid {} payload", self.job_type))
                .with_cause(e.to_string())
        })
    }
}

/// Failure raised by a handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub cause: Option<String>,
    /// Retrying cannot help; fail the job now.
    pub permanent: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            permanent: true,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// The structured form stored on the job.
    pub fn to_job_error(&self) -> JobError {
        JobError {
            message: self.message.clone(),
            cause: self.cause.clone(),
        }
    }
}

/// Business logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> std::result::Result<serde_json::Value, HandlerError>;
}

/// Adapter so async closures can be registered as handlers.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<serde_json::Value, HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<serde_json::Value, HandlerError>> + Send,
{
    async fn handle(&self, ctx: HandlerContext) -> std::result::Result<serde_json::Value, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Why a job could not produce a result.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler for this type in this process. Fatal for the job.
    #[error("unsupported job type: {0}")]
    Unsupported(JobType),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Collects handlers before the processor is frozen.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `job_type`, replacing any earlier one.
    pub fn register(mut self, job_type: JobType, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn register_arc(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    /// Job types that have no handler yet.
    pub fn missing(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect()
    }

    /// Freeze the table. Fails unless every job type has a handler.
    pub fn build(self) -> Result<Processor> {
        let missing = self.missing();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|t| t.as_str()).collect();
            return Err(Error::Config(format!(
                "no handler registered for job type(s): {}",
                names.join(", ")
            )));
        }
        Ok(Processor {
            handlers: self.handlers,
        })
    }

    /// Freeze the table without the completeness check. Jobs of a missing
    /// type fail with [`DispatchError::Unsupported`].
    pub fn build_partial(self) -> Processor {
        Processor {
            handlers: self.handlers,
        }
    }
}

/// Frozen dispatch table.
pub struct Processor {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl Processor {
    pub fn supports(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Run the handler registered for `job.job_type`.
    pub async fn process(&self, job: &Job) -> std::result::Result<serde_json::Value, DispatchError> {
        let handler = self
            .handlers
            .get(&job.job_type)
            .ok_or(DispatchError::Unsupported(job.job_type))?;
        Ok(handler.handle(HandlerContext::for_job(job)).await?)
    }
}
