//! Tower middleware enforcing admission before the wrapped service runs.
//!
//! The layer stays framework-neutral: an extractor closure pulls the
//! rate-limited identity (a peer address, an API key hash) out of the
//! request, and the three-way outcome is mapped onto the service's error
//! channel. Translating [`LimitError::RateLimited`] into a 429 and
//! [`LimitError::Bucket`] into a 500 is the host framework's job.

use crate::bucket::{Decision, TokenBucket};
use crate::clock::Clock;
use crate::error::BucketError;
use crate::store::BucketStore;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Error type of [`RateLimitService`].
#[derive(Debug)]
pub enum LimitError<E, SE> {
    /// The identity's bucket is empty; retry after the hinted delay.
    RateLimited {
        /// Time until the next token accrues.
        retry_after: Duration,
    },
    /// The admission check itself failed.
    Bucket(BucketError<SE>),
    /// The wrapped service failed after admission.
    Inner(E),
}

impl<E: fmt::Display, SE: fmt::Display> fmt::Display for LimitError<E, SE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {:?}", retry_after)
            }
            Self::Bucket(e) => write!(f, "admission check failed: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E, SE> std::error::Error for LimitError<E, SE>
where
    E: std::error::Error + 'static,
    SE: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RateLimited { .. } => None,
            Self::Bucket(e) => Some(e),
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E, SE> LimitError<E, SE> {
    /// Check if the request was turned away for being over quota.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Extract the wrapped service's error if present.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A layer that gates requests through a [`TokenBucket`].
pub struct RateLimitLayer<S, C, F> {
    bucket: Arc<TokenBucket<S, C>>,
    extract: Arc<F>,
}

impl<S, C, F> RateLimitLayer<S, C, F> {
    /// Create a layer around `bucket`; `extract` yields the identity to
    /// charge for each request.
    pub fn new(bucket: TokenBucket<S, C>, extract: F) -> Self {
        Self { bucket: Arc::new(bucket), extract: Arc::new(extract) }
    }
}

impl<S, C, F> Clone for RateLimitLayer<S, C, F> {
    fn clone(&self) -> Self {
        Self { bucket: Arc::clone(&self.bucket), extract: Arc::clone(&self.extract) }
    }
}

impl<S, C, F> fmt::Debug for RateLimitLayer<S, C, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("bucket", &"<token bucket>")
            .field("extract", &"<extractor>")
            .finish()
    }
}

impl<Svc, S, C, F> Layer<Svc> for RateLimitLayer<S, C, F> {
    type Service = RateLimitService<Svc, S, C, F>;

    fn layer(&self, service: Svc) -> Self::Service {
        RateLimitService {
            inner: service,
            bucket: Arc::clone(&self.bucket),
            extract: Arc::clone(&self.extract),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
pub struct RateLimitService<Svc, S, C, F> {
    inner: Svc,
    bucket: Arc<TokenBucket<S, C>>,
    extract: Arc<F>,
}

impl<Svc: Clone, S, C, F> Clone for RateLimitService<Svc, S, C, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            bucket: Arc::clone(&self.bucket),
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<Svc: fmt::Debug, S, C, F> fmt::Debug for RateLimitService<Svc, S, C, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("bucket", &"<token bucket>")
            .field("extract", &"<extractor>")
            .finish()
    }
}

impl<Svc, S, C, F, Req> Service<Req> for RateLimitService<Svc, S, C, F>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    S: BucketStore + 'static,
    C: Clock + 'static,
    F: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = LimitError<Svc::Error, S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LimitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let identity = (self.extract)(&req);
        let bucket = Arc::clone(&self.bucket);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match bucket.try_consume(&identity).await {
                Ok(Decision::Admitted { .. }) => inner.call(req).await.map_err(LimitError::Inner),
                Ok(Decision::Rejected { retry_after }) => {
                    Err(LimitError::RateLimited { retry_after })
                }
                Err(e) => {
                    tracing::warn!(
                        target: "floodgate::middleware",
                        identity = %identity,
                        error = %e,
                        "admission check failed"
                    );
                    Err(LimitError::Bucket(e))
                }
            }
        })
    }
}
