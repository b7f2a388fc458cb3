//! Round-trip deadline shared by the backend call and the response body.
//!
//! A route's budget covers the whole exchange: connecting, sending, waiting
//! for the head, and draining the body to the client. The deadline is fixed
//! when the request enters the gateway; [`DeadlineBody`] keeps enforcing it
//! after the response head has already been forwarded.

use bytes::Bytes;
use http_body::{Body, Frame};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep_until};

/// Furthest a deadline is ever placed in the future (about 30 years).
pub const MAX_HORIZON: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// A point in time after which a request's backend exchange is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start a deadline `budget` from now. A budget too large to represent
    /// is clamped to [`MAX_HORIZON`] from now.
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        Self {
            at: now
                .checked_add(budget.min(MAX_HORIZON))
                .unwrap_or(now),
            budget,
        }
    }

    /// Instant at which the deadline fires.
    pub fn at(&self) -> Instant {
        self.at
    }

    /// The budget this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Wrapper that ends a body with a `TimedOut` error once the deadline passes.
pub struct DeadlineBody<B> {
    inner: B,
    deadline: Deadline,
    sleep: Pin<Box<Sleep>>,
}

impl<B> DeadlineBody<B> {
    /// Create a new deadline-bound body.
    pub fn new(inner: B, deadline: Deadline) -> Self {
        Self {
            inner,
            deadline,
            sleep: Box::pin(sleep_until(deadline.at())),
        }
    }

    /// Get the deadline this body is bound to.
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        // Deadline first, so a body that never goes pending still stops
        if this.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!(
                    "Round trip deadline exceeded ({:?})",
                    this.deadline.budget()
                ),
            )
            .into())));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(result) => Poll::Ready(result.map(|r| r.map_err(|e| e.into()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
