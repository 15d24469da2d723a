//! Retry with backoff for async Rust.
//!
//! An [`Operation`] produces a fresh Future on every attempt. When the Future resolves to an
//! error, the [`Condition`] is consulted with the error and the number of failed attempts so far,
//! and if it allows another attempt the [`retry::Retry`] future sleeps for the next delay handed
//! out by the backoff [`strategy`]. Running out of delays ends the retries with the last error.
//!
//! ```rust
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! async fn append() -> Result<u64, String> {
//!     Ok(7)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let delays = fixed::Interval::from_millis(1).take(3);
//!     let offset = Retry::new(delays, append, |_: &String, _attempt: u32| true).await;
//!     assert_eq!(offset, Ok(7));
//! }
//! ```

use std::future::Future;

/// Backoff strategies. Every strategy is an [`Iterator`] of delays; a finite iterator bounds the
/// number of retries (see [`Iterator::take`]).
pub mod strategy;

/// The retrying future.
pub mod retry;

/// Decides whether a failed attempt may be retried.
///
/// `attempt` is the number of attempts that have failed so far, including the one that produced
/// `error`, so it is `1` after the first failure.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E, attempt: u32) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E, u32) -> bool,
{
    fn can_retry(&mut self, error: &E, attempt: u32) -> bool {
        self(error, attempt)
    }
}

/// Something that can be started any number of times, each start yielding a Future that resolves
/// to a [`Result`].
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}
