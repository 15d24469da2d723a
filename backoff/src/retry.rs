use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// What the retry future is currently waiting on.
///
/// ```text
///   Attempt --Ok--> done
///      |
///     Err --(condition says no | no delay left)--> done(Err)
///      |
///   Backoff(delay) --elapsed--> Attempt
/// ```
#[pin_project(project = PhaseProj)]
enum Phase<O>
where
    O: Operation,
{
    Attempt(#[pin] O::Future),
    Backoff(#[pin] Sleep),
}

/// Runs an [`Operation`] until it succeeds, the [`Condition`] refuses another attempt, or the
/// backoff iterator runs dry. Resolves to the first success or the last error.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    phase: Phase<O>,
    delays: I,
    operation: O,
    condition: C,
    failures: u32,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<D>(delays: D, mut operation: O, condition: C) -> Self
    where
        D: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            phase: Phase::Attempt(operation.run()),
            delays: delays.into_iter(),
            operation,
            condition,
            failures: 0,
        }
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.phase.as_mut().project() {
                PhaseProj::Attempt(attempt) => {
                    let error = match attempt.poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                        Poll::Ready(Err(error)) => error,
                    };
                    *this.failures += 1;
                    if !this.condition.can_retry(&error, *this.failures) {
                        return Poll::Ready(Err(error));
                    }
                    let Some(delay) = this.delays.next() else {
                        return Poll::Ready(Err(error));
                    };
                    this.phase
                        .set(Phase::Backoff(sleep_until(Instant::now() + delay)));
                }
                PhaseProj::Backoff(sleep) => {
                    if sleep.poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    let next = this.operation.run();
                    this.phase.set(Phase::Attempt(next));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::strategy::{exponential, fixed};

    #[tokio::test]
    async fn first_attempt_succeeds() {
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            || future::ready(Ok::<_, ()>(3)),
            |_: &(), _| true,
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn condition_sees_attempt_numbers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            || future::ready(Err::<(), _>("nope")),
            move |_: &&str, attempt| {
                recorder.lock().unwrap().push(attempt);
                attempt < 3
            },
        )
        .await;
        assert_eq!(result, Err("nope"));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stops_when_delays_run_out() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = Retry::new(
            exponential::Exponential::from_millis(1, 4, 2.0).with_max_attempts(2),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), _>(()))
            },
            |_: &(), _| true,
        )
        .await;
        assert!(result.is_err());
        // one initial attempt plus one per delay
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = Retry::new(
            fixed::Interval::from_millis(1).take(10),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                future::ready(if n < 2 { Err("down") } else { Ok(n) })
            },
            |_: &&str, _| true,
        )
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let start = Instant::now();
        let _ = Retry::new(
            fixed::Interval::from_millis(100).take(2),
            || future::ready(Err::<(), _>(())),
            |_: &(), _| true,
        )
        .await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
