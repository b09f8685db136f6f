//! The invocation deadline, visible to blocking work spawned under it.
//!
//! Async code is bounded by `tokio::time::timeout` in the processor. Work moved
//! onto the blocking pool cannot be cancelled by dropping its future, so it reads
//! the deadline from here before it starts and checks it on every socket call.

use std::future::Future;
use std::time::{Duration, Instant};

tokio::task_local! {
    static DEADLINE: Instant;
}

/// Run `future` with `deadline` as the current invocation deadline.
pub async fn scope<F: Future>(deadline: Instant, future: F) -> F::Output {
    DEADLINE.scope(deadline, future).await
}

/// Deadline of the enclosing [`scope`], if any.
pub fn current() -> Option<Instant> {
    DEADLINE.try_with(|deadline| *deadline).ok()
}

/// Time left until `deadline`. `Some(ZERO)` once it has passed.
pub fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// `limit`, shortened so it never runs past `deadline`.
pub fn cap(limit: Duration, deadline: Option<Instant>) -> Duration {
    match remaining(deadline) {
        Some(left) => limit.min(left),
        None => limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_is_only_set_inside_scope() {
        assert!(current().is_none());
        let at = Instant::now() + Duration::from_secs(5);
        let seen = scope(at, async { current() }).await;
        assert_eq!(seen, Some(at));
    }

    #[test]
    fn cap_shortens_to_remaining_time() {
        let soon = Some(Instant::now() + Duration::from_millis(200));
        assert!(cap(Duration::from_secs(30), soon) <= Duration::from_millis(200));
        assert_eq!(cap(Duration::from_secs(30), None), Duration::from_secs(30));

        let past = Instant::now().checked_sub(Duration::from_millis(10));
        assert_eq!(remaining(past), Some(Duration::ZERO));
    }
}
