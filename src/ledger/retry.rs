//! Bounded retry against freshly reloaded state.

/// Result of one attempt against a snapshot.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The attempt reached a final answer (success or a benign no-op).
    Done(T),
    /// The conditional write missed; reload and try again.
    Stale,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T, S> {
    Done { value: T, attempts: u32 },
    /// Budget spent. `last` is a read taken after the final missed write.
    Exhausted { attempts: u32, last: S },
}

/// Reload state, run `attempt` against it, repeat while the attempt reports
/// `Stale`, at most `max_attempts` times (minimum one). On exhaustion the
/// state is reloaded once more, so `last` reflects the write that won.
///
/// Errors from either closure end the loop immediately.
pub fn retry_with_reload<S, T, E>(
    max_attempts: u32,
    mut reload: impl FnMut() -> Result<S, E>,
    mut attempt: impl FnMut(&S) -> Result<Attempt<T>, E>,
) -> Result<RetryOutcome<T, S>, E> {
    let max_attempts = max_attempts.max(1);
    let mut attempts = 0;
    loop {
        let snapshot = reload()?;
        attempts += 1;
        match attempt(&snapshot)? {
            Attempt::Done(value) => return Ok(RetryOutcome::Done { value, attempts }),
            Attempt::Stale if attempts >= max_attempts => {
                return Ok(RetryOutcome::Exhausted {
                    attempts,
                    last: reload()?,
                });
            }
            Attempt::Stale => {
                tracing::debug!(attempts, max_attempts, "conditional write missed; reloading");
            }
        }
    }
}
