use std::time::{Duration, Instant};

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// The polled operation itself failed
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Poll an operation until it yields a value
///
/// Returns `Ok(Some(value))` as soon as `operation` produces one and
/// `Ok(None)` if the deadline passes first. The serial backend uses this
/// to collect response lines until the controller acknowledges a command.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use spm_scan::utils::poll_with_timeout;
///
/// let mut lines = vec!["ok", "X:0.00 Y:0.00 Z:0.00"];
/// let reply = poll_with_timeout(
///     || Ok::<_, ()>(lines.pop().filter(|line| line.starts_with("ok"))),
///     Duration::from_secs(1),
///     Duration::ZERO,
/// );
/// assert_eq!(reply.unwrap(), Some("ok"));
/// ```
pub fn poll_with_timeout<F, T, E>(
    mut operation: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<T>, PollError<E>>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let start = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            return Ok(None);
        }

        match operation() {
            Ok(Some(result)) => return Ok(Some(result)),
            Ok(None) => {
                if !poll_interval.is_zero() {
                    std::thread::sleep(poll_interval);
                }
            }
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_with_timeout_collects_until_value() {
        let mut responses = vec!["echo:busy", "ok"].into_iter();
        let mut seen = Vec::new();

        let result = poll_with_timeout(
            || {
                let line = responses.next();
                if let Some(line) = line {
                    seen.push(line);
                }
                Ok::<_, &str>(line.filter(|l| *l == "ok"))
            },
            Duration::from_millis(500),
            Duration::ZERO,
        );

        assert_eq!(result.unwrap(), Some("ok"));
        assert_eq!(seen, vec!["echo:busy", "ok"]);
    }

    #[test]
    fn test_poll_with_timeout_expires() {
        let result = poll_with_timeout(
            || Ok::<Option<()>, &str>(None),
            Duration::from_millis(30),
            Duration::from_millis(5),
        );

        assert_eq!(result.unwrap(), None);
    }
}
