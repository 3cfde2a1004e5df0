use exponential_backoff::Backoff;
use std::future::Future;
use std::time::Duration;

/// Retries `op` with bounded exponential backoff, used for catalog CAS
/// conflicts and resharder target-batch retries (spec: up to 5 attempts).
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_retries: u32,
    min_delay: Duration,
    max_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let backoff = Backoff::new(max_retries, min_delay, max_delay);
    let mut delays = backoff.into_iter();
    let mut attempt = 0u32;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match delays.next() {
                Some(Some(delay)) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &'static str> = retry_with_backoff(
            5,
            Duration::from_millis(1),
            Duration::from_millis(5),
            |_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn gives_up_after_exhaustion() {
        let result: Result<(), &'static str> = retry_with_backoff(
            2,
            Duration::from_millis(1),
            Duration::from_millis(2),
            |_attempt| async { Err("still failing") },
        )
        .await;

        assert_eq!(result, Err("still failing"));
    }
}
