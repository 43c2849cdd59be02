use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
#[derive(Clone, Debug)]
pub struct RetryStrategy {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl RetryStrategy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt: doubles every call up to `max`, +/-10% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;

        let jitter = base.as_millis() as u64 / 10;
        if jitter == 0 {
            return base;
        }
        let offset = rand::thread_rng().gen_range(0..=jitter * 2);
        (base + Duration::from_millis(offset)).saturating_sub(Duration::from_millis(jitter))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Run `op` until it succeeds or `max_attempts` attempts failed, sleeping
    /// with backoff in between. Returns the last error.
    pub async fn run<F, Fut, T, E>(&mut self, max_attempts: u32, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            match op().await {
                Ok(value) => {
                    self.reset();
                    return Ok(value);
                }
                Err(e) if self.attempts + 1 >= max_attempts => return Err(e),
                Err(_) => tokio::time::sleep(self.next_delay()).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        let mut retry = RetryStrategy::new(Duration::from_millis(100), Duration::from_millis(800));
        let delays: Vec<Duration> = (0..6).map(|_| retry.next_delay()).collect();

        assert!(delays[0] >= Duration::from_millis(90) && delays[0] <= Duration::from_millis(110));
        assert!(delays[1] >= Duration::from_millis(180) && delays[1] <= Duration::from_millis(220));
        for delay in &delays[3..] {
            assert!(*delay <= Duration::from_millis(880));
            assert!(*delay >= Duration::from_millis(720));
        }
        assert_eq!(retry.attempts(), 6);

        retry.reset();
        assert!(retry.next_delay() <= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let mut retry = RetryStrategy::new(Duration::from_millis(1), Duration::from_millis(4));
        let mut calls = 0;
        let result: Result<u32, &str> = retry
            .run(5, || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 3 {
                        Err("not yet")
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_run_gives_up() {
        let mut retry = RetryStrategy::new(Duration::from_millis(1), Duration::from_millis(2));
        let result: Result<(), &str> = retry.run(3, || async { Err("always") }).await;
        assert_eq!(result, Err("always"));
        assert_eq!(retry.attempts(), 2);
    }
}
