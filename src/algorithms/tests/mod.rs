// src/algorithms/tests/mod.rs


/// Tests for Fixed Window algorithm
mod fixed_window_tests;

/// Tests for Sliding Window algorithm
mod sliding_window_tests;

/// Tests for Leaky Bucket algorithm
mod leaky_bucket_tests;


/// Common tests for all algorithms
mod common_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::algorithms::{FixedWindow, LeakyBucket, RateLimitAlgorithm, SlidingWindow, TokenBucket};

    /// Test consistent behavior across all algorithm implementations
    #[tokio::test]
    async fn test_algorithm_trait_consistency() {
        let window = Duration::from_secs(60);
        let algorithms: Vec<(&str, Arc<dyn RateLimitAlgorithm>)> = vec![
            // Near-zero rates so nothing refills during the test
            ("token_bucket", Arc::new(TokenBucket::new(5, 0.000_001))),
            ("fixed_window", Arc::new(FixedWindow::new(5, window))),
            ("sliding_window", Arc::new(SlidingWindow::new(5, window))),
            ("leaky_bucket", Arc::new(LeakyBucket::new(5, 0.000_001))),
        ];

        for (name, limiter) in algorithms {
            // All should allow exactly 5 requests
            for i in 0..5 {
                let result = limiter.check_and_record(name).await.unwrap();
                assert!(result.allowed, "{}: Request {} should be allowed", name, i);
                assert_eq!(result.remaining, 4 - i, "{}: remaining after request {}", name, i);
                assert_eq!(result.limit, 5);
            }

            // All should deny further requests with a retry hint
            let result = limiter.check_and_record(name).await.unwrap();
            assert!(!result.allowed, "{}: 6th request should be denied", name);
            assert_eq!(result.remaining, 0);
            assert!(result.retry_after > Duration::ZERO, "{}: retry_after", name);

            // All should respect key isolation
            let other = limiter.check_and_record(&format!("{}_other", name)).await.unwrap();
            assert!(other.allowed, "{}: Different key should be allowed", name);

            // Peeking never consumes
            for _ in 0..3 {
                let peeked = limiter.peek(&format!("{}_fresh", name)).await.unwrap();
                assert!(peeked.allowed);
                assert_eq!(peeked.remaining, 5, "{}: peek must not consume", name);
            }

            // All should support reset
            limiter.reset(name).await.unwrap();
            let reset_result = limiter.check_and_record(name).await.unwrap();
            assert!(reset_result.allowed, "{}: Request after reset should be allowed", name);
        }
    }

    /// Keys that have gone quiet are dropped once an idle period passes
    #[tokio::test]
    async fn test_idle_keys_are_swept() {
        let period = Duration::from_millis(50);
        let algorithms: Vec<(&str, Arc<dyn RateLimitAlgorithm>)> = vec![
            // 5 tokens at 100/s: full again 50ms after the last request
            ("token_bucket", Arc::new(TokenBucket::new(5, 100.0))),
            ("fixed_window", Arc::new(FixedWindow::new(5, period))),
            ("sliding_window", Arc::new(SlidingWindow::new(5, period))),
            ("leaky_bucket", Arc::new(LeakyBucket::new(5, 100.0))),
        ];

        for (name, limiter) in algorithms {
            for i in 0..1_000 {
                limiter.check_and_record(&format!("client-{}", i)).await.unwrap();
            }
            assert_eq!(limiter.tracked_keys(), 1_000, "{}", name);

            tokio::time::sleep(period * 3).await;

            // The next request triggers the sweep before its own key is stored
            let decision = limiter.check_and_record("late").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(limiter.tracked_keys(), 1, "{}: idle keys should be gone", name);
        }
    }

    /// A sweep keeps keys that still differ from a fresh key
    #[tokio::test]
    async fn test_cleanup_keeps_active_keys() {
        let window = Duration::from_millis(50);
        let limiter = SlidingWindow::new(2, window);

        limiter.check_and_record("quiet").await.unwrap();
        tokio::time::sleep(window * 2).await;

        limiter.check_and_record("busy").await.unwrap();
        limiter.check_and_record("busy").await.unwrap();
        assert!(!limiter.check_and_record("busy").await.unwrap().allowed);

        assert_eq!(limiter.cleanup_idle(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        // The surviving key is still limited
        assert!(!limiter.check_and_record("busy").await.unwrap().allowed);
        // The swept key starts over
        assert_eq!(limiter.check_and_record("quiet").await.unwrap().remaining, 1);
    }

    /// A near-static bucket is never swept on a timer, and an exhausted one never idles
    #[tokio::test]
    async fn test_drained_token_bucket_is_not_idle() {
        let limiter = TokenBucket::new(1, 0.000_001);
        limiter.check_and_record("spent").await.unwrap();

        assert_eq!(limiter.cleanup_idle(), 0);
        assert!(!limiter.check_and_record("spent").await.unwrap().allowed);
    }
}
