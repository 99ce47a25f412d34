// src/algorithms/tests/fixed_window_tests.rs

use std::time::Duration;
use tokio::time;

use crate::algorithms::{FixedWindow, RateLimitAlgorithm};

#[tokio::test]
async fn test_window_limits_and_resets() {
    let limiter = FixedWindow::new(3, Duration::from_millis(100));

    for i in 0..3 {
        let result = limiter.check_and_record("user").await.unwrap();
        assert!(result.allowed, "Request {} should be allowed", i);
        assert_eq!(result.remaining, 2 - i);
    }

    let denied = limiter.check_and_record("user").await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after <= Duration::from_millis(100));

    time::sleep(Duration::from_millis(120)).await;

    let result = limiter.check_and_record("user").await.unwrap();
    assert!(result.allowed, "New window should allow requests again");
    assert_eq!(result.remaining, 2);
}

#[tokio::test]
async fn test_reset_time_points_at_window_end() {
    let limiter = FixedWindow::new(10, Duration::from_secs(60));

    let before = chrono::Utc::now();
    let result = limiter.check_and_record("user").await.unwrap();

    let until_reset = result.reset_at - before;
    assert!(until_reset <= chrono::Duration::seconds(61));
    assert!(until_reset >= chrono::Duration::seconds(59));
}
