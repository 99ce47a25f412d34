// src/algorithms/tests/sliding_window_tests.rs

use std::time::Duration;
use tokio::time;

use crate::algorithms::{RateLimitAlgorithm, SlidingWindow};

#[tokio::test]
async fn test_requests_expire_individually() {
    let limiter = SlidingWindow::new(2, Duration::from_millis(100));

    assert!(limiter.check_and_record("user").await.unwrap().allowed);
    time::sleep(Duration::from_millis(60)).await;
    assert!(limiter.check_and_record("user").await.unwrap().allowed);

    let denied = limiter.check_and_record("user").await.unwrap();
    assert!(!denied.allowed);
    // Only the first request has to age out
    assert!(denied.retry_after <= Duration::from_millis(40));

    time::sleep(Duration::from_millis(60)).await;

    // The first request has left the window, the second has not
    let result = limiter.check_and_record("user").await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, 0);
    assert!(!limiter.check_and_record("user").await.unwrap().allowed);
}

#[tokio::test]
async fn test_no_boundary_burst() {
    let limiter = SlidingWindow::new(4, Duration::from_millis(200));

    for _ in 0..4 {
        assert!(limiter.check_and_record("burst").await.unwrap().allowed);
    }
    time::sleep(Duration::from_millis(100)).await;

    // A fixed window could have reset here; the sliding log still remembers
    assert!(!limiter.check_and_record("burst").await.unwrap().allowed);
}
