// src/algorithms/tests/leaky_bucket_tests.rs

use std::time::Duration;
use tokio::time;

use crate::algorithms::{LeakyBucket, RateLimitAlgorithm};

#[tokio::test]
async fn test_overflow_rejected_then_drains() {
    let bucket = LeakyBucket::new(3, 20.0);

    for i in 0..3 {
        let result = bucket.check_and_record("user").await.unwrap();
        assert!(result.allowed, "Request {} should fit", i);
    }

    let denied = bucket.check_and_record("user").await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after <= Duration::from_millis(50));

    // One unit drains every 50ms
    time::sleep(Duration::from_millis(80)).await;
    assert!(bucket.check_and_record("user").await.unwrap().allowed);
}

#[tokio::test]
async fn test_peek_reports_room_left() {
    let bucket = LeakyBucket::new(4, 0.000_001);

    bucket.check_and_record("user").await.unwrap();
    bucket.check_and_record("user").await.unwrap();

    let peeked = bucket.peek("user").await.unwrap();
    assert!(peeked.allowed);
    assert_eq!(peeked.remaining, 2);
    assert_eq!(peeked.limit, 4);
}
