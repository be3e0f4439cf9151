//! Cancellation and timeouts (spec.md §5 "Cancellation and timeouts"):
//! a consumer blocked waiting on an arc buffer must wake up with an
//! error rather than hang forever when the producer shuts the buffer
//! down, and a consumer given an explicit timeout must time out rather
//! than wait indefinitely on a producer that never starts.

use std::time::Duration;

use multisphinx::arc_buffer::{ArcBuffer, WaitError};

#[test]
fn producer_shutdown_wakes_a_blocked_consumer_start() {
    let buf = ArcBuffer::new("cancel-test", true);
    let waiter = {
        let buf = buf.clone();
        std::thread::spawn(move || buf.consumer_start_utt(None))
    };

    // Give the waiter a moment to actually block before cancelling; if
    // it hasn't yet, `producer_shutdown`'s own notify still covers it
    // since the `started` flag is set under the same lock path.
    std::thread::sleep(Duration::from_millis(20));
    buf.producer_shutdown();

    // `producer_shutdown` flips `started` so the waiter wakes up at
    // all, but the buffer is left in the Canceled state, so the call
    // itself still reports cancellation rather than hanging forever.
    assert_eq!(waiter.join().unwrap(), Err(WaitError::Cancelled));
}

#[test]
fn producer_shutdown_wakes_a_blocked_consumer_wait_as_cancelled() {
    let buf = ArcBuffer::new("cancel-wait-test", true);
    buf.producer_start_utt("u1");
    buf.consumer_start_utt(None).unwrap();

    let waiter = {
        let buf = buf.clone();
        std::thread::spawn(move || buf.consumer_wait(None))
    };

    std::thread::sleep(Duration::from_millis(20));
    buf.producer_shutdown();

    assert_eq!(waiter.join().unwrap(), Err(WaitError::Cancelled));
}

#[test]
fn consumer_wait_times_out_when_no_data_arrives() {
    let buf = ArcBuffer::new("timeout-test", true);
    buf.producer_start_utt("u1");

    let result = buf.consumer_start_utt(Some(Duration::from_millis(50)));
    assert!(result.is_ok());

    let result = buf.consumer_wait(Some(Duration::from_millis(50)));
    assert_eq!(result, Err(WaitError::Timeout));
}

#[test]
fn consumer_start_utt_times_out_when_producer_never_starts() {
    let buf = ArcBuffer::new("never-starts", true);
    let result = buf.consumer_start_utt(Some(Duration::from_millis(30)));
    assert_eq!(result, Err(WaitError::Timeout));
}
