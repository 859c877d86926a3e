//! Rebalance behavior through the full loop: offsets flushed inside the
//! revocation callback, repositioning on assignment, and the tolerance for
//! a revocation that lands before the batch is dispatched.

use std::sync::Arc;
use std::time::Duration;

use kafka_batch_consumer::consumer_loop::{ConsumerLoop, LoopSettings};
use kafka_batch_consumer::offset_tracker::OffsetTracker;
use kafka_batch_consumer::rebalance_coordinator::RebalanceCoordinator;
use kafka_batch_consumer::test_utils::{
    CountingHandler, FakeClient, FetchOutcome, ProbeOutcome, SlowHandler,
};
use kafka_batch_consumer::types::{Partition, Record};

fn settings() -> LoopSettings {
    LoopSettings {
        poll_timeout: Duration::from_millis(50),
        idle_backoff: Duration::from_millis(20),
        completion_wait: Duration::from_millis(100),
        shutdown_timeout: Duration::from_millis(1000),
    }
}

fn partition(n: i32) -> Partition {
    Partition::new("test-topic", n)
}

fn record(p: &Partition, offset: i64) -> Record {
    Record::new(p.clone(), offset)
}

fn build<H: kafka_batch_consumer::RecordHandler + 'static>(
    tracker: Arc<OffsetTracker>,
    coordinator: Arc<RebalanceCoordinator>,
    client: FakeClient,
    handler: Arc<H>,
) -> ConsumerLoop<FakeClient, H> {
    ConsumerLoop::new(client, handler, tracker, coordinator, settings(), "it-client")
}

#[tokio::test]
async fn mid_batch_revocation_flushes_pending_offsets_inside_the_callback() {
    let tracker = Arc::new(OffsetTracker::new());
    let coordinator = Arc::new(RebalanceCoordinator::new(Arc::clone(&tracker), "it-client"));
    let client = FakeClient::new(Arc::clone(&coordinator));
    let state = client.state();
    let p0 = partition(0);

    client.script_fetches([FetchOutcome::Assign {
        partitions: vec![p0.clone()],
        records: vec![record(&p0, 0), record(&p0, 1)],
    }]);
    // The probe on the first wait timeout revokes p0 while the second
    // record is still being handled; by then the first record's offset is
    // pending in the tracker.
    client.script_probes([ProbeOutcome::Revoke(vec![p0.clone()])]);

    let handler = Arc::new(SlowHandler::new(Duration::from_millis(80)));
    let consumer = build(tracker, coordinator, client, Arc::clone(&handler));
    let mut handle = consumer.handle();
    let join = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.close().await;
    join.await.unwrap().unwrap();

    // The flush commit for the pending offset happened strictly inside the
    // revocation callback, before it returned.
    let calls = state.calls();
    let begin = calls
        .iter()
        .position(|c| c == "revoke_begin[test-topic[0]]")
        .expect("revocation delivered");
    let flush = calls
        .iter()
        .position(|c| c == "commit[test-topic[0]=1]")
        .expect("pending offset flushed");
    let end = calls
        .iter()
        .position(|c| c == "revoke_end")
        .expect("revocation returned");
    assert!(
        begin < flush && flush < end,
        "flush must happen inside the callback: {calls:?}"
    );

    // The second record completed after the flush and was committed by the
    // regular cycle commit.
    assert_eq!(handler.count(), 2);
    assert_eq!(state.committed_offset(&p0), Some(2));
}

#[tokio::test]
async fn assignment_with_committed_offset_seeks_to_exactly_that_offset() {
    let tracker = Arc::new(OffsetTracker::new());
    let coordinator = Arc::new(RebalanceCoordinator::new(Arc::clone(&tracker), "it-client"));
    let client = FakeClient::new(Arc::clone(&coordinator));
    let state = client.state();
    let p0 = partition(0);
    let p1 = partition(1);

    // A previous owner committed offset 42 on p0; p1 has never been
    // committed.
    client.set_committed(p0.clone(), 42);
    client.script_fetches([FetchOutcome::Assign {
        partitions: vec![p0.clone(), p1.clone()],
        records: vec![],
    }]);

    let handler = Arc::new(CountingHandler::new());
    let consumer = build(tracker, coordinator, client, handler);
    let mut handle = consumer.handle();
    let join = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.close().await;
    join.await.unwrap().unwrap();

    let calls = state.calls();
    let begin = calls
        .iter()
        .position(|c| c.starts_with("assign_begin["))
        .expect("assignment delivered");
    let seek = calls
        .iter()
        .position(|c| c == "seek[test-topic[0]=42]")
        .expect("seek to the committed offset");
    let end = calls
        .iter()
        .position(|c| c == "assign_end")
        .expect("assignment returned");
    assert!(begin < seek && seek < end, "seek happens inside the callback: {calls:?}");

    assert!(
        calls.contains(&"last_committed[test-topic[1]]".to_string()),
        "lookup happens for every gained partition: {calls:?}"
    );
    assert!(
        !calls.iter().any(|c| c.starts_with("seek[test-topic[1]")),
        "a partition with no committed offset is never sought: {calls:?}"
    );
}

#[tokio::test]
async fn revocation_before_dispatch_tolerates_one_full_wait_interval() {
    let tracker = Arc::new(OffsetTracker::new());
    let coordinator = Arc::new(RebalanceCoordinator::new(Arc::clone(&tracker), "it-client"));
    let client = FakeClient::new(Arc::clone(&coordinator));
    let state = client.state();
    let p0 = partition(0);
    let p1 = partition(1);

    // The revocation arrives during the fetch that delivers the batch, so
    // the flag is already raised when the wait loop starts. The first
    // timeout consumes it without cancelling; the batch finishes during
    // the second interval.
    client.script_fetches([
        FetchOutcome::Assign {
            partitions: vec![p0.clone(), p1.clone()],
            records: vec![],
        },
        FetchOutcome::Revoke {
            partitions: vec![p1.clone()],
            records: (0..3).map(|o| record(&p0, o)).collect(),
        },
    ]);

    let handler = Arc::new(SlowHandler::new(Duration::from_millis(60)));
    let consumer = build(tracker, coordinator, client, Arc::clone(&handler));
    let mut handle = consumer.handle();
    let join = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.close().await;
    join.await.unwrap().unwrap();

    assert_eq!(
        handler.count(),
        3,
        "a pre-dispatch revocation must not cancel the batch on its first timeout"
    );
    assert_eq!(state.committed_offset(&p0), Some(3));

    let calls = state.calls();
    assert!(
        calls.contains(&"resume[test-topic[0]]".to_string()),
        "resume covers only the surviving partition: {calls:?}"
    );
}
