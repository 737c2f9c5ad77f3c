//! End-to-end tests for the simple partition-consumer component

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use kafka_components::kafka::{broker_timestamp, FailStrategy, LatestOffsetNotifier, SimpleComponentBuilder, StartOffset};
use kafka_components::metrics::MessageStatus;
use kafka_components::test_utils::{eventually, within, MockBroker, RecordingMetrics, RecordingProcessor};
use kafka_components::{Error, Stage};

/// Broker with one "orders" topic whose streams end once drained
fn broker(partitions: usize, per_partition: usize) -> MockBroker {
    let broker = MockBroker::new();
    broker.create_topic("orders", partitions);
    broker.close_streams_when_drained(true);
    for partition in 0..partitions as i32 {
        for i in 0..per_partition {
            broker.produce("orders", partition, format!("{{\"n\":{}}}", i));
        }
    }
    broker
}

fn builder(broker: &MockBroker, processor: &RecordingProcessor) -> SimpleComponentBuilder {
    SimpleComponentBuilder::new("orders")
        .brokers(["mock:9092"])
        .topic("orders")
        .shared_processor(processor.shared())
        .connector(broker.connector())
        .retry_wait(Duration::from_millis(10))
}

#[tokio::test]
async fn test_single_message_batches_in_offset_order() {
    let broker = broker(1, 100);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor)
        .batch_size(1)
        .batch_timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert_eq!(processor.batch_sizes(), vec![1; 100]);
    assert_eq!(processor.processed_offsets(), (0..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_partial_batch_flushed_when_stream_ends() {
    let broker = broker(1, 25);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor)
        .batch_size(10)
        .batch_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert_eq!(processor.batch_sizes(), vec![10, 10, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_flushed_on_timeout() {
    let broker = broker(1, 25);
    broker.close_streams_when_drained(false);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor)
        .batch_size(10)
        .batch_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { component.run(token).await }
    });

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(processor.batch_sizes(), vec![10, 10]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(processor.batch_sizes(), vec![10, 10, 5]);

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_exit_strategy_exhausts_retries() {
    let broker = broker(1, 100);
    let processor = RecordingProcessor::new().fail_on_offset(70);
    let component = builder(&broker, &processor)
        .batch_size(100)
        .failure_strategy(FailStrategy::Exit)
        .retries(3)
        .build()
        .unwrap();

    let err = within(component.run(CancellationToken::new())).await.unwrap_err();

    assert!(err.is_processing());
    assert!(err.to_string().contains("orders"));
    assert_eq!(processor.call_count(), 4);
    // Processing retries rebuild the partition consumers on the same client
    assert_eq!(broker.connect_count(), 1);
    for attempt in processor.attempts() {
        let offsets: Vec<i64> = attempt.iter().map(|position| position.offset).collect();
        assert_eq!(&offsets[..70], &(0..70).collect::<Vec<_>>()[..]);
    }
    assert!(component.offsets().is_empty());
}

#[tokio::test]
async fn test_skip_strategy_advances_past_failed_batch() {
    let broker = broker(1, 30);
    let processor = RecordingProcessor::new().fail_on_offset(15);
    let metrics = RecordingMetrics::new();
    let component = builder(&broker, &processor)
        .batch_size(10)
        .failure_strategy(FailStrategy::Skip)
        .metrics(metrics.clone())
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    let expected: Vec<i64> = (0..10).chain(20..30).collect();
    assert_eq!(processor.processed_offsets(), expected);
    assert_eq!(processor.call_count(), 3);
    assert_eq!(component.offsets().next_offset("orders", 0), Some(30));

    assert_eq!(metrics.count(MessageStatus::Received), 30);
    assert_eq!(metrics.count(MessageStatus::Processed), 20);
    assert_eq!(metrics.count(MessageStatus::Errored), 10);
    assert_eq!(metrics.count(MessageStatus::Skipped), 10);
    assert_eq!(metrics.batches(), vec![(10, true), (10, false), (10, true)]);
}

#[tokio::test]
async fn test_progress_resets_retry_budget() {
    let broker = broker(1, 12);
    let failed = Arc::new(Mutex::new(HashSet::new()));
    let processor = RecordingProcessor::new().fail_when(move |batch| {
        let offset = batch.messages()[0].offset();
        [3, 6, 9].contains(&offset) && failed.lock().unwrap().insert(offset)
    });
    let component = builder(&broker, &processor)
        .batch_size(1)
        .retries(1)
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert_eq!(processor.processed_offsets(), (0..12).collect::<Vec<_>>());
    assert_eq!(processor.call_count(), 15);
    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test]
async fn test_broker_failure_reconnects() {
    let broker = broker(1, 5);
    // Records vanish while the reported low watermark stays at 0
    broker.expire_silently("orders", 0, 2);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor).retries(1).build().unwrap();

    let err = within(component.run(CancellationToken::new())).await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Consume));
    assert_eq!(broker.connect_count(), 2);
    assert_eq!(processor.call_count(), 0);
}

#[tokio::test]
async fn test_connection_failures_are_retried() {
    let broker = broker(1, 3);
    broker.fail_connects(2);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor).retries(3).build().unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert_eq!(broker.connect_count(), 3);
    assert_eq!(processor.processed_count(), 3);
}

#[tokio::test]
async fn test_connection_failures_without_retries() {
    let broker = broker(1, 3);
    broker.fail_connects(1);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor).build().unwrap();

    let err = within(component.run(CancellationToken::new())).await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Connect));
    assert_eq!(processor.call_count(), 0);
}

#[tokio::test]
async fn test_batches_stay_within_one_partition() {
    let broker = broker(3, 4);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor).batch_size(2).build().unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert_eq!(processor.processed_count(), 12);
    for batch in processor.attempts() {
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].partition, batch[1].partition);
    }
    for partition in 0..3 {
        assert_eq!(component.offsets().next_offset("orders", partition), Some(4));
    }
}

#[tokio::test]
async fn test_notifies_once_across_retries() {
    let broker = broker(1, 10);
    let failed_once = Arc::new(Mutex::new(false));
    let processor = RecordingProcessor::new().fail_when(move |batch| {
        let mut failed = failed_once.lock().unwrap();
        let fail = !*failed && batch.messages()[0].offset() == 5;
        *failed |= fail;
        fail
    });
    let (notifier, caught_up) = LatestOffsetNotifier::channel();
    let component = builder(&broker, &processor)
        .batch_size(1)
        .retries(2)
        .notify_on_latest_offset(Arc::clone(&notifier))
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    within(caught_up).await.unwrap();
    assert!(notifier.has_fired());
    assert!(!notifier.notify());
}

#[tokio::test]
async fn test_notifies_immediately_for_empty_partitions() {
    let broker = broker(2, 0);
    let (notifier, caught_up) = LatestOffsetNotifier::channel();
    let component = builder(&broker, &RecordingProcessor::new())
        .notify_on_latest_offset(notifier)
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();
    within(caught_up).await.unwrap();
}

#[tokio::test]
async fn test_duration_offset_skips_old_messages() {
    let broker = MockBroker::new();
    broker.create_topic("orders", 1);
    broker.close_streams_when_drained(true);
    let old = Utc::now() - ChronoDuration::hours(2);
    for i in 0..5 {
        broker.produce_at("orders", 0, "{}", old + ChronoDuration::seconds(i));
    }
    for _ in 0..5 {
        broker.produce("orders", 0, "{}");
    }

    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor)
        .duration_offset(Duration::from_secs(3600), broker_timestamp())
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert_eq!(processor.processed_offsets(), (5..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_newest_start_reads_nothing_old() {
    let broker = broker(1, 5);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor)
        .start_offset(StartOffset::Newest)
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert_eq!(processor.call_count(), 0);
}

#[tokio::test]
async fn test_notifies_when_starting_at_newest() {
    let broker = broker(2, 5);
    let processor = RecordingProcessor::new();
    let (notifier, caught_up) = LatestOffsetNotifier::channel();
    let component = builder(&broker, &processor)
        .start_offset(StartOffset::Newest)
        .notify_on_latest_offset(Arc::clone(&notifier))
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert!(notifier.has_fired());
    within(caught_up).await.unwrap();
}

#[tokio::test]
async fn test_notifies_when_duration_seek_lands_at_the_end() {
    let broker = MockBroker::new();
    broker.create_topic("orders", 1);
    broker.close_streams_when_drained(true);
    let old = Utc::now() - ChronoDuration::hours(2);
    for i in 0..4 {
        broker.produce_at("orders", 0, "{}", old + ChronoDuration::seconds(i));
    }

    let processor = RecordingProcessor::new();
    let (notifier, caught_up) = LatestOffsetNotifier::channel();
    let component = builder(&broker, &processor)
        .duration_offset(Duration::from_secs(60), broker_timestamp())
        .notify_on_latest_offset(notifier)
        .build()
        .unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    within(caught_up).await.unwrap();
    assert_eq!(processor.call_count(), 0);
}

#[tokio::test]
async fn test_oldest_start_follows_retention() {
    let broker = broker(1, 10);
    broker.expire_before("orders", 0, 3);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor).build().unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();

    assert_eq!(processor.processed_offsets(), (3..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_topic_without_partitions_fails() {
    let broker = broker(0, 0);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor).build().unwrap();

    let err = within(component.run(CancellationToken::new())).await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::DiscoverPartitions));
}

#[tokio::test]
async fn test_check_topic_fails_fast() {
    let broker = broker(1, 3);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor)
        .topics(["orders", "refunds"])
        .check_topic(true)
        .retries(3)
        .build()
        .unwrap();

    let err = within(component.run(CancellationToken::new())).await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::CheckTopic));
    assert!(err.to_string().contains("refunds"));
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(processor.call_count(), 0);
}

#[tokio::test]
async fn test_check_topic_passes_when_topics_exist() {
    let broker = broker(1, 3);
    let processor = RecordingProcessor::new();
    let component = builder(&broker, &processor).check_topic(true).build().unwrap();

    within(component.run(CancellationToken::new())).await.unwrap();
    assert_eq!(processor.processed_count(), 3);
}

#[tokio::test]
async fn test_cancellation_drains_and_returns_ok() {
    let broker = broker(1, 5);
    broker.close_streams_when_drained(false);
    let processor = RecordingProcessor::new();
    let metrics = RecordingMetrics::new();
    let component = builder(&broker, &processor)
        .batch_size(100)
        .batch_timeout(Duration::from_secs(60))
        .metrics(metrics.clone())
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { component.run(token).await }
    });

    assert!(eventually(|| metrics.count(MessageStatus::Received) == 5).await);
    token.cancel();
    within(handle).await.unwrap().unwrap();

    // The partial batch is flushed on the way out
    assert_eq!(processor.batch_sizes(), vec![5]);
    assert_eq!(metrics.lag("orders", 0), Some(0));
}

#[tokio::test]
async fn test_processing_error_is_reported_with_context() {
    let broker = broker(1, 1);
    let processor = RecordingProcessor::new().fail_on_offset(0);
    let component = builder(&broker, &processor).build().unwrap();

    let err = within(component.run(CancellationToken::new())).await.unwrap_err();

    let Error::Cycle { component, group, topics, .. } = &err else {
        panic!("expected cycle error, got {:?}", err);
    };
    assert_eq!(component, "orders");
    assert_eq!(group, "-");
    assert_eq!(topics, "orders");
}
