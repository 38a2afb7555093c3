#[cfg(test)]
mod tests {
    use crate::ingestor::{run_worker, Ingestor, MessageState, WorkerStats};
    use crate::queue::{Delivery, DeliveryTag, MemoryQueue, MessageQueue, QueueError};
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use mockall::*;
    use sensorline_core::reading::{NewReading, Reading, RowId, SensorKey};
    use sensorline_core::storage::duckdb::DuckDbStore;
    use sensorline_core::storage::{SeriesFilter, Store, StoreError};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio_test::{assert_err, assert_ok};

    mock! {
        pub Store {}
        #[async_trait]
        impl Store for Store {
            async fn initialize(&self) -> Result<(), StoreError>;
            async fn insert(&self, reading: NewReading) -> Result<RowId, StoreError>;
            async fn query_range(&self, filter: &SeriesFilter) -> Result<Vec<Reading>, StoreError>;
            async fn distinct_sensors(&self) -> Result<BTreeSet<SensorKey>, StoreError>;
            async fn shutdown(&self);
        }
    }

    mock! {
        pub Queue {}
        #[async_trait]
        impl MessageQueue for Queue {
            async fn receive(&mut self) -> Result<Option<Delivery>, QueueError>;
            async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError>;
            async fn requeue(&mut self, tag: DeliveryTag) -> Result<(), QueueError>;
        }
    }

    /// Fails the first `failures` inserts as unavailable, then delegates.
    struct FlakyStore {
        inner: DuckDbStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn initialize(&self) -> Result<(), StoreError> {
            self.inner.initialize().await
        }

        async fn insert(&self, reading: NewReading) -> Result<RowId, StoreError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable("simulated outage".to_string()));
            }
            self.inner.insert(reading).await
        }

        async fn query_range(&self, filter: &SeriesFilter) -> Result<Vec<Reading>, StoreError> {
            self.inner.query_range(filter).await
        }

        async fn distinct_sensors(&self) -> Result<BTreeSet<SensorKey>, StoreError> {
            self.inner.distinct_sensors().await
        }

        async fn shutdown(&self) {
            self.inner.shutdown().await
        }
    }

    fn delivery(tag: DeliveryTag, body: &str) -> Delivery {
        Delivery {
            tag,
            body: body.as_bytes().to_vec(),
            redelivered: false,
        }
    }

    async fn memory_store() -> Arc<DuckDbStore> {
        let store = DuckDbStore::new_in_memory().unwrap();
        store.initialize().await.unwrap();
        Arc::new(store)
    }

    fn since_yesterday() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now() - chrono::Duration::days(1)
    }

    async fn drain(queue: &MemoryQueue, ingestor: &Ingestor, workers: usize) -> WorkerStats {
        queue.close();
        let (_tx, rx) = watch::channel(false);
        let handles: Vec<_> = (0..workers)
            .map(|worker| tokio::spawn(run_worker(worker, ingestor.clone(), queue.consumer(), rx.clone())))
            .collect();
        let mut total = WorkerStats::default();
        for handle in handles {
            total += handle.await.unwrap().unwrap();
        }
        total
    }

    #[tokio::test]
    async fn test_stored_reading_is_acked() {
        let mut store = MockStore::new();
        store
            .expect_insert()
            .withf(|r| r.sensor_type == "gas" && r.sensor_id == Some(4) && r.value == 17.5 && r.timestamp.is_some())
            .times(1)
            .return_once(|_| Ok(1));
        let mut queue = MockQueue::new();
        queue.expect_ack().with(eq(7)).times(1).return_once(|_| Ok(()));
        queue.expect_requeue().times(0);

        let ingestor = Ingestor::new(Arc::new(store));
        let mut stats = WorkerStats::default();
        let state = ingestor
            .handle(&mut queue, delivery(7, r#"{"sensor_type":"gas","sensor_id":4,"value":17.5}"#), &mut stats)
            .await;

        assert_eq!(assert_ok!(state), MessageState::Acked);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.stored, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_requeues() {
        let mut store = MockStore::new();
        store
            .expect_insert()
            .times(1)
            .return_once(|_| Err(StoreError::Unavailable("pool timed out".to_string())));
        let mut queue = MockQueue::new();
        queue.expect_requeue().with(eq(3)).times(1).return_once(|_| Ok(()));
        queue.expect_ack().times(0);

        let ingestor = Ingestor::new(Arc::new(store));
        let mut stats = WorkerStats::default();
        let state = ingestor
            .handle(&mut queue, delivery(3, r#"{"sensor_type":"gas","value":1.0}"#), &mut stats)
            .await;

        assert_eq!(assert_ok!(state), MessageState::Redelivered);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.stored, 0);
    }

    #[tokio::test]
    async fn test_invalid_reading_is_dropped() {
        let mut store = MockStore::new();
        store
            .expect_insert()
            .times(1)
            .return_once(|_| Err(StoreError::Invalid("sensor_id out of range".to_string())));
        let mut queue = MockQueue::new();
        queue.expect_ack().with(eq(5)).times(1).return_once(|_| Ok(()));
        queue.expect_requeue().times(0);

        let ingestor = Ingestor::new(Arc::new(store));
        let mut stats = WorkerStats::default();
        let state = ingestor
            .handle(&mut queue, delivery(5, r#"{"sensor_type":"gas","sensor_id":70000,"value":1.0}"#), &mut stats)
            .await;

        assert_eq!(assert_ok!(state), MessageState::Acked);
        assert_eq!(stats.dropped_invalid, 1);
    }

    #[tokio::test]
    async fn test_malformed_message_never_reaches_store() {
        let mut store = MockStore::new();
        store.expect_insert().times(0);
        let mut queue = MockQueue::new();
        queue.expect_ack().times(2).returning(|_| Ok(()));

        let ingestor = Ingestor::new(Arc::new(store));
        let mut stats = WorkerStats::default();
        for (tag, body) in [(1, r#"{"sensor_type":"gas"}"#), (2, "garbage")] {
            let state = ingestor.handle(&mut queue, delivery(tag, body), &mut stats).await;
            assert_eq!(assert_ok!(state), MessageState::Acked);
        }
        assert_eq!(stats.dropped_malformed, 2);
    }

    #[tokio::test]
    async fn test_transport_failure_stops_worker() {
        let store = MockStore::new();
        let mut queue = MockQueue::new();
        queue
            .expect_receive()
            .times(1)
            .return_once(|| Err(QueueError::Connection("broker went away".to_string())));

        let (_tx, rx) = watch::channel(false);
        let result = run_worker(0, Ingestor::new(Arc::new(store)), queue, rx).await;
        assert!(matches!(result, Err(QueueError::Connection(_))));
    }

    #[tokio::test]
    async fn test_shutdown_finishes_in_flight_message() {
        let (tx, rx) = watch::channel(false);

        let mut store = MockStore::new();
        store.expect_insert().times(1).return_once(move |_| {
            // Shutdown arrives while the message is being stored.
            tx.send(true).unwrap();
            Ok(1)
        });
        let mut queue = MockQueue::new();
        let mut seq = Sequence::new();
        queue
            .expect_receive()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| Ok(Some(delivery(1, r#"{"sensor_type":"gas","value":2.0}"#))));
        queue
            .expect_ack()
            .with(eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|_| Ok(()));

        let stats = run_worker(0, Ingestor::new(Arc::new(store)), queue, rx).await;
        let stats = assert_ok!(stats);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.stored, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_receive() {
        let store = MockStore::new();
        let mut queue = MockQueue::new();
        queue.expect_receive().times(0);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let stats = assert_ok!(run_worker(0, Ingestor::new(Arc::new(store)), queue, rx).await);
        assert_eq!(stats, WorkerStats::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_interrupts_idle_worker() {
        let store = memory_store().await;
        let queue = MemoryQueue::new();
        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(0, Ingestor::new(store), queue.consumer(), rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        assert_eq!(assert_ok!(stats).received, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ingested_readings_come_back_in_time_order() {
        let store = memory_store().await;
        let queue = MemoryQueue::new();
        for i in 0..30 {
            queue
                .publish(format!(r#"{{"sensor_type":"temperature","sensor_id":{},"value":{}}}"#, i % 3, i))
                .unwrap();
        }

        let stats = drain(&queue, &Ingestor::new(store.clone()), 3).await;
        assert_eq!(stats.stored, 30);
        assert_eq!(queue.acked(), 30);

        let readings = store.query_range(&SeriesFilter::new("temperature", since_yesterday())).await.unwrap();
        assert_eq!(readings.len(), 30);
        assert!(readings.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_after_outage_stores_exactly_once() {
        let store = Arc::new(FlakyStore {
            inner: DuckDbStore::new_in_memory().unwrap(),
            failures: AtomicUsize::new(1),
        });
        store.initialize().await.unwrap();

        let queue = MemoryQueue::new();
        queue.publish(r#"{"sensor_type":"gas","sensor_id":1,"value":42.0}"#).unwrap();

        let ingestor = Ingestor::new(store.clone()).with_requeue_backoff(Duration::ZERO);
        let stats = drain(&queue, &ingestor, 1).await;
        assert_eq!(stats.received, 2);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.stored, 1);

        let readings = store.query_range(&SeriesFilter::new("gas", since_yesterday())).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 42.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_payloads_do_not_block_valid_ones() {
        let store = memory_store().await;
        let queue = MemoryQueue::new();
        for body in [
            r#"{"sensor_type":"smoke","sensor_id":1}"#,
            r#"{"sensor_type":"smoke","sensor_id":1,"value":6.0}"#,
            "{not json",
            r#"{"sensor_type":"smoke","sensor_id":1,"value":4.0,"battery":"low"}"#,
        ] {
            queue.publish(body).unwrap();
        }

        let stats = drain(&queue, &Ingestor::new(store.clone()), 1).await;
        assert_eq!(stats.dropped_malformed, 2);
        assert_eq!(stats.stored, 2);
        assert_eq!(queue.acked(), 4);
        assert_eq!(queue.ready() + queue.unacked(), 0);

        let values: Vec<f64> = store
            .query_range(&SeriesFilter::new("smoke", since_yesterday()))
            .await
            .unwrap()
            .iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![6.0, 4.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_sensor_type_is_listed_after_first_insert() {
        let store = memory_store().await;
        assert!(store.distinct_sensors().await.unwrap().is_empty());

        let queue = MemoryQueue::new();
        queue.publish(r#"{"sensor_type":"radiation","value":0.12}"#).unwrap();
        drain(&queue, &Ingestor::new(store.clone()), 1).await;

        let sensors = store.distinct_sensors().await.unwrap();
        assert!(sensors.contains(&SensorKey {
            sensor_type: "radiation".to_string(),
            sensor_id: None,
        }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_store_requeues_everything() {
        let store = memory_store().await;
        store.shutdown().await;

        let queue = MemoryQueue::new();
        queue.publish(r#"{"sensor_type":"gas","value":1.0}"#).unwrap();

        let (tx, rx) = watch::channel(false);
        let ingestor = Ingestor::new(store).with_requeue_backoff(Duration::from_millis(10));
        let worker = tokio::spawn(run_worker(0, ingestor, queue.consumer(), rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let stats = assert_ok!(worker.await.unwrap());
        assert!(stats.requeued >= 1);
        assert_eq!(stats.stored, 0);
        assert_eq!(queue.ready(), 1);
        assert_err!(queue.consumer().ack(1).await);
    }
}
