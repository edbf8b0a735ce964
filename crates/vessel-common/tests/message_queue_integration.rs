//! Integration tests for AsyncMessageQueue

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vessel_common::{
    listener_fn, AsyncMessageQueue, BasicMessage, Message, MessageQueue, MessageQueueListener,
    QueueConfig, QueueError,
};

fn message(value: u64) -> Arc<dyn Message> {
    BasicMessage::new(value).into_shared()
}

fn recorder(seen: &Arc<Mutex<Vec<u64>>>) -> impl MessageQueueListener {
    let sink = Arc::clone(seen);
    listener_fn(move |message: Arc<dyn Message>| {
        if let Some(value) = message.payload_as::<u64>() {
            sink.lock().push(*value);
        }
        Ok(())
    })
}

/// Dead-letter sink that only counts what it receives
#[derive(Default)]
struct CountingDeadLetters {
    received: AtomicUsize,
    ids: Mutex<Vec<String>>,
}

impl MessageQueue for CountingDeadLetters {
    fn enqueue(&self, message: Arc<dyn Message>) {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.ids.lock().push(message.id().to_string());
    }

    fn register_listener(&self, _listener: Arc<dyn MessageQueueListener>) {}

    fn flush(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn is_empty(&self) -> bool {
        true
    }

    fn close(&self, _flush: bool) -> Result<(), QueueError> {
        Ok(())
    }
}

#[test]
fn test_fifo_order_exactly_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let queue = AsyncMessageQueue::builder()
        .listener(recorder(&seen))
        .build()
        .unwrap();

    for i in 0..1000 {
        queue.enqueue(message(i));
    }
    queue.flush().unwrap();

    assert_eq!(*seen.lock(), (0..1000).collect::<Vec<_>>());
    assert!(queue.is_empty());
}

#[test]
fn test_no_overlapping_deliveries() {
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));

    let (flag, overlap_count, count) =
        (Arc::clone(&in_flight), Arc::clone(&overlaps), Arc::clone(&delivered));
    let queue = Arc::new(
        AsyncMessageQueue::builder()
            .listener(listener_fn(move |_| {
                if flag.swap(true, Ordering::SeqCst) {
                    overlap_count.fetch_add(1, Ordering::SeqCst);
                }
                thread::yield_now();
                count.fetch_add(1, Ordering::SeqCst);
                flag.store(false, Ordering::SeqCst);
                Ok(())
            }))
            .build()
            .unwrap(),
    );

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..250 {
                    queue.enqueue(message(p * 1000 + i));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    queue.flush().unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 1000);
}

#[test]
fn test_per_producer_order_is_kept() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(
        AsyncMessageQueue::builder()
            .listener(recorder(&seen))
            .build()
            .unwrap(),
    );

    let producers: Vec<_> = (0..3u64)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..100 {
                    queue.enqueue(message(p * 1000 + i));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    queue.flush().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 300);
    for p in 0..3u64 {
        let from_producer: Vec<_> = seen.iter().filter(|v| **v / 1000 == p).copied().collect();
        assert_eq!(from_producer, (0..100).map(|i| p * 1000 + i).collect::<Vec<_>>());
    }
}

#[test]
fn test_flush_waits_for_in_flight_dispatch() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&delivered);
    let queue = AsyncMessageQueue::builder()
        .listener(listener_fn(move |_| {
            thread::sleep(Duration::from_millis(2));
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .build()
        .unwrap();

    for i in 0..50 {
        queue.enqueue(message(i));
    }
    queue.flush().unwrap();

    assert!(queue.is_empty());
    assert!(!queue.is_dispatching());
    assert_eq!(queue.len(), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 50);
}

#[test]
fn test_not_empty_while_dispatch_in_flight() {
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let (started, gate) = (Arc::clone(&entered), Arc::clone(&release));
    let queue = AsyncMessageQueue::builder()
        .listener(listener_fn(move |_| {
            started.store(true, Ordering::SeqCst);
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }))
        .build()
        .unwrap();

    queue.enqueue(message(1));
    while !entered.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }

    // The FIFO is drained, but the listener still holds the message
    assert_eq!(queue.len(), 0);
    assert!(queue.is_dispatching());
    assert!(!queue.is_empty());

    release.store(true, Ordering::SeqCst);
    queue.flush().unwrap();
    assert!(queue.is_empty());
    assert!(!queue.is_dispatching());
}

#[test]
fn test_close_with_flush_delivers_everything_before() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let queue = AsyncMessageQueue::builder()
        .listener(recorder(&seen))
        .build()
        .unwrap();

    for i in 0..1000 {
        queue.enqueue(message(i));
    }
    queue.close(true).unwrap();

    for i in 1000..1010 {
        queue.enqueue(message(i));
    }
    thread::sleep(Duration::from_millis(20));

    assert_eq!(seen.lock().len(), 1000);
    assert_eq!(seen.lock().last(), Some(&999));
    assert!(!queue.is_open());
}

#[test]
fn test_close_without_flush_still_drains_admitted() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&delivered);
    let queue = AsyncMessageQueue::builder()
        .listener(listener_fn(move |_| {
            thread::sleep(Duration::from_millis(1));
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .build()
        .unwrap();

    for i in 0..20 {
        queue.enqueue(message(i));
    }
    queue.close(false).unwrap();
    queue.enqueue(message(99));

    // Admitted units are not cancelled by a non-flushing close
    queue.flush().unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 20);
}

#[test]
fn test_drop_closes_with_flush() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let queue = AsyncMessageQueue::builder()
            .listener(recorder(&seen))
            .build()
            .unwrap();
        for i in 0..100 {
            queue.enqueue(message(i));
        }
    }

    assert_eq!(seen.lock().len(), 100);
}

#[test]
fn test_every_failure_reaches_dead_letters() {
    let dead_letters = Arc::new(CountingDeadLetters::default());
    let queue = AsyncMessageQueue::builder()
        .listener(listener_fn(|message| {
            Err(anyhow::anyhow!("cannot handle {}", message.id()))
        }))
        .dead_letters(dead_letters.clone())
        .build()
        .unwrap();

    let sent: Vec<_> = (0..5).map(message).collect();
    for message in &sent {
        queue.enqueue(Arc::clone(message));
    }
    queue.flush().unwrap();

    assert_eq!(dead_letters.received.load(Ordering::SeqCst), 5);
    // The same message instances are forwarded, in order
    let ids: Vec<_> = sent.iter().map(|m| m.id().to_string()).collect();
    assert_eq!(*dead_letters.ids.lock(), ids);
}

#[test]
fn test_dead_letter_queue_is_a_queue() {
    let dead = Arc::new(Mutex::new(Vec::new()));
    let dead_letters = Arc::new(
        AsyncMessageQueue::builder()
            .config(QueueConfig::default().with_worker_name("dead-letters"))
            .listener(recorder(&dead))
            .build()
            .unwrap(),
    );

    let queue = AsyncMessageQueue::builder()
        .listener(listener_fn(|message| {
            match message.payload_as::<u64>() {
                Some(value) if value % 2 == 0 => Ok(()),
                _ => Err(anyhow::anyhow!("odd values are rejected")),
            }
        }))
        .dead_letters(dead_letters.clone())
        .build()
        .unwrap();

    for i in 0..10 {
        queue.enqueue(message(i));
    }
    queue.flush().unwrap();
    dead_letters.flush().unwrap();

    assert_eq!(*dead.lock(), vec![1, 3, 5, 7, 9]);
}

#[test]
fn test_failing_dead_letter_listener_loses_message() {
    let dead_attempts = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&dead_attempts);
    let dead_letters = Arc::new(
        AsyncMessageQueue::builder()
            .listener(listener_fn(move |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("dead letters unavailable"))
            }))
            .build()
            .unwrap(),
    );

    let queue = AsyncMessageQueue::builder()
        .listener(listener_fn(|_| Err(anyhow::anyhow!("primary unavailable"))))
        .dead_letters(dead_letters.clone())
        .build()
        .unwrap();

    for i in 0..3 {
        queue.enqueue(message(i));
    }
    queue.flush().unwrap();
    dead_letters.flush().unwrap();

    // Each message reached the dead-letter listener once and went no further
    assert_eq!(dead_attempts.load(Ordering::SeqCst), 3);
    assert!(dead_letters.is_empty());
}

#[test]
fn test_worker_survives_failures() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&delivered);
    let queue = AsyncMessageQueue::builder()
        .listener(listener_fn(move |message| {
            if message.payload_as::<u64>() == Some(&3) {
                panic!("listener bug");
            }
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .build()
        .unwrap();

    for i in 0..6 {
        queue.enqueue(message(i));
    }
    queue.flush().unwrap();

    assert_eq!(delivered.load(Ordering::SeqCst), 5);
}

#[test]
fn test_config_from_toml_bounds_flush() {
    let config = QueueConfig::from_toml_str(
        r#"
        worker_name = "slow-consumer"
        flush_timeout_ms = 10
        "#,
    )
    .unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let queue = AsyncMessageQueue::builder()
        .config(config)
        .listener(listener_fn(move |_| {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }))
        .build()
        .unwrap();

    queue.enqueue(message(1));
    queue.enqueue(message(2));

    match queue.flush() {
        Err(QueueError::FlushTimedOut { remaining, .. }) => assert!(remaining <= 2),
        other => panic!("expected a flush timeout, got {other:?}"),
    }

    release.store(true, Ordering::SeqCst);
    while !queue.is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
    queue.close(true).unwrap();
}
