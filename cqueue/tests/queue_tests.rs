use freshet_cqueue::{QueueError, RingBuffer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[tokio::test]
async fn test_fifo_order() {
    let queue = RingBuffer::new(4096);
    let mut consumer = queue.attach_consumer().unwrap();

    for i in 0..100u32 {
        queue.push(&i.to_le_bytes()).await.unwrap();
    }
    for i in 0..100u32 {
        let payload = consumer.peek_next().expect("slot missing");
        assert_eq!(payload, i.to_le_bytes());
    }
    assert!(consumer.peek_next().is_none());
    consumer.pop_seen();
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_wrapping_payloads_stay_contiguous() {
    // small arena so pushes wrap often
    let queue = RingBuffer::new(256);
    let mut consumer = queue.attach_consumer().unwrap();

    for round in 0..64u8 {
        let payload = vec![round; 100];
        queue.push(&payload).await.unwrap();
        let seen = consumer.peek_next().expect("slot missing");
        assert_eq!(seen, payload.as_slice());
        consumer.pop_seen();
    }
}

#[tokio::test]
async fn test_push_too_large_fails() {
    let queue = RingBuffer::new(128);
    let result = queue.push(&[0u8; 256]).await;
    assert!(matches!(result, Err(QueueError::TooLarge { .. })));
}

#[tokio::test]
async fn test_backpressure_blocks_until_pop() {
    let queue = RingBuffer::new(256);
    let mut consumer = queue.attach_consumer().unwrap();

    // fill the queue almost to capacity
    queue.push(&[1u8; 100]).await.unwrap();
    queue.push(&[2u8; 100]).await.unwrap();

    let producer_queue = Arc::clone(&queue);
    let blocked = tokio::spawn(async move { producer_queue.push(&[3u8; 100]).await });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "push should be waiting for space");

    // drain one slot; the blocked push must now complete without
    // corrupting its neighbors
    assert_eq!(consumer.peek_next().unwrap(), [1u8; 100]);
    consumer.pop_seen();
    blocked.await.unwrap().unwrap();

    assert_eq!(consumer.peek_next().unwrap(), [2u8; 100]);
    assert_eq!(consumer.peek_next().unwrap(), [3u8; 100]);
    consumer.pop_seen();
}

#[tokio::test]
async fn test_consumer_is_exclusive() {
    let queue = RingBuffer::new(256);
    let _consumer = queue.attach_consumer().unwrap();
    assert!(matches!(
        queue.attach_consumer(),
        Err(QueueError::ConsumerTaken)
    ));
}

#[tokio::test]
async fn test_close_wakes_blocked_producer() {
    let queue = RingBuffer::new(128);
    let _consumer = queue.attach_consumer().unwrap();
    queue.push(&[0u8; 80]).await.unwrap();

    let producer_queue = Arc::clone(&queue);
    let blocked = tokio::spawn(async move { producer_queue.push(&[1u8; 80]).await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    queue.close();
    assert!(matches!(blocked.await.unwrap(), Err(QueueError::Closed)));
}

#[tokio::test]
async fn test_pop_hook_sees_every_payload() {
    let seen = Arc::new(AtomicU64::new(0));
    let hook_seen = seen.clone();
    let queue = RingBuffer::with_handlers(
        4096,
        Some(Box::new(move |payload: &[u8]| {
            hook_seen.fetch_add(payload.len() as u64, Ordering::Relaxed);
        })),
        None,
    );
    let mut consumer = queue.attach_consumer().unwrap();

    let mut pushed = 0u64;
    for i in 1..=10usize {
        queue.push(&vec![0u8; i]).await.unwrap();
        pushed += i as u64;
    }
    while consumer.peek_next().is_some() {}
    consumer.pop_seen();
    assert_eq!(seen.load(Ordering::Relaxed), pushed);
}

/// Random-size pushes interleaved with random-delay pops; the consumer must
/// observe every byte pattern exactly once, in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fuzz_interleaved_push_pop() {
    const OPS: u64 = 1_000_000;

    let queue = RingBuffer::new(1 << 16);
    let mut consumer = queue.attach_consumer().unwrap();

    let producer_queue = Arc::clone(&queue);
    let producer = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(0xfeed);
        for seq in 0..OPS {
            let len = rng.gen_range(1..=1024usize);
            // tag every slot with its sequence number and a fill pattern
            let mut body = seq.to_le_bytes().to_vec();
            body.extend(std::iter::repeat_n((seq % 251) as u8, len));
            producer_queue.push(&body).await.unwrap();
        }
        producer_queue.close();
    });

    let mut expected: u64 = 0;
    let mut rng = StdRng::seed_from_u64(0xbeef);
    loop {
        match consumer.sleep_if_empty().await {
            Ok(()) => {}
            Err(QueueError::Closed) => {
                // drain whatever is left after close
                while let Some(payload) = consumer.peek_next() {
                    check_payload(payload, expected);
                    expected += 1;
                }
                consumer.pop_seen();
                if expected == OPS {
                    break;
                }
                continue;
            }
            Err(e) => panic!("unexpected queue error: {e}"),
        }
        let batch = rng.gen_range(1..64);
        for _ in 0..batch {
            let Some(payload) = consumer.peek_next() else {
                break;
            };
            check_payload(payload, expected);
            expected += 1;
        }
        consumer.pop_seen();
        if rng.gen_bool(0.01) {
            tokio::task::yield_now().await;
        }
    }

    assert_eq!(expected, OPS);
    producer.await.unwrap();
}

fn check_payload(payload: &[u8], expected_seq: u64) {
    assert!(payload.len() >= 8, "slot too short");
    let seq = u64::from_le_bytes(payload[..8].try_into().unwrap());
    assert_eq!(seq, expected_seq, "out-of-order slot");
    let fill = (seq % 251) as u8;
    assert!(
        payload[8..].iter().all(|b| *b == fill),
        "corrupted slot body"
    );
}
