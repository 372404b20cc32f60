use freshet_common::wire::decode_cbor;
use freshet_cqueue::{Consumer, QueueError};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

/// A bounded batch of queue payloads. The slots backing it stay in the ring
/// buffer until `release` runs at batch end.
pub struct Microbatch<T> {
    pub tuples: Vec<T>,
    pub bytes: usize,
}

impl<T> Microbatch<T> {
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }
}

/// Blocks until at least one payload is available, then keeps pulling until
/// the batch is full or `max_wait` has elapsed.
pub async fn read_batch<T: DeserializeOwned>(
    consumer: &mut Consumer,
    max_tuples: usize,
    max_wait: Duration,
) -> Result<Microbatch<T>, QueueError> {
    consumer.sleep_if_empty().await?;

    let deadline = tokio::time::Instant::now() + max_wait;
    let mut tuples = Vec::new();
    let mut bytes = 0usize;

    loop {
        while tuples.len() < max_tuples {
            let Some(payload) = consumer.peek_next() else {
                break;
            };
            bytes += payload.len();
            match decode_cbor::<T>(payload) {
                Ok(tuple) => tuples.push(tuple),
                Err(e) => warn!("dropping undecodable queue payload: {e:#}"),
            }
        }
        if tuples.len() >= max_tuples {
            break;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        if !consumer.wait_unread(remaining).await? {
            break;
        }
    }

    Ok(Microbatch { tuples, bytes })
}

/// Releases the ring-buffer range the batch occupied.
pub fn release(consumer: &mut Consumer) {
    consumer.pop_seen();
}
