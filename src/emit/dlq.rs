use bytes::Bytes;
use deadpool_redis::Pool;
use tracing::info;

use crate::errors::ConsumerError;
use crate::types::fp::append_entry;

/// One dead-lettered message as written to the dead-letter stream.
#[derive(Debug, Clone)]
pub struct DeadLetterRecord<'a> {
    pub message_id: &'a str,
    pub delivery_count: u32,
    pub reason: &'a str,
    pub description: &'a str,
    pub payload: &'a Bytes,
}

pub async fn publish(
    pool: &Pool,
    stream: &str,
    rec: &DeadLetterRecord<'_>,
) -> Result<String, ConsumerError> {
    let count = rec.delivery_count.to_string();
    let entry = append_entry(
        pool,
        stream,
        &[
            ("message_id", rec.message_id.as_bytes()),
            ("delivery_count", count.as_bytes()),
            ("reason", rec.reason.as_bytes()),
            ("description", rec.description.as_bytes()),
            ("payload", &rec.payload[..]),
        ],
    )
    .await?;
    info!(stream = %stream, reason = %rec.reason, message_id = %rec.message_id, "published to dlq");
    Ok(entry)
}
