//! Server side of the polling protocol.
//!
//! A poll is a side-effect-free read apart from the consumer's delivered-set:
//! it never holds the request open and never fails on a store error.

use tracing::debug;

use crate::{
    dedup::Consumer,
    error::ValidationError,
    types::{AppState, PollResponse},
};

/// Returns the messages `consumer` has not been handed yet, strictly after
/// `last_timestamp`.
///
/// `server_timestamp` is read before the ledger so a message appended while
/// the read runs is never behind the timestamp the client may fall back to.
/// An unknown identity is not an error; it simply has no messages.
pub async fn poll(
    state: &AppState,
    consumer: &Consumer,
    last_timestamp: i64,
) -> Result<PollResponse, ValidationError> {
    let identity_id = consumer.identity_id();
    if identity_id.trim().is_empty() {
        return Err(ValidationError::MissingIdentity);
    }

    let server_timestamp = state.clock.now_millis();
    let batch = state.ledger.get_new_since(identity_id, last_timestamp).await;
    let fetched = batch.len();
    let messages = state.delivery.filter_undelivered(consumer, batch);
    if fetched != messages.len() {
        debug!(
            consumer = %consumer,
            suppressed = fetched - messages.len(),
            "already delivered messages filtered"
        );
    }

    Ok(PollResponse {
        messages,
        server_timestamp,
    })
}
