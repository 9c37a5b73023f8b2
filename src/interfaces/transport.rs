use std::time::Duration;

use async_trait::async_trait;

use crate::domains::message::Message;
use crate::error::Result;

/// Contract every broker adapter satisfies. Receive loops are spawned when
/// the transport is constructed and run until `close`; they extract the
/// correlation id from wherever the broker carries it and hand decoded
/// replies to the shared `CommandRegistry`.
///
/// `publish` is best-effort: it returns `TransportUnavailable` when the
/// underlying client was never initialized and `PublishFailure` on a
/// write or serialization error. Retry and fallback belong to the
/// dispatcher, never to the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// The timeout bounds per-call listeners (pub/sub subscriptions, bridge
    /// polling); stream and topic transports ignore it.
    async fn publish(&self, server_key: &str, message: &Message, timeout: Duration) -> Result<()>;

    /// Stops the receive loop and releases broker resources. Idempotent.
    async fn close(&self);
}
