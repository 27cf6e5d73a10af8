//! Upstream channel subscriptions.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::dispatcher::{Handler, HandlerRegistry};
use crate::error::GatewayError;
use crate::event::StreamEvent;
use crate::gateway::StreamTransport;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Registers handlers with the dispatcher and subscribes upstream.
///
/// `subscribe` is optimistic: it returns once the request is written and does
/// not wait for the exchange to acknowledge. The acknowledgement is awaited in
/// the background and only logged.
pub struct UpstreamSubscriptions {
    handlers: Arc<HandlerRegistry>,
    transport: Arc<dyn StreamTransport>,
    ack_timeout: Duration,
}

impl UpstreamSubscriptions {
    pub fn new(handlers: Arc<HandlerRegistry>, transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            handlers,
            transport,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Register `handler` for `channel` and send the subscribe request.
    ///
    /// The handler is in place before the request goes out, so events that
    /// beat the acknowledgement are still delivered. If the request cannot be
    /// written the registration is rolled back.
    pub async fn subscribe<F>(&self, channel: Channel, handler: F) -> Result<(), GatewayError>
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        self.subscribe_handler(channel, Arc::new(handler)).await
    }

    pub async fn subscribe_handler(&self, channel: Channel, handler: Handler) -> Result<(), GatewayError> {
        if !self.transport.is_connected() {
            warn!(channel = %channel, "cannot subscribe: upstream not connected");
            return Err(GatewayError::NotConnected);
        }

        let previous = self.handlers.insert(channel.clone(), handler);
        let name = channel.to_string();

        let reply = match self
            .transport
            .send_request(channel.subscribe_method(), json!({ "channels": [name] }))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                match previous {
                    Some(prev) => {
                        self.handlers.insert(channel.clone(), prev);
                    }
                    None => {
                        self.handlers.remove(&channel);
                    }
                }
                warn!(channel = %name, error = %e, "subscribe request failed");
                return Err(e);
            }
        };

        info!(channel = %name, id = reply.id(), "subscribe sent");

        let timeout = self.ack_timeout;
        tokio::spawn(async move {
            match reply.wait(timeout).await {
                Ok(result) => info!(channel = %name, result = %result, "subscription acknowledged"),
                Err(e) => warn!(channel = %name, error = %e, "subscription not acknowledged"),
            }
        });

        Ok(())
    }

    /// Remove the handler and send the unsubscribe without waiting for an
    /// answer. Returns whether a handler was registered.
    pub async fn unsubscribe(&self, channel: &Channel) -> bool {
        let removed = self.handlers.remove(channel).is_some();
        let name = channel.to_string();

        if !self.transport.is_connected() {
            debug!(channel = %name, "upstream not connected, skipping unsubscribe request");
            return removed;
        }

        match self
            .transport
            .send_request(channel.unsubscribe_method(), json!({ "channels": [name] }))
            .await
        {
            Ok(reply) => debug!(channel = %name, id = reply.id(), "unsubscribe sent"),
            Err(e) => warn!(channel = %name, error = %e, "unsubscribe request failed"),
        }
        removed
    }

    pub async fn unsubscribe_all(&self) -> usize {
        let channels = self.handlers.channels();
        for channel in &channels {
            self.unsubscribe(channel).await;
        }
        channels.len()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.handlers.channels()
    }

    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.handlers.contains(channel)
    }
}
