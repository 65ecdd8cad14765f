//! # Custom Channel Example
//!
//! Shows how to implement [`RealtimeChannel`] and [`Connector`] with an
//! in-process loopback "server". This is useful for:
//!
//! - **Testing** application logic without a Respoke account
//! - **Custom backends** that carry Respoke calls over another socket layer
//!
//! The loopback acknowledges the connection registration, then echoes every
//! group publish back as a `pubsub` event.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example custom_channel
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use respoke_client::channel::{
    ChannelEvent, ChannelEventKind, ChannelHandler, ConnectParams, Connector, RealtimeChannel,
    Verb,
};
use respoke_client::{ConnectOptions, RespokeClient, RespokeConfig, RespokeError, RespokeEvent};
use serde_json::{json, Value};

// ─────────────────────────────────────────────────────────────────────
// Step 1: A loopback channel
// ─────────────────────────────────────────────────────────────────────

/// A channel whose "server" lives in the same process.
#[derive(Default)]
struct LoopbackChannel {
    handlers: Mutex<HashMap<ChannelEventKind, Vec<ChannelHandler>>>,
}

impl LoopbackChannel {
    fn fire(&self, event: ChannelEvent) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

#[async_trait]
impl RealtimeChannel for LoopbackChannel {
    fn on(&self, kind: ChannelEventKind, handler: ChannelHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::clone(&handler));
        // The loopback is "up" as soon as someone listens for it.
        if kind == ChannelEventKind::Connect {
            handler(ChannelEvent::Connect);
        }
    }

    async fn emit(&self, verb: Verb, payload: String) -> Result<String, RespokeError> {
        let envelope: Value = serde_json::from_str(&payload)?;
        let url = envelope["url"].as_str().unwrap_or_default();
        println!("server <- {verb} {url}");

        if url.ends_with("/connections") {
            let reply = json!({ "id": "loop-1", "endpointId": envelope["data"]["endpointId"] });
            return Ok(reply.to_string());
        }
        if verb == Verb::Post && url.ends_with("/publish") {
            let group = url
                .rsplit('/')
                .nth(1)
                .unwrap_or_default()
                .to_string();
            self.fire(ChannelEvent::Pubsub(json!({
                "header": { "channel": group, "from": envelope["data"]["endpointId"] },
                "message": envelope["data"]["message"],
            })));
        }
        Ok(json!({}).to_string())
    }

    async fn disconnect(&self) -> Result<(), RespokeError> {
        self.fire(ChannelEvent::Disconnect);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A connector handing out loopback channels
// ─────────────────────────────────────────────────────────────────────

struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        url: &str,
        _params: &ConnectParams,
    ) -> Result<Arc<dyn RealtimeChannel>, RespokeError> {
        println!("opening loopback channel for {url}");
        Ok(Arc::new(LoopbackChannel::default()))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Drive a client over it
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RespokeConfig::new()
        .with_app_secret("loopback-secret")
        .with_endpoint_id("alice")
        .with_connector(Arc::new(LoopbackConnector));
    let mut client = RespokeClient::new(config);
    let mut events = client.subscribe();

    client.connect(ConnectOptions::new())?;

    while let Some(event) = events.recv().await {
        match event {
            RespokeEvent::Connect => {
                println!("connected as {}", client.endpoint_id().unwrap_or_default());
                client.groups().join("lobby").await?;
                client.groups().publish("lobby", "hello, loopback").await?;
            }
            RespokeEvent::Pubsub(publication) => {
                // The group id arrives normalized under `groupId`.
                println!(
                    "pubsub in {}: {}",
                    publication["header"]["groupId"], publication["message"]
                );
                break;
            }
            other => println!("event: {other:?}"),
        }
    }

    client.close().await?;
    client.shutdown().await;
    Ok(())
}
