//! # Admin Connect Example
//!
//! Demonstrates a Respoke client acting as a trusted server-side endpoint:
//!
//! 1. Connect over socket.io with the App-Secret and a fixed endpoint id
//! 2. Join a group and publish to it
//! 3. Log messages, presence and group traffic
//! 4. Reconnect automatically if the socket drops
//! 5. Shut down gracefully on Ctrl+C
//!
//! ## Running
//!
//! ```sh
//! RESPOKE_APP_SECRET=... cargo run --example admin_connect
//!
//! # Override the endpoint id or group:
//! RESPOKE_ENDPOINT_ID=bot RESPOKE_GROUP=lobby cargo run --example admin_connect
//! ```

use respoke_client::{
    ConnectOptions, OutgoingMessage, PresenceUpdate, RespokeClient, RespokeConfig, RespokeEvent,
};

const DEFAULT_ENDPOINT_ID: &str = "admin-bot";
const DEFAULT_GROUP: &str = "lobby";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let app_secret = std::env::var("RESPOKE_APP_SECRET")?;
    let endpoint_id =
        std::env::var("RESPOKE_ENDPOINT_ID").unwrap_or_else(|_| DEFAULT_ENDPOINT_ID.to_string());
    let group = std::env::var("RESPOKE_GROUP").unwrap_or_else(|_| DEFAULT_GROUP.to_string());

    let config = RespokeConfig::new()
        .with_app_secret(app_secret)
        .with_endpoint_id(endpoint_id.clone())
        .with_autoreconnect(true);
    let mut client = RespokeClient::new(config);
    let mut events = client.subscribe();

    // ── Connect ─────────────────────────────────────────────────────
    client.connect(ConnectOptions::new().with_client_type("rust"))?;
    tracing::info!("Connecting as {endpoint_id}");

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event stream closed, exiting");
                    break;
                };

                match event {
                    RespokeEvent::Connect => {
                        tracing::info!(
                            "Connected (connection {})",
                            client.connection_id().unwrap_or_default()
                        );
                        client.presence().set(PresenceUpdate::new("available")).await?;
                        client.groups().join(&group).await?;
                        client.groups().publish(&group, "hello from rust").await?;
                    }

                    RespokeEvent::Message(message) => {
                        tracing::info!("Message: {message}");
                        if let Some(from) = message["header"]["from"].as_str() {
                            let reply = OutgoingMessage::new(from, "got it");
                            client.messages().send(reply).await?;
                        }
                    }

                    RespokeEvent::Pubsub(publication) => {
                        tracing::info!("Group publication: {publication}");
                    }

                    RespokeEvent::Join(join) | RespokeEvent::Leave(join) => {
                        tracing::info!("Membership change: {join}");
                    }

                    RespokeEvent::Presence(presence) => {
                        tracing::info!("Presence: {presence}");
                    }

                    RespokeEvent::Disconnect => {
                        tracing::warn!("Disconnected, autoreconnect will retry");
                    }

                    RespokeEvent::Error(err) => {
                        tracing::error!("Error: {err}");
                    }

                    other => {
                        tracing::debug!("Event: {other:?}");
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    client.close().await?;
    client.shutdown().await;
    tracing::info!("Client shut down");
    Ok(())
}
