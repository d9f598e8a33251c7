//! Sends while offline, then reconnects and watches the outbox drain.
//!
//! Needs SUPABASE_URL, SUPABASE_API_KEY, CHAT_USER_ID and CHAT_PEER_ID.
//! Conversations are cached under `./.chat-cache`, so queued messages
//! survive restarting the demo.

use chat_realtime_rs::{
    CoordinatorBuilder, CoordinatorOptions, FileStore, SupabaseOptions, SupabaseService,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let user = std::env::var("CHAT_USER_ID")?;
    let peer = std::env::var("CHAT_PEER_ID")?;

    let remote = Arc::new(SupabaseService::new(SupabaseOptions::from_env()?)?);
    let store = Arc::new(FileStore::open(".chat-cache")?);
    let coordinator =
        CoordinatorBuilder::new(remote, store, CoordinatorOptions::for_user(user))?.build();
    coordinator.start().await?;

    println!("Going offline");
    coordinator.set_network_online(false).await;
    for i in 1..=3 {
        coordinator
            .send(&peer, &format!("offline message {}", i), None)
            .await?;
    }
    for message in coordinator.get_conversation(&peer) {
        println!("  {} [{:?}] {}", message.id, message.status, message.content);
    }

    println!("Back online");
    coordinator.set_network_online(true).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    for message in coordinator.get_conversation(&peer) {
        println!("  {} [{:?}] {}", message.id, message.status, message.content);
    }
    for failed in coordinator.pending_messages() {
        println!(
            "still queued: {} ({:?}, {} attempts, last error: {:?})",
            failed.id, failed.state, failed.attempts, failed.last_error
        );
    }

    coordinator.shutdown().await;
    Ok(())
}
