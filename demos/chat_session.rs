//! Live chat session against a Supabase project.
//!
//! Needs SUPABASE_URL, SUPABASE_API_KEY, CHAT_USER_ID and CHAT_PEER_ID
//! (a `.env` file works). Run with `RUST_LOG=chat_realtime_rs=debug` to
//! see channel and outbox activity.

use chat_realtime_rs::{
    CoordinatorBuilder, CoordinatorOptions, MemoryStore, SubscriberEvent, SubscriptionDescriptor,
    SupabaseOptions, SupabaseService, TableFilter, Visibility,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let user = std::env::var("CHAT_USER_ID")?;
    let peer = std::env::var("CHAT_PEER_ID")?;

    let remote = Arc::new(SupabaseService::new(SupabaseOptions::from_env()?)?);
    let coordinator = CoordinatorBuilder::new(
        remote,
        Arc::new(MemoryStore::new()),
        CoordinatorOptions::for_user(user.clone()),
    )?
    .build();

    coordinator.on_invalidate(|key| println!("invalidate: {}", key));
    coordinator.start().await?;

    // A screen listening to the notifications table
    let _notifications = coordinator
        .listen(
            SubscriptionDescriptor::new("notifications")
                .table(TableFilter::new("notifications").row_filter(format!("user_id=eq.{}", user))),
            |event| {
                if let SubscriberEvent::Change(change) = event {
                    println!("notification {:?}: {:?}", change.kind, change.new_value);
                }
                Ok(())
            },
        )
        .await?;

    let mut connectivity = coordinator.connectivity();
    tokio::spawn(async move {
        while connectivity.changed().await.is_ok() {
            println!("connectivity: {:?}", *connectivity.borrow_and_update());
        }
    });

    coordinator.set_viewing(Some(peer.as_str()));
    coordinator.set_visibility(Visibility::Foreground).await?;
    coordinator.keystroke(&peer).await;
    let pending = coordinator.send(&peer, "hello from the chat demo", None).await?;
    println!("queued {}", pending.id);

    tokio::time::sleep(Duration::from_secs(5)).await;
    for message in coordinator.get_conversation(&peer) {
        println!("[{:?}] {} -> {}: {}", message.status, message.sender_id, message.recipient_id, message.content);
    }
    println!("{} is {}", peer, coordinator.get_status(&peer));
    println!("{} typing: {}", peer, coordinator.is_typing(&peer));

    tokio::signal::ctrl_c().await?;
    coordinator.shutdown().await;
    Ok(())
}
