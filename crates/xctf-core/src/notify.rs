//! User-facing notifications: persisted (`store::insert_notification`) and
//! pushed live over the shared KV store's pubsub, mirroring
//! `original_source/notifications/views.py::publish_notification`, which
//! writes to Postgres then `redis_client.publish("notifications:{user_id}", ...)`
//! for the SSE stream to pick up.

use redis::AsyncCommands;
use serde::Serialize;

use crate::error::Result;
use crate::store::Store;

#[derive(Serialize)]
struct NotificationPayload<'a> {
    message: &'a str,
}

#[derive(Clone)]
pub struct Notifier {
    client: redis::Client,
    store: Store,
}

impl Notifier {
    pub fn new(redis_url: &str, store: Store) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            store,
        })
    }

    pub async fn notify(&self, user_id: i64, message: &str) -> Result<()> {
        self.store.insert_notification(user_id, message).await?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(&NotificationPayload { message })
            .unwrap_or_else(|_| message.to_string());
        let _: () = conn.publish(format!("notifications:{user_id}"), payload).await?;
        Ok(())
    }
}
