// =============================================================================
// broker.rs — REDIS STREAMS AS THE EVENT BUS
// =============================================================================
//
// Every topic is a Redis stream whose entries carry two fields, `key` (the
// ordering key) and `value` (the JSON payload). Consumption goes through a
// consumer group so an entry stays pending until it is acknowledged.
//
// Lifecycle, all explicit:
//
// 1. `connect` opens two connections. Reads block for `read_block`, and a
//    blocked connection would stall every ack and publish queued behind it,
//    so those get their own connection manager.
// 2. `subscribe` creates each group at id 0 with MKSTREAM. A new group
//    therefore replays every stream from the beginning. BUSYGROUP is fine.
// 3. `fetch` first pages through this consumer's own pending entries (the
//    backlog left by a crash), then switches to new entries (`>`).
// 4. `ack` is XACK, `publish` is XADD.
// 5. `rewind` sends every stream back through step 3, which is how entries
//    left pending by a transient failure get another turn.
// 6. `disconnect` drops both connections. Later calls fail with
//    `NotConnected`.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::models::ActivityEvent;

/// One stream entry as handed to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: String,
    /// Ordering key. Entries with equal keys are handled in stream order.
    pub key: String,
    /// JSON payload. `None` when the entry was trimmed from the stream while
    /// still pending.
    pub value: Option<String>,
}

/// Where the router gets its events from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Join the consumer group on every topic.
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Next batch of entries. May return an empty vec after blocking.
    async fn fetch(&self) -> Result<Vec<StreamEntry>, BrokerError>;

    async fn ack(&self, entry: &StreamEntry) -> Result<(), BrokerError>;

    /// Re-read this consumer's unacknowledged entries on the next fetch.
    /// Entries that failed transiently come back this way.
    async fn rewind(&self);

    async fn disconnect(&self);
}

/// Where the completion notifier sends activity events.
#[async_trait]
pub trait ActivityPublisher: Send + Sync {
    async fn publish_activity(&self, event: &ActivityEvent) -> Result<(), BrokerError>;
}

pub struct RedisBroker {
    reader: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    writer: Mutex<Option<ConnectionManager>>,
    group: String,
    consumer: String,
    activity_topic: String,
    read_count: usize,
    read_block: Duration,
    /// Streams still draining their pending backlog, with the last id seen.
    backlog: Mutex<HashMap<String, String>>,
    /// Streams reading new entries.
    live: Mutex<Vec<String>>,
}

pub struct BrokerSettings<'a> {
    pub redis_url: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub activity_topic: &'a str,
    pub read_count: usize,
    pub read_block: Duration,
}

impl RedisBroker {
    pub async fn connect(settings: BrokerSettings<'_>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(settings.redis_url)?;
        let reader = client.get_multiplexed_async_connection().await?;
        let writer = ConnectionManager::new(client).await?;

        info!(
            group = settings.group,
            consumer = settings.consumer,
            "Connected to Redis streams"
        );

        Ok(Self {
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            group: settings.group.to_string(),
            consumer: settings.consumer.to_string(),
            activity_topic: settings.activity_topic.to_string(),
            read_count: settings.read_count.max(1),
            read_block: settings.read_block,
            backlog: Mutex::new(HashMap::new()),
            live: Mutex::new(Vec::new()),
        })
    }

    fn writer(&self) -> Result<ConnectionManager, BrokerError> {
        self.writer.lock().clone().ok_or(BrokerError::NotConnected)
    }

    /// XADD `value` as JSON under `key`. Returns the new entry id.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<String, BrokerError> {
        let json = serde_json::to_string(value)?;
        let mut con = self.writer()?;
        let id: String = con
            .xadd(topic, "*", &[("key", key), ("value", json.as_str())])
            .await?;
        debug!(topic, key, entry_id = %id, "Published stream entry");
        Ok(id)
    }

    async fn read(
        &self,
        streams: &[String],
        ids: &[String],
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.read_count);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }

        let mut guard = self.reader.lock().await;
        let con = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        let reply: Option<StreamReadReply> = con.xread_options(streams, ids, &opts).await?;

        Ok(reply.map(flatten_reply).unwrap_or_default())
    }

    async fn fetch_backlog(&self) -> Result<Option<Vec<StreamEntry>>, BrokerError> {
        let cursors: Vec<(String, String)> = self
            .backlog
            .lock()
            .iter()
            .map(|(s, id)| (s.clone(), id.clone()))
            .collect();
        if cursors.is_empty() {
            return Ok(None);
        }

        let (streams, ids): (Vec<String>, Vec<String>) = cursors.into_iter().unzip();
        let entries = self.read(&streams, &ids, None).await?;

        let mut backlog = self.backlog.lock();
        let mut live = self.live.lock();
        for stream in &streams {
            match entries.iter().rev().find(|e| &e.stream == stream) {
                Some(last) => {
                    backlog.insert(stream.clone(), last.id.clone());
                }
                None => {
                    backlog.remove(stream);
                    live.push(stream.clone());
                    debug!(stream = %stream, "Pending backlog drained, reading new entries");
                }
            }
        }

        Ok(Some(entries))
    }
}

/// Turns an XREADGROUP reply into entries, stream by stream in reply order.
fn flatten_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
    let mut entries = Vec::new();
    for stream in reply.keys {
        for item in stream.ids {
            entries.push(StreamEntry {
                stream: stream.key.clone(),
                key: item.get::<String>("key").unwrap_or_default(),
                value: item.get::<String>("value"),
                id: item.id,
            });
        }
    }
    entries
}

#[async_trait]
impl EventSource for RedisBroker {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut con = self.writer()?;
        for topic in topics {
            let created: redis::RedisResult<()> =
                con.xgroup_create_mkstream(topic, &self.group, "0").await;
            match created {
                Ok(()) => info!(topic = %topic, group = %self.group, "Consumer group created"),
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    debug!(topic = %topic, group = %self.group, "Consumer group already exists")
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut backlog = self.backlog.lock();
        backlog.clear();
        for topic in topics {
            backlog.insert(topic.clone(), "0".to_string());
        }
        self.live.lock().clear();
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<StreamEntry>, BrokerError> {
        if let Some(entries) = self.fetch_backlog().await? {
            if !entries.is_empty() {
                return Ok(entries);
            }
        }

        let streams = self.live.lock().clone();
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let ids = vec![">".to_string(); streams.len()];
        self.read(&streams, &ids, Some(self.read_block)).await
    }

    async fn ack(&self, entry: &StreamEntry) -> Result<(), BrokerError> {
        let mut con = self.writer()?;
        let acked: u64 = con.xack(&entry.stream, &self.group, &[&entry.id]).await?;
        if acked == 0 {
            debug!(stream = %entry.stream, entry_id = %entry.id, "Entry was already acknowledged");
        }
        Ok(())
    }

    async fn rewind(&self) {
        let mut backlog = self.backlog.lock();
        let mut live = self.live.lock();
        for stream in live.drain(..) {
            backlog.insert(stream, "0".to_string());
        }
        debug!(streams = backlog.len(), "Rewound to pending entries");
    }

    async fn disconnect(&self) {
        self.reader.lock().await.take();
        self.writer.lock().take();
        info!("Disconnected from Redis streams");
    }
}

#[async_trait]
impl ActivityPublisher for RedisBroker {
    async fn publish_activity(&self, event: &ActivityEvent) -> Result<(), BrokerError> {
        match self
            .publish(&self.activity_topic, &event.target_action_id, event)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(topic = %self.activity_topic, error = %e, "Activity publish failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::streams::{StreamId, StreamKey};
    use redis::Value;

    fn item(id: &str, key: &str, value: Option<&str>) -> StreamId {
        let mut map = HashMap::new();
        map.insert("key".to_string(), Value::BulkString(key.as_bytes().to_vec()));
        if let Some(v) = value {
            map.insert("value".to_string(), Value::BulkString(v.as_bytes().to_vec()));
        }
        StreamId { id: id.to_string(), map }
    }

    #[test]
    fn test_flatten_reply_keeps_stream_order() {
        let reply = StreamReadReply {
            keys: vec![
                StreamKey {
                    key: "campaign-batch-data".into(),
                    ids: vec![item("1-0", "c1", Some("{}")), item("2-0", "c1", Some("{}"))],
                },
                StreamKey {
                    key: "message-log".into(),
                    ids: vec![item("1-0", "c2", None)],
                },
            ],
        };

        let entries = flatten_reply(reply);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[1].id, "2-0");
        assert_eq!(entries[2].stream, "message-log");
        assert_eq!(entries[2].key, "c2");
        assert_eq!(entries[2].value, None);
    }
}
