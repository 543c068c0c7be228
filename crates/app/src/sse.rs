use std::{
    collections::{HashMap, HashSet, VecDeque},
    convert::Infallible,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::response::sse::Event;
use metrics::{counter, gauge};
use serde_json::to_string;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

use stockflow_core::notification::Notification;
use stockflow_storage::{Database, NotificationRepoError};

const EVENT_NAME: &str = "notification";
const BROADCAST_BUFFER: usize = 256;
const DB_BACKLOG_LIMIT: i64 = 500;

/// Per-user fan-out of notifications with a bounded replay ring.
#[derive(Clone)]
pub struct NotificationHub {
    database: Database,
    channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    ring_max: usize,
    ring_ttl: Duration,
    clients: Arc<AtomicUsize>,
}

impl NotificationHub {
    pub fn new(database: Database, ring_max: usize, ring_ttl: Duration) -> Self {
        Self {
            database,
            channels: Arc::new(RwLock::new(HashMap::new())),
            ring_max: ring_max.max(1),
            ring_ttl,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn ensure_channel(&self, user_id: &str) -> Arc<Channel> {
        if let Some(channel) = self.channels.read().await.get(user_id) {
            return channel.clone();
        }
        let mut guard = self.channels.write().await;
        guard
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Channel::new()))
            .clone()
    }

    /// Appends to the recipient's ring and wakes its live subscribers.
    pub async fn publish(&self, notification: &Notification) -> Result<(), SseError> {
        let message = Arc::new(SseMessage::from_notification(notification)?);
        let channel = self.ensure_channel(&notification.recipient_id).await;
        channel
            .ring
            .lock()
            .await
            .insert(message.clone(), self.ring_max, self.ring_ttl);
        // Nobody listening is fine; the ring and the database hold the message.
        let _ = channel.sender.send(message);
        Ok(())
    }

    /// Attaches a live receiver and computes the replay from the ring.
    ///
    /// When `since` predates what the ring can vouch for, the subscription is
    /// flagged as a ring miss and carries no backlog; the caller reloads it
    /// with [`NotificationHub::load_backlog`].
    pub async fn subscribe(&self, user_id: &str, since: Option<i64>) -> Subscription {
        let channel = self.ensure_channel(user_id).await;
        let receiver = BroadcastStream::new(channel.sender.subscribe());

        let (snapshot, watermark) = {
            let ring = channel.ring.lock().await;
            (
                ring.messages.iter().cloned().collect::<Vec<_>>(),
                ring.watermark,
            )
        };

        let ring_miss = match (since, watermark) {
            (Some(since), Some(watermark)) => since < watermark,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if ring_miss {
            counter!("sse_ring_miss_total").increment(1);
        }

        let backlog = match since {
            Some(since) if !ring_miss => snapshot
                .into_iter()
                .filter(|msg| msg.seq > since)
                .collect(),
            _ => Vec::new(),
        };

        Subscription {
            backlog,
            receiver,
            since,
            guard: ClientGuard::new(self.clients.clone()),
            ring_miss,
        }
    }

    /// Reads notifications newer than `since` for `user_id` from the database.
    pub async fn load_backlog(
        &self,
        user_id: &str,
        since: i64,
    ) -> Result<Vec<Arc<SseMessage>>, SseError> {
        let notifications = self
            .database
            .notifications()
            .list_since(user_id, since, DB_BACKLOG_LIMIT)
            .await?;
        notifications
            .iter()
            .map(|notification| SseMessage::from_notification(notification).map(Arc::new))
            .collect::<Result<_, _>>()
            .map_err(SseError::from)
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

struct Channel {
    sender: broadcast::Sender<Arc<SseMessage>>,
    ring: Mutex<Ring>,
}

impl Channel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            sender,
            ring: Mutex::new(Ring::default()),
        }
    }
}

/// `messages` is ordered by seq and holds every message for the user with
/// `seq > watermark`. `watermark` is `None` until the first message arrives.
#[derive(Default)]
struct Ring {
    messages: VecDeque<Arc<SseMessage>>,
    watermark: Option<i64>,
    evicted: bool,
}

impl Ring {
    fn insert(&mut self, message: Arc<SseMessage>, max: usize, ttl: Duration) {
        match self.watermark {
            None => self.watermark = Some(message.seq - 1),
            // A late message below the watermark can only be vouched for while
            // nothing has been evicted yet.
            Some(watermark) if message.seq <= watermark => {
                if self.evicted {
                    return;
                }
                self.watermark = Some(message.seq - 1);
            }
            Some(_) => {}
        }

        let position = self
            .messages
            .partition_point(|existing| existing.seq < message.seq);
        if self
            .messages
            .get(position)
            .map(|existing| existing.seq == message.seq)
            .unwrap_or(false)
        {
            return;
        }
        self.messages.insert(position, message);

        while self.messages.len() > max {
            if let Some(evicted) = self.messages.pop_front() {
                self.raise_watermark(evicted.seq);
            }
        }
        let mut expired = Vec::new();
        self.messages.retain(|message| {
            let keep = message.created_at.elapsed() <= ttl;
            if !keep {
                expired.push(message.seq);
            }
            keep
        });
        for seq in expired {
            self.raise_watermark(seq);
        }
    }

    fn raise_watermark(&mut self, seq: i64) {
        self.evicted = true;
        self.watermark = Some(self.watermark.map_or(seq, |current| current.max(seq)));
    }
}

pub struct Subscription {
    backlog: Vec<Arc<SseMessage>>,
    receiver: BroadcastStream<Arc<SseMessage>>,
    since: Option<i64>,
    guard: ClientGuard,
    ring_miss: bool,
}

impl Subscription {
    pub fn ring_miss(&self) -> bool {
        self.ring_miss
    }

    pub fn since(&self) -> Option<i64> {
        self.since
    }

    pub fn into_stream(self) -> SseStream {
        self.into_stream_with_initial(Vec::new())
    }

    /// Replaces the ring backlog with `initial`, then follows the live channel.
    /// Live messages at or below `since`, or already in the backlog, are skipped.
    pub fn into_stream_with_initial(mut self, initial: Vec<Arc<SseMessage>>) -> SseStream {
        if !initial.is_empty() {
            self.backlog = initial;
        }

        let floor = self.since.unwrap_or(i64::MIN);
        let replayed: HashSet<i64> = self.backlog.iter().map(|msg| msg.seq).collect();

        let backlog_stream =
            tokio_stream::iter(self.backlog).map(|msg| Ok::<_, Infallible>(msg.to_event()));
        let live_stream = self.receiver.filter_map(move |result| match result {
            Ok(msg) if msg.seq > floor && !replayed.contains(&msg.seq) => {
                Some(Ok(msg.to_event()))
            }
            Ok(_) => None,
            Err(_) => None,
        });

        SseStream {
            inner: Box::pin(backlog_stream.chain(live_stream)),
            _guard: self.guard,
        }
    }
}

pub struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>,
    _guard: ClientGuard,
}

impl Stream for SseStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_next(cx)
    }
}

pub struct SseMessage {
    seq: i64,
    data: String,
    created_at: Instant,
}

impl SseMessage {
    fn from_notification(notification: &Notification) -> Result<Self, serde_json::Error> {
        Ok(Self {
            seq: notification.seq,
            data: to_string(notification)?,
            created_at: Instant::now(),
        })
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }

    fn to_event(&self) -> Event {
        Event::default()
            .id(self.seq.to_string())
            .event(EVENT_NAME)
            .data(self.data.clone())
    }
}

struct ClientGuard {
    clients: Arc<AtomicUsize>,
}

impl ClientGuard {
    fn new(clients: Arc<AtomicUsize>) -> Self {
        let value = clients.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("sse_clients").set(value as f64);
        Self { clients }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let value = self.clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("sse_clients").set(value as f64);
    }
}

#[derive(Debug, Error)]
pub enum SseError {
    #[error("failed to serialize notification: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to load notifications: {0}")]
    Storage(#[from] NotificationRepoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use stockflow_core::notification::{
        NotificationDraft, NotificationKind, NotificationStatus, Priority,
    };
    use tokio::time::timeout;

    use crate::test_support;

    fn notification(user: &str, seq: i64) -> Notification {
        Notification {
            id: format!("n-{seq}"),
            seq,
            recipient_id: user.into(),
            sender_id: None,
            title: "Title".into(),
            message: "Message".into(),
            kind: NotificationKind::System,
            priority: Priority::Normal,
            status: NotificationStatus::Delivered,
            related_entity_type: None,
            related_entity_id: None,
            action_url: None,
            metadata: Value::Null,
            created_at: Utc::now(),
            read_at: None,
            expires_at: None,
            is_dismissible: true,
        }
    }

    async fn hub(ring_max: usize) -> (NotificationHub, Database, tempfile::TempDir) {
        let (db, dir) = test_support::database().await;
        (
            NotificationHub::new(db.clone(), ring_max, Duration::from_secs(300)),
            db,
            dir,
        )
    }

    #[tokio::test]
    async fn replays_ring_after_since() {
        let (hub, _db, _dir) = hub(8).await;
        for seq in [3, 5, 9] {
            hub.publish(&notification("u-1", seq)).await.expect("publish");
        }
        hub.publish(&notification("u-2", 10)).await.expect("publish");

        let subscription = hub.subscribe("u-1", Some(3)).await;
        assert!(!subscription.ring_miss());
        let seqs: Vec<_> = subscription.backlog.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![5, 9]);
    }

    #[tokio::test]
    async fn eviction_turns_old_resumes_into_ring_misses() {
        let (hub, _db, _dir) = hub(2).await;
        for seq in [1, 2, 3] {
            hub.publish(&notification("u-1", seq)).await.expect("publish");
        }
        assert!(hub.subscribe("u-1", Some(0)).await.ring_miss());
        let ok = hub.subscribe("u-1", Some(1)).await;
        assert!(!ok.ring_miss());
        assert_eq!(ok.backlog.len(), 2);
    }

    #[tokio::test]
    async fn unknown_history_is_a_ring_miss() {
        let (hub, _db, _dir) = hub(8).await;
        assert!(hub.subscribe("u-1", Some(4)).await.ring_miss());
        assert!(!hub.subscribe("u-1", None).await.ring_miss());
    }

    #[tokio::test]
    async fn ring_miss_backlog_comes_from_database() {
        let (hub, db, _dir) = hub(8).await;
        test_support::create_user(&db, "u-1", "a@example.com", "user").await;
        let draft =
            NotificationDraft::new(NotificationKind::System, Priority::Normal, "Hi", "There")
                .expect("draft");
        let repo = db.notifications();
        let first = repo.insert("n-1", "u-1", &draft, Utc::now()).await.expect("insert");
        let second = repo.insert("n-2", "u-1", &draft, Utc::now()).await.expect("insert");

        let subscription = hub.subscribe("u-1", Some(first.seq)).await;
        assert!(subscription.ring_miss());
        let backlog = hub.load_backlog("u-1", first.seq).await.expect("backlog");
        assert_eq!(backlog.iter().map(|m| m.seq()).collect::<Vec<_>>(), vec![second.seq]);
    }

    #[tokio::test]
    async fn live_stream_skips_replayed_messages() {
        let (hub, _db, _dir) = hub(8).await;
        hub.publish(&notification("u-1", 1)).await.expect("publish");
        let subscription = hub.subscribe("u-1", Some(0)).await;
        assert_eq!(hub.connected_clients(), 1);
        let mut stream = subscription.into_stream();

        hub.publish(&notification("u-1", 2)).await.expect("publish");

        let first = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("first in time");
        assert!(first.is_some());
        let second = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("second in time");
        assert!(second.is_some());
        drop(stream);
        assert_eq!(hub.connected_clients(), 0);
    }

    #[tokio::test]
    async fn late_lower_seq_reaches_live_stream_and_ring() {
        let (hub, _db, _dir) = hub(8).await;
        let newest = notification("u-1", 11);
        hub.publish(&newest).await.expect("publish");
        let subscription = hub.subscribe("u-1", Some(0)).await;
        assert!(subscription.ring_miss());
        let initial = vec![Arc::new(SseMessage::from_notification(&newest).expect("message"))];
        let mut stream = subscription.into_stream_with_initial(initial);

        hub.publish(&notification("u-1", 10)).await.expect("publish");

        for _ in 0..2 {
            let event = timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("event in time");
            assert!(event.is_some());
        }

        let resumed = hub.subscribe("u-1", Some(9)).await;
        assert!(!resumed.ring_miss());
        let seqs: Vec<_> = resumed.backlog.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![10, 11]);
    }

    #[tokio::test]
    async fn late_seq_below_evicted_watermark_stays_out_of_ring() {
        let (hub, _db, _dir) = hub(2).await;
        for seq in [4, 5, 6] {
            hub.publish(&notification("u-1", seq)).await.expect("publish");
        }
        hub.publish(&notification("u-1", 3)).await.expect("publish");

        assert!(hub.subscribe("u-1", Some(2)).await.ring_miss());
        let resumed = hub.subscribe("u-1", Some(4)).await;
        assert!(!resumed.ring_miss());
        let seqs: Vec<_> = resumed.backlog.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![5, 6]);
    }
}
