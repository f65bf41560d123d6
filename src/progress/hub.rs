//! Per-session event log with push notification to subscribers.
//!
//! Every session owns an append-only backlog guarded by its own mutex, so
//! sequence-index assignment is atomic per session while different sessions
//! never contend. Subscribers are woken through a `watch` channel rather than
//! polling on an interval.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::event::{EventType, ProgressEvent, ProgressSession};

/// Runtime settings for the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Idle window after which a `ping` is published to an active session.
    pub ping_interval: Duration,
    /// Soft cap on retained events per session. Events a live subscriber
    /// still needs are never dropped.
    pub max_backlog: usize,
    /// How long an ended session without subscribers is kept for replay.
    pub ended_grace: Duration,
    /// Sessions with no events and no subscribers for this long are dropped.
    pub idle_session_ttl: Duration,
    /// Upper bound on tracked sessions; the least recently updated session
    /// without subscribers is evicted first.
    pub max_sessions: usize,
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            max_backlog: 2000,
            ended_grace: Duration::from_secs(300),
            idle_session_ttl: Duration::from_secs(3600),
            max_sessions: 1024,
            sweep_interval: Duration::from_secs(15),
        }
    }
}

struct ChannelState {
    events: VecDeque<ProgressEvent>,
    first_index: u64,
    next_index: u64,
    is_active: bool,
    last_event_at: Instant,
    last_event_time: Option<DateTime<Utc>>,
    ended_at: Option<Instant>,
    end_event: Option<ProgressEvent>,
    /// Subscriber id -> next index that subscriber needs.
    cursors: HashMap<u64, u64>,
    next_subscriber: u64,
}

struct Channel {
    session_id: String,
    state: Mutex<ChannelState>,
    notify: watch::Sender<u64>,
}

impl Channel {
    fn new(session_id: &str, now: Instant) -> Self {
        let (notify, _rx) = watch::channel(0);
        Self {
            session_id: session_id.to_string(),
            state: Mutex::new(ChannelState {
                events: VecDeque::new(),
                first_index: 0,
                next_index: 0,
                is_active: true,
                last_event_at: now,
                last_event_time: None,
                ended_at: None,
                end_event: None,
                cursors: HashMap::new(),
                next_subscriber: 0,
            }),
            notify,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(
        &self,
        event_type: EventType,
        data: Value,
        now: Instant,
        max_backlog: usize,
    ) -> u64 {
        let index = {
            let mut st = self.lock();
            push_event(&mut st, event_type, data, now, max_backlog)
        };
        self.notify.send_replace(index + 1);
        index
    }

    /// Append the terminal `end` event unless the session already ended.
    /// The check and the append share one critical section.
    fn end(&self, now: Instant, max_backlog: usize) -> bool {
        let index = {
            let mut st = self.lock();
            if !st.is_active {
                return false;
            }
            push_event(
                &mut st,
                EventType::End,
                serde_json::json!({"session_id": self.session_id}),
                now,
                max_backlog,
            )
        };
        self.notify.send_replace(index + 1);
        true
    }

    fn snapshot(&self) -> ProgressSession {
        let st = self.lock();
        ProgressSession {
            session_id: self.session_id.clone(),
            is_active: st.is_active,
            last_event_time: st.last_event_time,
            next_index: st.next_index,
            first_index: st.first_index,
            backlog: st.events.len(),
            subscribers: st.cursors.len(),
        }
    }

    fn register(&self, from_index: u64) -> u64 {
        let mut st = self.lock();
        let id = st.next_subscriber;
        st.next_subscriber += 1;
        st.cursors.insert(id, from_index);
        id
    }

    fn deregister(&self, subscriber: u64) {
        self.lock().cursors.remove(&subscriber);
    }

    /// Next event at or after `cursor`, advancing it. On an ended session a
    /// caught-up subscriber receives the terminal event.
    fn next_for(&self, subscriber: u64, cursor: &mut u64) -> Option<ProgressEvent> {
        let mut st = self.lock();
        if *cursor < st.first_index {
            *cursor = st.first_index;
        }
        if *cursor < st.next_index {
            let offset = (*cursor - st.first_index) as usize;
            let event = st.events.get(offset).cloned();
            *cursor += 1;
            st.cursors.insert(subscriber, *cursor);
            return event;
        }
        if !st.is_active {
            return st.end_event.clone();
        }
        None
    }
}

/// Append one event and return its index. Any event other than `end`
/// reactivates an ended session.
fn push_event(
    st: &mut ChannelState,
    event_type: EventType,
    data: Value,
    now: Instant,
    max_backlog: usize,
) -> u64 {
    if event_type != EventType::End && !st.is_active {
        st.is_active = true;
        st.ended_at = None;
        st.end_event = None;
    }
    let index = st.next_index;
    let event = ProgressEvent {
        event_type,
        data,
        sequence_index: index,
        timestamp: Utc::now(),
    };
    if event_type == EventType::End {
        st.is_active = false;
        st.ended_at = Some(now);
        st.end_event = Some(event.clone());
    }
    st.events.push_back(event);
    st.next_index += 1;
    st.last_event_at = now;
    st.last_event_time = Some(Utc::now());
    trim_backlog(st, max_backlog);
    index
}

fn trim_backlog(st: &mut ChannelState, max_backlog: usize) {
    if st.events.len() <= max_backlog {
        return;
    }
    let needed = st.cursors.values().copied().min().unwrap_or(st.next_index);
    let over = st.events.len() - max_backlog;
    let drainable = needed.saturating_sub(st.first_index) as usize;
    let drop = over.min(drainable);
    st.events.drain(..drop);
    st.first_index += drop as u64;
}

/// Replayable progress stream registry, one log per session id.
pub struct ProgressHub {
    config: HubConfig,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    closed: AtomicBool,
}

impl ProgressHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn channel(&self, session_id: &str) -> Arc<Channel> {
        if let Some(channel) = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            return Arc::clone(channel);
        }

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get(session_id) {
            return Arc::clone(channel);
        }
        if channels.len() >= self.config.max_sessions {
            evict_lru(&mut channels);
        }
        let channel = Arc::new(Channel::new(session_id, Instant::now()));
        channels.insert(session_id.to_string(), Arc::clone(&channel));
        tracing::debug!(session_id, "progress session created");
        channel
    }

    fn existing(&self, session_id: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn all_channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Idempotently create the progress session for `session_id`.
    pub fn create_or_get_session(&self, session_id: &str) -> ProgressSession {
        self.channel(session_id).snapshot()
    }

    pub fn session(&self, session_id: &str) -> Option<ProgressSession> {
        self.existing(session_id).map(|c| c.snapshot())
    }

    pub fn session_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Append an event and wake subscribers. Never waits on subscribers.
    /// Returns the assigned sequence index, or `None` after [`close`](Self::close).
    pub fn publish(&self, session_id: &str, event_type: EventType, data: Value) -> Option<u64> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let channel = self.channel(session_id);
        Some(channel.append(event_type, data, Instant::now(), self.config.max_backlog))
    }

    /// Mark the session inactive and publish its terminal `end` event.
    /// No-op if the session is unknown or already ended.
    pub fn mark_ended(&self, session_id: &str) {
        if let Some(channel) = self.existing(session_id) {
            end_channel(&channel, self.config.max_backlog);
        }
    }

    /// Subscribe to events with index >= `from_index`.
    pub fn subscribe(&self, session_id: &str, from_index: u64) -> Subscription {
        if self.closed.load(Ordering::Acquire) {
            return Subscription::closed();
        }
        let channel = self.channel(session_id);
        let id = channel.register(from_index);
        let rx = channel.notify.subscribe();
        Subscription {
            inner: Some(SubscriptionInner {
                channel,
                id,
                rx,
            }),
            cursor: from_index,
            done: false,
        }
    }

    /// Tear down every session. Live subscribers receive `end` and complete.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Arc<Channel>> = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, c)| c)
            .collect();
        for channel in &drained {
            end_channel(channel, self.config.max_backlog);
        }
        tracing::info!(sessions = drained.len(), "progress hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish a `ping` into every active session idle for the ping interval.
    pub fn emit_keepalives(&self) -> usize {
        self.emit_keepalives_at(Instant::now())
    }

    fn emit_keepalives_at(&self, now: Instant) -> usize {
        if self.is_closed() {
            return 0;
        }
        let mut pinged = 0;
        for channel in self.all_channels() {
            let idle = {
                let st = channel.lock();
                st.is_active && now.saturating_duration_since(st.last_event_at) >= self.config.ping_interval
            };
            if idle {
                channel.append(EventType::Ping, Value::Object(Default::default()), now, self.config.max_backlog);
                pinged += 1;
            }
        }
        pinged
    }

    /// Drop sessions nobody needs any more. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let before = channels.len();
        channels.retain(|_, channel| {
            let st = channel.lock();
            if !st.cursors.is_empty() {
                return true;
            }
            let ended_expired = st
                .ended_at
                .is_some_and(|t| now.saturating_duration_since(t) >= self.config.ended_grace);
            let idle_expired =
                now.saturating_duration_since(st.last_event_at) >= self.config.idle_session_ttl;
            !(ended_expired || idle_expired)
        });
        let removed = before - channels.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = channels.len(), "swept progress sessions");
        }
        removed
    }

    /// Run keepalives and sweeping on a background task until the hub closes.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let tick = hub.config.ping_interval.min(hub.config.sweep_interval).max(Duration::from_millis(100));
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if hub.is_closed() {
                    break;
                }
                hub.emit_keepalives();
                hub.sweep();
            }
        })
    }
}

fn end_channel(channel: &Channel, max_backlog: usize) {
    if channel.end(Instant::now(), max_backlog) {
        tracing::debug!(session_id = %channel.session_id, "progress session ended");
    }
}

/// Evict the least recently used ended session nobody is watching. Active
/// sessions are never evicted, so the cap may be exceeded until they end.
fn evict_lru(channels: &mut HashMap<String, Arc<Channel>>) {
    let victim = channels
        .iter()
        .filter_map(|(id, channel)| {
            let st = channel.lock();
            (!st.is_active && st.cursors.is_empty()).then(|| (st.last_event_at, id.clone()))
        })
        .min_by_key(|(at, _)| *at)
        .map(|(_, id)| id);
    match victim {
        Some(id) => {
            channels.remove(&id);
            tracing::debug!(session_id = %id, "evicted least recently used progress session");
        }
        None => tracing::warn!(
            sessions = channels.len(),
            "progress session cap exceeded, every session is active or watched"
        ),
    }
}

struct SubscriptionInner {
    channel: Arc<Channel>,
    id: u64,
    rx: watch::Receiver<u64>,
}

/// A pull-based cursor over one session's events.
///
/// Dropping the subscription deregisters it without affecting publishers.
pub struct Subscription {
    inner: Option<SubscriptionInner>,
    cursor: u64,
    done: bool,
}

impl Subscription {
    fn closed() -> Self {
        Self {
            inner: None,
            cursor: 0,
            done: true,
        }
    }

    /// Next index this subscriber will receive; reconnect with it to resume.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Wait for the next event. Returns `None` once the terminal `end` event
    /// has been delivered.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        let inner = self.inner.as_mut()?;
        loop {
            inner.rx.borrow_and_update();
            if let Some(event) = inner.channel.next_for(inner.id, &mut self.cursor) {
                if event.is_terminal() {
                    self.done = true;
                    self.cursor = self.cursor.max(event.sequence_index + 1);
                }
                return Some(event);
            }
            if inner.rx.changed().await.is_err() {
                self.done = true;
                return None;
            }
        }
    }

    /// Adapt into a `Stream` for transports.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next_event().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.channel.deregister(inner.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn hub() -> ProgressHub {
        ProgressHub::new(HubConfig::default())
    }

    #[test]
    fn test_create_or_get_is_idempotent() {
        let hub = hub();
        let a = hub.create_or_get_session("s1");
        hub.publish("s1", EventType::Progress, json!({"n": 1}));
        let b = hub.create_or_get_session("s1");
        assert!(a.is_active);
        assert_eq!(a.next_index, 0);
        assert_eq!(b.next_index, 1);
        assert_eq!(hub.session_count(), 1);
    }

    #[test]
    fn test_publish_assigns_sequential_indices_per_session() {
        let hub = hub();
        assert_eq!(hub.publish("a", EventType::Progress, json!(1)), Some(0));
        assert_eq!(hub.publish("a", EventType::Progress, json!(2)), Some(1));
        assert_eq!(hub.publish("b", EventType::Progress, json!(1)), Some(0));
        assert_eq!(hub.publish("a", EventType::Error, json!(3)), Some(2));
    }

    #[tokio::test]
    async fn test_subscriber_from_zero_sees_all_events_in_order() {
        let hub = hub();
        for i in 0..5 {
            hub.publish("s", EventType::Progress, json!({"i": i}));
        }
        hub.mark_ended("s");

        let events: Vec<_> = hub.subscribe("s", 0).into_stream().collect().await;
        let indices: Vec<u64> = events.iter().map(|e| e.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(events.last().unwrap().event_type, EventType::End);
    }

    #[tokio::test]
    async fn test_mid_session_subscriber_resumes_from_index() {
        let hub = hub();
        for i in 0..5 {
            hub.publish("s", EventType::Progress, json!({"i": i}));
        }
        let mut sub = hub.subscribe("s", 3);
        assert_eq!(sub.next_event().await.unwrap().sequence_index, 3);
        assert_eq!(sub.next_event().await.unwrap().sequence_index, 4);
        hub.mark_ended("s");
        let end = sub.next_event().await.unwrap();
        assert_eq!(end.event_type, EventType::End);
        assert!(sub.next_event().await.is_none());
        assert!(sub.is_done());
    }

    #[tokio::test]
    async fn test_live_subscriber_is_woken_by_publish() {
        let hub = Arc::new(hub());
        let mut sub = hub.subscribe("live", 0);

        let publisher = Arc::clone(&hub);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("live", EventType::Progress, json!({"step": 1}));
            publisher.mark_ended("live");
        });

        let first = tokio::time::timeout(Duration::from_secs(2), sub.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.data["step"], 1);
        let end = sub.next_event().await.unwrap();
        assert!(end.is_terminal());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_many_concurrent_publishers_produce_gapless_log() {
        let hub = Arc::new(hub());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let hub = Arc::clone(&hub);
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    hub.publish("busy", EventType::Progress, json!({"w": worker, "i": i}));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        hub.mark_ended("busy");

        let events: Vec<_> = hub.subscribe("busy", 0).into_stream().collect().await;
        assert_eq!(events.len(), 201);
        for (expected, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_index, expected as u64);
        }
    }

    #[tokio::test]
    async fn test_subscriber_past_the_end_gets_terminal_event() {
        let hub = hub();
        hub.publish("s", EventType::Progress, json!({}));
        hub.mark_ended("s");
        let mut sub = hub.subscribe("s", 50);
        let end = sub.next_event().await.unwrap();
        assert!(end.is_terminal());
        assert_eq!(end.sequence_index, 1);
        assert!(sub.next_event().await.is_none());
    }

    #[test]
    fn test_mark_ended_twice_appends_one_end_event() {
        let hub = hub();
        hub.publish("s", EventType::Progress, json!({}));
        hub.mark_ended("s");
        hub.mark_ended("s");
        let snap = hub.session("s").unwrap();
        assert!(!snap.is_active);
        assert_eq!(snap.next_index, 2);
    }

    #[test]
    fn test_publish_after_end_reactivates_session() {
        let hub = hub();
        hub.publish("s", EventType::Progress, json!({"phase": "extraction"}));
        hub.mark_ended("s");
        assert_eq!(
            hub.publish("s", EventType::Progress, json!({"phase": "enrichment"})),
            Some(2)
        );
        assert!(hub.session("s").unwrap().is_active);
    }

    #[test]
    fn test_dropping_subscription_deregisters() {
        let hub = hub();
        let sub = hub.subscribe("s", 0);
        assert_eq!(hub.session("s").unwrap().subscribers, 1);
        drop(sub);
        assert_eq!(hub.session("s").unwrap().subscribers, 0);
    }

    #[test]
    fn test_backlog_trim_respects_live_cursors() {
        let hub = ProgressHub::new(HubConfig {
            max_backlog: 3,
            ..HubConfig::default()
        });
        let _slow = hub.subscribe("s", 2);
        for i in 0..10 {
            hub.publish("s", EventType::Progress, json!(i));
        }
        let snap = hub.session("s").unwrap();
        assert_eq!(snap.first_index, 2);
        assert_eq!(snap.backlog, 8);
    }

    #[test]
    fn test_backlog_trim_without_subscribers_keeps_cap() {
        let hub = ProgressHub::new(HubConfig {
            max_backlog: 3,
            ..HubConfig::default()
        });
        for i in 0..10 {
            hub.publish("s", EventType::Progress, json!(i));
        }
        let snap = hub.session("s").unwrap();
        assert_eq!(snap.backlog, 3);
        assert_eq!(snap.first_index, 7);
        assert_eq!(snap.next_index, 10);
    }

    #[test]
    fn test_keepalive_pings_only_idle_active_sessions() {
        let hub = hub();
        hub.publish("idle", EventType::Progress, json!({}));
        hub.publish("ended", EventType::Progress, json!({}));
        hub.mark_ended("ended");

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(hub.emit_keepalives_at(later), 1);
        assert_eq!(hub.session("idle").unwrap().next_index, 2);
        assert_eq!(hub.session("ended").unwrap().next_index, 2);

        assert_eq!(hub.emit_keepalives_at(later), 0);
    }

    #[test]
    fn test_sweep_removes_drained_sessions_after_grace() {
        let hub = hub();
        hub.publish("done", EventType::Progress, json!({}));
        hub.mark_ended("done");
        hub.publish("watched", EventType::Progress, json!({}));
        hub.mark_ended("watched");
        let _viewer = hub.subscribe("watched", 0);
        hub.publish("running", EventType::Progress, json!({}));

        assert_eq!(hub.sweep_at(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(hub.sweep_at(later), 1);
        assert!(hub.session("done").is_none());
        assert!(hub.session("watched").is_some());
        assert!(hub.session("running").is_some());

        let much_later = Instant::now() + Duration::from_secs(3601);
        hub.sweep_at(much_later);
        assert!(hub.session("running").is_none());
        assert!(hub.session("watched").is_some());
    }

    #[test]
    fn test_session_cap_evicts_ended_unwatched_session() {
        let hub = ProgressHub::new(HubConfig {
            max_sessions: 2,
            ..HubConfig::default()
        });
        hub.publish("old", EventType::Progress, json!({}));
        hub.mark_ended("old");
        hub.publish("live", EventType::Progress, json!({}));
        hub.publish("newest", EventType::Progress, json!({}));
        assert_eq!(hub.session_count(), 2);
        assert!(hub.session("old").is_none());
        assert!(hub.session("live").is_some());
    }

    #[test]
    fn test_session_cap_never_evicts_active_sessions() {
        let hub = ProgressHub::new(HubConfig {
            max_sessions: 2,
            ..HubConfig::default()
        });
        hub.publish("a", EventType::Progress, json!({}));
        hub.publish("b", EventType::Progress, json!({}));
        hub.publish("c", EventType::Progress, json!({}));
        assert_eq!(hub.session_count(), 3);
        assert_eq!(hub.publish("a", EventType::Progress, json!({})), Some(1));
    }

    #[test]
    fn test_concurrent_mark_ended_appends_one_end_event() {
        let hub = hub();
        hub.publish("s", EventType::Progress, json!({}));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| hub.mark_ended("s"));
            }
        });
        let snap = hub.session("s").unwrap();
        assert!(!snap.is_active);
        assert_eq!(snap.next_index, 2);
    }

    #[tokio::test]
    async fn test_close_ends_live_subscribers_and_rejects_publish() {
        let hub = hub();
        hub.publish("s", EventType::Progress, json!({}));
        let mut sub = hub.subscribe("s", 1);
        hub.close();

        let end = sub.next_event().await.unwrap();
        assert!(end.is_terminal());
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.publish("s", EventType::Progress, json!({})), None);
        assert!(hub.subscribe("s", 0).next_event().await.is_none());
    }
}
