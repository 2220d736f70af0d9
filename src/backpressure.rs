//! Priority send buffer with water-mark backpressure
//!
//! [`BufferedConnection`] wraps a [`Connection`] and intercepts the send
//! path: writes go straight through while the buffer is empty and flowing,
//! otherwise they queue in a [`SendBuffer`] ordered by priority. Two water
//! marks give hysteresis between `Flowing` and `Paused`; a client that keeps
//! the buffer paused past a timeout is flagged slow and handled per policy.
//!
//! The buffer is the one multi-task structure in the crate: producers may
//! enqueue from other tasks, draining happens on the connection's task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::Result;
use crate::frame::{Frame, OpCode};
use crate::protocol::Message;
use crate::stream::WsStream;

/// Send priority; lower values are served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    /// Control traffic (close, ping, pong)
    Control = 0,
    /// Urgent application data
    High = 1,
    /// Default application data
    Normal = 2,
    /// Droppable application data
    Low = 3,
}

/// Kind of a queued outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text
    Text,
    /// Binary data
    Binary,
    /// Ping control frame
    Ping,
    /// Pong control frame
    Pong,
}

/// Buffer state driven by the water marks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Below the high water mark; direct writes allowed
    Flowing,
    /// Between the marks; producers should slow down
    Paused,
    /// At capacity
    Critical,
}

/// Queue ordering discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Strict priority, FIFO within a priority class
    Priority,
    /// Insertion order only
    Fifo,
}

/// What to do with a client flagged as slow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowClientPolicy {
    /// Close the connection with 1008 "slow client"
    Disconnect,
    /// Drop everything buffered and keep going
    DropMessages,
    /// Only report through the callback
    LogOnly,
    /// Application handles it through the callback
    Custom,
}

/// Backpressure tuning knobs
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Byte capacity of the buffer
    pub max_bytes: usize,
    /// Message-count capacity of the buffer
    pub max_messages: usize,
    /// Entering at or above this many buffered bytes pauses the flow
    pub high_water: usize,
    /// Draining to at or below this many buffered bytes resumes the flow
    pub low_water: usize,
    /// How long the flow may stay paused before the client is flagged slow
    pub slow_client_timeout: Duration,
    /// Suggested cadence for scheduled drains
    pub drain_interval: Duration,
    /// Queue ordering discipline
    pub mode: QueueMode,
    /// Slow-client handling
    pub policy: SlowClientPolicy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            max_messages: 1024,
            high_water: 768 * 1024,
            low_water: 256 * 1024,
            slow_client_timeout: Duration::from_secs(30),
            drain_interval: Duration::from_millis(100),
            mode: QueueMode::Priority,
            policy: SlowClientPolicy::Disconnect,
        }
    }
}

/// Point-in-time view of the buffer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureStats {
    /// Bytes currently queued
    pub buffered_amount: usize,
    /// Messages currently queued
    pub pending_messages: usize,
    /// Current flow state
    pub state: FlowState,
    /// Messages written to the connection
    pub messages_sent: u64,
    /// Messages evicted, rejected, or cleared
    pub messages_dropped: u64,
    /// Bytes written to the connection
    pub bytes_sent: u64,
    /// Bytes evicted, rejected, or cleared
    pub bytes_dropped: u64,
    /// Times the flow left `Flowing`
    pub times_paused: u64,
    /// Times the flow returned to `Flowing`
    pub drain_events: u64,
    /// Times a slow client was flagged
    pub slow_client_detections: u64,
    /// Accumulated time spent outside `Flowing`
    pub total_paused_duration: Duration,
    /// Largest `buffered_amount` ever observed
    pub peak_buffered_amount: usize,
}

/// An entry waiting in the send buffer
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Payload
    pub data: Bytes,
    /// Message kind
    pub kind: MessageKind,
    /// Send priority
    pub priority: Priority,
    /// When the entry was enqueued
    pub enqueued_at: Instant,
}

/// Action the wrapper must take after a slow-client check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowClientAction {
    /// Nothing to do
    None,
    /// Close the connection with 1008
    Disconnect,
    /// The buffer was cleared
    Dropped,
}

enum Event {
    StateChange(FlowState, FlowState),
    Drain,
    SlowClient(BackpressureStats),
}

struct Inner {
    queue: VecDeque<QueuedMessage>,
    total_bytes: usize,
    state: FlowState,
    paused_since: Option<Instant>,
    slow_flagged: bool,
    messages_sent: u64,
    messages_dropped: u64,
    bytes_sent: u64,
    bytes_dropped: u64,
    times_paused: u64,
    drain_events: u64,
    slow_client_detections: u64,
    total_paused_duration: Duration,
    peak_buffered_amount: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            total_bytes: 0,
            state: FlowState::Flowing,
            paused_since: None,
            slow_flagged: false,
            messages_sent: 0,
            messages_dropped: 0,
            bytes_sent: 0,
            bytes_dropped: 0,
            times_paused: 0,
            drain_events: 0,
            slow_client_detections: 0,
            total_paused_duration: Duration::ZERO,
            peak_buffered_amount: 0,
        }
    }

    fn stats(&self, now: Instant) -> BackpressureStats {
        let paused_extra = self
            .paused_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO);

        BackpressureStats {
            buffered_amount: self.total_bytes,
            pending_messages: self.queue.len(),
            state: self.state,
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            bytes_sent: self.bytes_sent,
            bytes_dropped: self.bytes_dropped,
            times_paused: self.times_paused,
            drain_events: self.drain_events,
            slow_client_detections: self.slow_client_detections,
            total_paused_duration: self.total_paused_duration + paused_extra,
            peak_buffered_amount: self.peak_buffered_amount,
        }
    }

    fn drop_entry(&mut self, index: usize) {
        if let Some(entry) = self.queue.remove(index) {
            self.total_bytes -= entry.data.len();
            self.messages_dropped += 1;
            self.bytes_dropped += entry.data.len() as u64;
        }
    }

    /// Re-run the water-mark machine; push at most one transition event
    fn reevaluate(&mut self, config: &BackpressureConfig, events: &mut Vec<Event>) {
        let buffered = self.total_bytes;
        let at_cap = buffered >= config.max_bytes || self.queue.len() >= config.max_messages;

        let new = match self.state {
            FlowState::Flowing => {
                if at_cap {
                    FlowState::Critical
                } else if buffered >= config.high_water {
                    FlowState::Paused
                } else {
                    FlowState::Flowing
                }
            }
            FlowState::Paused => {
                if at_cap {
                    FlowState::Critical
                } else if buffered <= config.low_water {
                    FlowState::Flowing
                } else {
                    FlowState::Paused
                }
            }
            FlowState::Critical => {
                if buffered <= config.low_water {
                    FlowState::Flowing
                } else if buffered < config.high_water && !at_cap {
                    FlowState::Paused
                } else {
                    FlowState::Critical
                }
            }
        };

        if new == self.state {
            return;
        }

        let old = self.state;
        self.state = new;
        let now = Instant::now();

        if old == FlowState::Flowing {
            self.paused_since = Some(now);
            self.times_paused += 1;
        } else if new == FlowState::Flowing {
            if let Some(since) = self.paused_since.take() {
                self.total_paused_duration += now.saturating_duration_since(since);
            }
            self.slow_flagged = false;
            self.drain_events += 1;
            events.push(Event::Drain);
        }

        debug!("backpressure state {:?} -> {:?} at {} bytes", old, new, buffered);
        events.push(Event::StateChange(old, new));
    }
}

type StateChangeHook = Box<dyn Fn(FlowState, FlowState) + Send + Sync>;
type DrainHook = Box<dyn Fn() + Send + Sync>;
type SlowClientHook = Box<dyn Fn(BackpressureStats) + Send + Sync>;

/// Thread-safe priority send buffer
///
/// All mutating operations and counters are serialized by one mutex;
/// callbacks fire after the lock is released, exactly once per external
/// state transition.
pub struct SendBuffer {
    config: BackpressureConfig,
    inner: Mutex<Inner>,
    on_state_change: Option<StateChangeHook>,
    on_drain: Option<DrainHook>,
    on_slow_client: Option<SlowClientHook>,
}

impl SendBuffer {
    /// Create a buffer with the given configuration
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::new()),
            on_state_change: None,
            on_drain: None,
            on_slow_client: None,
        }
    }

    /// Install a state-transition callback
    pub fn on_state_change(mut self, hook: impl Fn(FlowState, FlowState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Box::new(hook));
        self
    }

    /// Install a drained-to-flowing callback
    pub fn on_drain(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_drain = Some(Box::new(hook));
        self
    }

    /// Install a slow-client callback
    pub fn on_slow_client(mut self, hook: impl Fn(BackpressureStats) + Send + Sync + 'static) -> Self {
        self.on_slow_client = Some(Box::new(hook));
        self
    }

    /// Buffer configuration
    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    fn fire(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::StateChange(old, new) => {
                    if let Some(hook) = &self.on_state_change {
                        hook(old, new);
                    }
                }
                Event::Drain => {
                    if let Some(hook) = &self.on_drain {
                        hook();
                    }
                }
                Event::SlowClient(stats) => {
                    if let Some(hook) = &self.on_slow_client {
                        hook(stats);
                    }
                }
            }
        }
    }

    /// Admit a message into the buffer.
    ///
    /// When the buffer is over capacity, Low-priority entries are evicted
    /// tail-first to make room. A `Normal` or `Low` arrival that still does
    /// not fit is rejected (`false`). `Control` and `High` arrivals are
    /// admitted regardless once all Low traffic is gone; for them the byte
    /// cap is best-effort.
    pub fn enqueue(&self, data: Bytes, kind: MessageKind, priority: Priority) -> bool {
        let mut events = Vec::new();
        let accepted = {
            let mut inner = self.inner.lock();
            let len = data.len();

            let over = |inner: &Inner| {
                inner.total_bytes + len > self.config.max_bytes
                    || inner.queue.len() >= self.config.max_messages
            };

            if over(&inner) {
                while over(&inner) {
                    match inner.queue.iter().rposition(|m| m.priority == Priority::Low) {
                        Some(index) => inner.drop_entry(index),
                        None => break,
                    }
                }

                if over(&inner) && priority >= Priority::Normal {
                    warn!("send buffer full, dropping {:?} message of {} bytes", kind, len);
                    inner.messages_dropped += 1;
                    inner.bytes_dropped += len as u64;
                    inner.reevaluate(&self.config, &mut events);
                    drop(inner);
                    self.fire(events);
                    return false;
                }
            }

            let entry = QueuedMessage {
                data,
                kind,
                priority,
                enqueued_at: Instant::now(),
            };

            let position = match self.config.mode {
                QueueMode::Fifo => inner.queue.len(),
                QueueMode::Priority => {
                    let mut position = inner.queue.len();
                    while position > 0 && inner.queue[position - 1].priority > priority {
                        position -= 1;
                    }
                    position
                }
            };

            inner.queue.insert(position, entry);
            inner.total_bytes += len;
            inner.peak_buffered_amount = inner.peak_buffered_amount.max(inner.total_bytes);
            inner.reevaluate(&self.config, &mut events);
            true
        };

        self.fire(events);
        accepted
    }

    /// Remove the next entry in service order
    pub fn dequeue(&self) -> Option<QueuedMessage> {
        let mut events = Vec::new();
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.queue.pop_front()?;
            inner.total_bytes -= entry.data.len();
            inner.reevaluate(&self.config, &mut events);
            entry
        };
        self.fire(events);
        Some(entry)
    }

    /// Remove the next entry whose priority is at most `limit`
    pub fn dequeue_up_to(&self, limit: Priority) -> Option<QueuedMessage> {
        let mut events = Vec::new();
        let entry = {
            let mut inner = self.inner.lock();
            let index = inner.queue.iter().position(|m| m.priority <= limit)?;
            let entry = inner.queue.remove(index)?;
            inner.total_bytes -= entry.data.len();
            inner.reevaluate(&self.config, &mut events);
            entry
        };
        self.fire(events);
        Some(entry)
    }

    /// Put an entry back at the head of the queue (failed write)
    pub fn requeue_front(&self, entry: QueuedMessage) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.total_bytes += entry.data.len();
            inner.peak_buffered_amount = inner.peak_buffered_amount.max(inner.total_bytes);
            inner.queue.push_front(entry);
            inner.reevaluate(&self.config, &mut events);
        }
        self.fire(events);
    }

    /// Drop everything buffered, accounting it as dropped
    pub fn clear(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            while !inner.queue.is_empty() {
                let last = inner.queue.len() - 1;
                inner.drop_entry(last);
            }
            inner.reevaluate(&self.config, &mut events);
        }
        self.fire(events);
    }

    /// Account a successful write
    pub fn record_sent(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.messages_sent += 1;
        inner.bytes_sent += bytes as u64;
    }

    /// Check the slow-client condition and decide the action to take.
    ///
    /// Flags at most once per pause episode; the flag rearms when the buffer
    /// returns to `Flowing`.
    pub fn check_slow_client(&self) -> SlowClientAction {
        let mut events = Vec::new();
        let action = {
            let mut inner = self.inner.lock();

            if inner.state == FlowState::Flowing || inner.slow_flagged {
                return SlowClientAction::None;
            }
            let Some(since) = inner.paused_since else {
                return SlowClientAction::None;
            };
            if since.elapsed() < self.config.slow_client_timeout {
                return SlowClientAction::None;
            }

            inner.slow_flagged = true;
            inner.slow_client_detections += 1;
            warn!(
                "slow client: flow {:?} for {:?}, policy {:?}",
                inner.state,
                since.elapsed(),
                self.config.policy
            );
            events.push(Event::SlowClient(inner.stats(Instant::now())));

            match self.config.policy {
                SlowClientPolicy::Disconnect => SlowClientAction::Disconnect,
                SlowClientPolicy::DropMessages => {
                    while !inner.queue.is_empty() {
                        let last = inner.queue.len() - 1;
                        inner.drop_entry(last);
                    }
                    inner.reevaluate(&self.config, &mut events);
                    SlowClientAction::Dropped
                }
                SlowClientPolicy::LogOnly | SlowClientPolicy::Custom => SlowClientAction::None,
            }
        };
        self.fire(events);
        action
    }

    /// Current flow state
    pub fn state(&self) -> FlowState {
        self.inner.lock().state
    }

    /// Bytes currently buffered
    pub fn buffered_amount(&self) -> usize {
        self.inner.lock().total_bytes
    }

    /// Messages currently buffered
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> BackpressureStats {
        self.inner.lock().stats(Instant::now())
    }
}

/// A [`Connection`] wrapped with the priority send buffer
///
/// Intercepts sends only; the receive path is untouched apart from an
/// opportunistic drain after each received message.
pub struct BufferedConnection<S> {
    conn: Connection<S>,
    buffer: Arc<SendBuffer>,
}

impl<S: WsStream> BufferedConnection<S> {
    /// Wrap a connection with a fresh buffer
    pub fn new(conn: Connection<S>, config: BackpressureConfig) -> Self {
        Self::with_buffer(conn, SendBuffer::new(config))
    }

    /// Wrap a connection with a pre-configured buffer (callbacks installed)
    pub fn with_buffer(conn: Connection<S>, buffer: SendBuffer) -> Self {
        Self {
            conn,
            buffer: Arc::new(buffer),
        }
    }

    /// Shared handle to the buffer, for producers on other tasks
    pub fn buffer(&self) -> Arc<SendBuffer> {
        Arc::clone(&self.buffer)
    }

    /// The wrapped connection
    pub fn connection(&self) -> &Connection<S> {
        &self.conn
    }

    /// Snapshot of the buffer counters
    pub fn stats(&self) -> BackpressureStats {
        self.buffer.stats()
    }

    /// Queue or directly send a text message
    pub async fn send_text(&mut self, text: &str, priority: Priority) -> Result<bool> {
        self.send(Bytes::copy_from_slice(text.as_bytes()), MessageKind::Text, priority)
            .await
    }

    /// Queue or directly send a binary message
    pub async fn send_binary(&mut self, data: impl Into<Bytes>, priority: Priority) -> Result<bool> {
        self.send(data.into(), MessageKind::Binary, priority).await
    }

    /// Queue or directly send a ping (Control priority)
    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<bool> {
        self.send(payload.into(), MessageKind::Ping, Priority::Control).await
    }

    /// Queue or directly send a pong (Control priority)
    pub async fn pong(&mut self, payload: impl Into<Bytes>) -> Result<bool> {
        self.send(payload.into(), MessageKind::Pong, Priority::Control).await
    }

    /// Send a message through the buffer.
    ///
    /// Writes directly when the flow is `Flowing` and nothing is queued;
    /// otherwise enqueues. Returns whether the message was accepted.
    pub async fn send(&mut self, data: Bytes, kind: MessageKind, priority: Priority) -> Result<bool> {
        if self.buffer.state() == FlowState::Flowing && self.buffer.is_empty() {
            let len = data.len();
            self.write_message(data, kind).await?;
            self.buffer.record_sent(len);
            return Ok(true);
        }
        Ok(self.buffer.enqueue(data, kind, priority))
    }

    /// Receive the next message, then opportunistically drain the buffer
    pub async fn receive(&mut self) -> Result<Message> {
        let message = self.conn.receive().await?;
        if let Err(e) = self.drain().await {
            debug!("opportunistic drain failed: {}", e);
        }
        Ok(message)
    }

    /// Write queued messages until the buffer is empty or a write fails.
    ///
    /// Runs the slow-client check first, then dequeues in service order.
    /// A failed entry goes back to the head of the queue.
    pub async fn drain(&mut self) -> Result<()> {
        match self.buffer.check_slow_client() {
            SlowClientAction::Disconnect => {
                self.conn.close(1008, "slow client").await;
                return Ok(());
            }
            SlowClientAction::Dropped | SlowClientAction::None => {}
        }

        while let Some(entry) = self.buffer.dequeue() {
            let len = entry.data.len();
            match self.write_message(entry.data.clone(), entry.kind).await {
                Ok(()) => self.buffer.record_sent(len),
                Err(e) => {
                    self.buffer.requeue_front(entry);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Drain only entries with priority at most `High`.
    ///
    /// Used during shutdown so control traffic escapes ahead of bulk data.
    pub async fn flush_high_priority(&mut self) -> Result<()> {
        while let Some(entry) = self.buffer.dequeue_up_to(Priority::High) {
            let len = entry.data.len();
            match self.write_message(entry.data.clone(), entry.kind).await {
                Ok(()) => self.buffer.record_sent(len),
                Err(e) => {
                    self.buffer.requeue_front(entry);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Flush high-priority traffic, then run the close handshake
    pub async fn close(&mut self, code: u16, reason: &str) {
        if self.flush_high_priority().await.is_err() {
            debug!("high-priority flush failed during close");
        }
        self.conn.close(code, reason).await;
    }

    async fn write_message(&mut self, data: Bytes, kind: MessageKind) -> Result<()> {
        match kind {
            MessageKind::Text => self.conn.send_data(Frame::new(OpCode::Text, data, true)).await,
            MessageKind::Binary => self.conn.send_data(Frame::new(OpCode::Binary, data, true)).await,
            MessageKind::Ping => self.conn.ping(data).await,
            MessageKind::Pong => self.conn.pong(data).await,
        }
    }
}
