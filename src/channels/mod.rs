//! Backpressure-aware data channel adapter

use crate::config::ChannelConfig;
use crate::engine::{ChannelEvent, ChannelState, TransportChannel};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Listener for channel lifecycle events
///
/// Exactly one listener is attached per adapter; events are dropped until
/// one is attached.
pub trait ChannelListener: Send + Sync {
    /// The channel reached the open state
    fn on_channel_open(&self, label: &str);

    /// The channel was lost or closed by the transport
    fn on_channel_disconnected(&self, label: &str);

    /// A message arrived from the remote peer
    fn on_channel_message(&self, label: &str, data: Bytes);

    /// The transport's outstanding-bytes amount changed
    fn on_buffered_amount_change(&self, label: &str, outstanding: u64);
}

/// Wrapper around one transport-provided data channel
///
/// Adds watermark-gated sends, a bounded synchronous send, and fan-out of
/// channel lifecycle events to a single attached listener. The transport
/// owns the channel's transmission resources; the adapter owns only the
/// event subscription.
pub struct DataChannelAdapter {
    channel: Arc<dyn TransportChannel>,
    label: String,
    config: ChannelConfig,
    observed_state: Mutex<ChannelState>,
    listener: Mutex<Option<Arc<dyn ChannelListener>>>,
    drained: Notify,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DataChannelAdapter {
    /// Wrap a transport channel, subscribing to its events and snapshotting
    /// its current state
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(channel: Arc<dyn TransportChannel>, config: ChannelConfig) -> Arc<Self> {
        let label = channel.label();
        let observed_state = channel.state();

        let adapter = Arc::new(Self {
            channel: channel.clone(),
            label,
            config,
            observed_state: Mutex::new(observed_state),
            listener: Mutex::new(None),
            drained: Notify::new(),
            pump: Mutex::new(None),
        });

        match channel.take_events() {
            Some(events) => {
                let task = tokio::spawn(Self::pump_events(Arc::downgrade(&adapter), events));
                *adapter.pump.lock() = Some(task);
            }
            None => warn!(
                "Channel '{}' events already claimed, adapter will not observe lifecycle",
                adapter.label
            ),
        }

        adapter
    }

    /// Channel label agreed during negotiation
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Last observed channel lifecycle state
    pub fn observed_state(&self) -> ChannelState {
        *self.observed_state.lock()
    }

    /// Whether the channel currently reports open
    pub fn is_open(&self) -> bool {
        self.observed_state() == ChannelState::Open
    }

    /// Attach the single event listener
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if a listener is already attached; the
    /// existing listener is never silently replaced.
    pub fn attach_listener(&self, listener: Arc<dyn ChannelListener>) -> Result<()> {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            warn!("Listener already attached to channel '{}'", self.label);
            return Err(Error::InvalidState(format!(
                "listener already attached to channel '{}'",
                self.label
            )));
        }
        *slot = Some(listener);
        Ok(())
    }

    /// Detach the event listener
    pub fn detach_listener(&self) {
        if self.listener.lock().take().is_none() {
            debug!("Detach on channel '{}' without an attached listener", self.label);
        }
    }

    /// Enqueue bytes for asynchronous transmission
    ///
    /// # Errors
    ///
    /// Returns `Error::BufferFull` without enqueuing when the outstanding
    /// amount already meets or exceeds the configured high-water mark, or
    /// the transport's error when the enqueue itself is rejected.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let outstanding = self.channel.buffered_amount().await;
        if outstanding >= self.config.high_watermark {
            return Err(Error::BufferFull(format!(
                "{} bytes outstanding on channel '{}'",
                outstanding, self.label
            )));
        }

        self.channel.send(data).await
    }

    /// Enqueue bytes and wait until the transport reports zero outstanding
    ///
    /// Bounded by the configured sync-send timeout; on expiry the enqueued
    /// data is not retracted, the transport may still deliver it later.
    ///
    /// Concurrent synchronous sends on the same adapter share a single
    /// completion signal: every waiter wakes on each drain and rechecks the
    /// outstanding amount.
    pub async fn send_sync(&self, data: Bytes) -> Result<()> {
        self.channel.send(data).await?;

        let deadline = tokio::time::Instant::now() + self.config.sync_send_timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.channel.buffered_amount().await == 0 {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::OperationTimeout(format!(
                    "synchronous send on channel '{}' not flushed within {:?}",
                    self.label, self.config.sync_send_timeout
                )));
            }
        }
    }

    /// True only when the channel is open and nothing is outstanding
    pub async fn is_writable(&self) -> bool {
        self.is_open() && self.channel.buffered_amount().await == 0
    }

    /// Stop observing events, close the channel if the transport has not
    /// already begun closing it, and detach the listener
    pub async fn shutdown(&self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }

        self.detach_listener();

        if !matches!(
            self.channel.state(),
            ChannelState::Closing | ChannelState::Closed
        ) {
            if let Err(e) = self.channel.close().await {
                warn!("Failed to close channel '{}': {}", self.label, e);
            }
        }
    }

    async fn pump_events(
        adapter: Weak<DataChannelAdapter>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(adapter) = adapter.upgrade() else {
                break;
            };
            adapter.handle_event(event);
        }
    }

    fn handle_event(&self, event: ChannelEvent) {
        let listener = self.listener.lock().clone();

        match event {
            ChannelEvent::StateChange(state) => {
                debug!("Channel '{}' state changed to {:?}", self.label, state);
                *self.observed_state.lock() = state;
                match state {
                    ChannelState::Open => {
                        if let Some(listener) = listener {
                            listener.on_channel_open(&self.label);
                        }
                    }
                    ChannelState::Closed => {
                        // Wake synchronous senders so they recheck instead of
                        // sleeping out the full deadline on a dead channel.
                        self.drained.notify_waiters();
                        if let Some(listener) = listener {
                            listener.on_channel_disconnected(&self.label);
                        }
                    }
                    _ => {}
                }
            }
            ChannelEvent::Message(data) => {
                if let Some(listener) = listener {
                    listener.on_channel_message(&self.label, data);
                }
            }
            ChannelEvent::BufferedAmountChange(outstanding) => {
                if outstanding == 0 {
                    self.drained.notify_waiters();
                }
                if let Some(listener) = listener {
                    listener.on_buffered_amount_change(&self.label, outstanding);
                }
            }
        }
    }
}

impl Drop for DataChannelAdapter {
    fn drop(&mut self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }

        // Destruction without an explicit shutdown still closes the channel
        // unless the transport already started closing it.
        if !matches!(
            self.channel.state(),
            ChannelState::Closing | ChannelState::Closed
        ) {
            let channel = self.channel.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = channel.close().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockChannel;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingListener {
        opens: AtomicU64,
        disconnects: AtomicU64,
        messages: Mutex<Vec<Bytes>>,
        buffered_changes: AtomicU64,
    }

    impl ChannelListener for CountingListener {
        fn on_channel_open(&self, _label: &str) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn on_channel_disconnected(&self, _label: &str) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_channel_message(&self, _label: &str, data: Bytes) {
            self.messages.lock().push(data);
        }

        fn on_buffered_amount_change(&self, _label: &str, _outstanding: u64) {
            self.buffered_changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn small_config() -> ChannelConfig {
        ChannelConfig {
            high_watermark: 64,
            sync_send_timeout: Duration::from_millis(100),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_snapshot_state_at_construction() {
        let channel = Arc::new(MockChannel::new("snap"));
        channel.set_state(ChannelState::Open);

        let adapter = DataChannelAdapter::new(channel.clone(), small_config());
        assert_eq!(adapter.observed_state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_double_attach_rejected() {
        let channel = Arc::new(MockChannel::new("attach"));
        let adapter = DataChannelAdapter::new(channel, small_config());

        let listener = Arc::new(CountingListener::default());
        adapter.attach_listener(listener.clone()).unwrap();
        assert!(adapter.attach_listener(listener).is_err());
    }

    #[tokio::test]
    async fn test_listener_receives_events() {
        let channel = Arc::new(MockChannel::new("events"));
        let adapter = DataChannelAdapter::new(channel.clone(), small_config());

        let listener = Arc::new(CountingListener::default());
        adapter.attach_listener(listener.clone()).unwrap();

        channel.open();
        channel.push_message(Bytes::from_static(b"ping"));
        channel.set_state(ChannelState::Closed);
        settle().await;

        assert_eq!(listener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(listener.messages.lock().len(), 1);
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.observed_state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_send_rejected_at_watermark() {
        let channel = Arc::new(MockChannel::new("backpressure"));
        let adapter = DataChannelAdapter::new(channel.clone(), small_config());
        channel.open();
        settle().await;

        channel.set_buffered(64);
        let err = adapter.send(Bytes::from_static(b"data")).await.unwrap_err();
        assert!(matches!(err, Error::BufferFull(_)));
        // Nothing was enqueued
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_below_watermark_enqueues() {
        let channel = Arc::new(MockChannel::new("send"));
        let adapter = DataChannelAdapter::new(channel.clone(), small_config());
        channel.open();
        settle().await;

        adapter.send(Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_send_sync_completes_on_drain() {
        let channel = Arc::new(MockChannel::new("drain"));
        let adapter = DataChannelAdapter::new(channel.clone(), small_config());
        channel.open();
        settle().await;

        let drainer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drainer.set_buffered(0);
        });

        adapter.send_sync(Bytes::from_static(b"data")).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_sync_times_out_without_drain() {
        let channel = Arc::new(MockChannel::new("timeout"));
        let adapter = DataChannelAdapter::new(channel.clone(), small_config());
        channel.open();
        settle().await;

        let err = adapter
            .send_sync(Bytes::from_static(b"data"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationTimeout(_)));
    }

    #[tokio::test]
    async fn test_is_writable() {
        let channel = Arc::new(MockChannel::new("writable"));
        let adapter = DataChannelAdapter::new(channel.clone(), small_config());

        assert!(!adapter.is_writable().await);

        channel.open();
        settle().await;
        assert!(adapter.is_writable().await);

        channel.set_buffered(10);
        assert!(!adapter.is_writable().await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let channel = Arc::new(MockChannel::new("shutdown"));
        let adapter = DataChannelAdapter::new(channel.clone(), small_config());
        channel.open();
        settle().await;

        adapter.shutdown().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
