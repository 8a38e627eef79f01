//! A single logical byte stream multiplexed inside the WebSocket link.
//!
//! Grounded on the original `wsclient.Channel`: an inbound FIFO plus a
//! data-available signal, with optional callbacks that receive data as it
//! arrives instead of requiring a blocking read.

use std::collections::VecDeque;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::ws_client::WsClient;

type DataCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
type CloseCallback = Box<dyn Fn() + Send + Sync>;
type ControlCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_data: Option<DataCallback>,
    on_close: Option<CloseCallback>,
    on_control: Option<ControlCallback>,
}

struct Inner {
    fifo: VecDeque<u8>,
    closed: bool,
    callbacks: Callbacks,
}

/// One multiplexed channel. Channels never keep their owning client alive:
/// `client` is a weak reference so a client can tear down its channel table
/// without channels holding it open.
pub struct Channel {
    number: i64,
    client: Weak<WsClient>,
    inner: Mutex<Inner>,
    data_available: Notify,
}

impl Channel {
    pub fn new(number: i64, client: Weak<WsClient>) -> Self {
        Channel {
            number,
            client,
            inner: Mutex::new(Inner {
                fifo: VecDeque::new(),
                closed: false,
                callbacks: Callbacks::default(),
            }),
            data_available: Notify::new(),
        }
    }

    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Install (or clear, by passing `None`) the data/close/control callbacks.
    /// Replaces any previously installed set atomically.
    pub fn set_callbacks(
        &self,
        on_data: Option<DataCallback>,
        on_close: Option<CloseCallback>,
        on_control: Option<ControlCallback>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.callbacks = Callbacks {
            on_data,
            on_close,
            on_control,
        };
    }

    /// Called by the WS client's read loop when a `route` packet for this
    /// channel arrives. If a data callback is installed, delivery happens
    /// directly; otherwise the bytes are buffered for `read`.
    pub fn on_data(&self, data: &[u8]) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                trace!(channel = self.number, "dropping data on closed channel");
                return;
            }
            if inner.callbacks.on_data.is_none() {
                inner.fifo.extend(data.iter().copied());
            }
            inner.callbacks.on_data.is_some()
        };
        self.data_available.notify_waiters();
        if callback {
            let inner = self.inner.lock().unwrap();
            if let Some(cb) = inner.callbacks.on_data.as_ref() {
                cb(data);
            }
        }
    }

    /// Called by the WS client's read loop on an inbound `notify-open`
    /// control signal for this channel.
    pub fn on_control(&self, data: &[u8]) {
        let inner = self.inner.lock().unwrap();
        if let Some(cb) = inner.callbacks.on_control.as_ref() {
            cb(data);
        }
    }

    /// Read up to `count` bytes already buffered (or, if `block`, wait up to
    /// `timeout` for data to arrive). Partial reads are allowed; leftover
    /// bytes stay queued.
    pub async fn read(&self, count: usize, timeout: Option<Duration>, block: bool) -> Vec<u8> {
        if block && self.inner.lock().unwrap().fifo.is_empty() {
            let notified = self.data_available.notified();
            match timeout {
                Some(d) => {
                    let _ = tokio::time::timeout(d, notified).await;
                }
                None => notified.await,
            }
        }
        let mut inner = self.inner.lock().unwrap();
        let n = count.min(inner.fifo.len());
        inner.fifo.drain(..n).collect()
    }

    /// Enqueue `data` as a `send-req` on the owning client. Fails silently
    /// (mirroring `close()`'s write-after-close tolerance) if the channel or
    /// its client is gone.
    pub async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        if self.inner.lock().unwrap().closed {
            anyhow::bail!("channel {} is closed", self.number);
        }
        let client = self
            .client
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("owning client has been dropped"))?;
        client.channel_write(self.number, data).await
    }

    /// Idempotent. Marks the channel closed, fires `on_close` at most once,
    /// and drops any buffered data.
    pub fn close(&self) {
        let on_close = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.fifo.clear();
            inner.callbacks.on_close.take()
        };
        debug!(channel = self.number, "channel closed");
        self.data_available.notify_waiters();
        if let Some(cb) = on_close {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn orphan_channel(number: i64) -> Channel {
        Channel::new(number, Weak::new())
    }

    #[tokio::test]
    async fn read_returns_buffered_data_in_order() {
        let ch = orphan_channel(1);
        ch.on_data(b"hello");
        ch.on_data(b" world");
        let data = ch.read(11, None, false).await;
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn partial_read_leaves_remainder_queued() {
        let ch = orphan_channel(1);
        ch.on_data(b"abcdef");
        assert_eq!(ch.read(3, None, false).await, b"abc");
        assert_eq!(ch.read(3, None, false).await, b"def");
    }

    #[tokio::test]
    async fn data_callback_bypasses_fifo() {
        let ch = orphan_channel(2);
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        ch.set_callbacks(
            Some(Box::new(move |data: &[u8]| {
                received2.fetch_add(data.len(), Ordering::SeqCst);
            })),
            None,
            None,
        );
        ch.on_data(b"12345");
        assert_eq!(received.load(Ordering::SeqCst), 5);
        assert!(ch.read(10, None, false).await.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fires_once() {
        let ch = orphan_channel(3);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        ch.set_callbacks(None, Some(Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        })), None);
        ch.close();
        ch.close();
        ch.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn data_dropped_after_close() {
        let ch = orphan_channel(4);
        ch.close();
        ch.on_data(b"ignored");
        assert!(ch.read(10, None, false).await.is_empty());
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let ch = orphan_channel(5);
        ch.close();
        assert!(ch.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn blocking_read_times_out_with_no_data() {
        let ch = orphan_channel(6);
        let data = ch.read(10, Some(Duration::from_millis(10)), true).await;
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_data() {
        let ch = Arc::new(orphan_channel(7));
        let writer = ch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            writer.on_data(b"woke");
        });
        let data = ch.read(10, Some(Duration::from_secs(1)), true).await;
        assert_eq!(data, b"woke");
    }
}
