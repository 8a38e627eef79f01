//! Exposes a local TCP service through a channel, dialed on demand.
//!
//! Grounded on `portforward.py`'s `Connection`/`Service`/`PortForwardManager`:
//! a pre-connect buffer absorbs bytes that arrive before the dial completes,
//! flushed in order immediately after connect; the read side polls with a
//! bounded timeout purely so it can notice shutdown.
//!
//! Channel->socket bytes are handed off through a per-connection unbounded
//! `mpsc` channel rather than a spawned task per chunk: `on_data` fires
//! synchronously on the WS read loop, so a plain `send` preserves arrival
//! order, and a single writer task drains the queue into the socket in that
//! same order. Spawning a fresh task per chunk (as `portforward.py`'s
//! synchronous, lock-held `read_buffer` append does not need to worry about)
//! would let two chunks race for the socket and arrive out of order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::channel::Channel;

/// Bytes read from the forwarded socket per iteration.
const BUFFER_SIZE: usize = 1024 * 8;

pub struct Connection {
    id: u64,
    channel: Arc<Channel>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    close_notify: Notify,
}

impl Connection {
    fn new(
        id: u64,
        channel: Arc<Channel>,
        outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            channel,
            outbound_tx,
            close_notify: Notify::new(),
        })
    }

    /// Channel -> socket direction. Called synchronously from the channel's
    /// `on_data` callback; queuing here (rather than spawning) is what keeps
    /// arrival order intact all the way to the socket write.
    fn on_channel_data(&self, data: &[u8]) {
        let _ = self.outbound_tx.send(data.to_vec());
    }

    fn on_channel_close(&self) {
        debug!(connection = self.id, "channel closed, shutting down socket");
        self.close_notify.notify_waiters();
    }
}

/// A single named local service (host, port) that may be dialed any number
/// of times concurrently, once per channel the broker opens against it.
pub struct Service {
    name: String,
    host: String,
    port: u16,
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl Service {
    pub fn new(name: String, host: String, port: u16) -> Arc<Service> {
        Arc::new(Service {
            name,
            host,
            port,
            next_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Attach `channel` to a new dial of this service's (host, port).
    pub fn connect(self: &Arc<Self>, channel: Arc<Channel>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(id, channel.clone(), outbound_tx);
        self.connections.lock().unwrap().insert(id, connection.clone());

        {
            let data_conn = connection.clone();
            let close_conn = connection.clone();
            channel.set_callbacks(
                Some(Box::new(move |data: &[u8]| {
                    data_conn.on_channel_data(data);
                })),
                Some(Box::new(move || {
                    close_conn.on_channel_close();
                })),
                None,
            );
        }

        let service = self.clone();
        tokio::spawn(async move {
            service.run_connection(connection, outbound_rx).await;
        });
        debug!(service = %self.name, connection = id, "new port-forward connection");
    }

    async fn run_connection(
        self: Arc<Self>,
        connection: Arc<Connection>,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        debug!(service = %self.name, connection = connection.id, remote = %format!("{}:{}", self.host, self.port), "dialing");

        let socket = match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(service = %self.name, error = %e, "error connecting to forwarded service");
                connection.channel.close();
                self.connections.lock().unwrap().remove(&connection.id);
                return;
            }
        };
        let _ = socket.set_nodelay(true);
        let (mut read_half, mut write_half) = socket.into_split();

        // Bytes queued before the dial completed are still sitting in
        // outbound_rx in arrival order; the writer below drains them first.
        let writer = async {
            while let Some(chunk) = outbound_rx.recv().await {
                if let Err(e) = write_half.write_all(&chunk).await {
                    warn!(error = %e, "error writing to forwarded socket");
                    break;
                }
            }
        };

        let reader = async {
            let mut buf = [0u8; BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if connection.channel.write(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading forwarded socket");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
            _ = connection.close_notify.notified() => {}
        }

        debug!(service = %self.name, connection = connection.id, "connection finished");
        connection.channel.close();
        self.connections.lock().unwrap().remove(&connection.id);
    }
}

/// Owns every configured port-forward service, keyed by name.
pub struct PortForwardManager {
    services: HashMap<String, Arc<Service>>,
}

impl PortForwardManager {
    pub fn new() -> Self {
        PortForwardManager {
            services: HashMap::new(),
        }
    }

    pub fn add_service(&mut self, name: String, host: String, port: u16) {
        debug!(name = %name, host = %host, port, "added port forward service");
        self.services.insert(name.clone(), Service::new(name, host, port));
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).cloned()
    }
}

impl Default for PortForwardManager {
    fn default() -> Self {
        Self::new()
    }
}
