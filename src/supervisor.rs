//! Keeps a [`WsClient`] alive across disconnects.
//!
//! Grounded on `m2m.py`'s `AutoConnectThread`: connect, wait for readiness,
//! publish identity, reconnect on loss, poll at a fixed cadence rather than
//! with exponential backoff (the broker itself is the rate limiter).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::ws_client::{ClientEventSink, WsClient};

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Observer for identity transitions published by the supervisor.
pub trait IdentityObserver: Send + Sync {
    fn set_identity(&self, identity: Option<String>);
}

pub struct Supervisor {
    url: String,
    insecure_tls: bool,
    sink: Arc<dyn ClientEventSink>,
    observer: Arc<dyn IdentityObserver>,
    client: Mutex<Option<Arc<WsClient>>>,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(
        url: String,
        insecure_tls: bool,
        sink: Arc<dyn ClientEventSink>,
        observer: Arc<dyn IdentityObserver>,
    ) -> Arc<Supervisor> {
        let (exit_tx, exit_rx) = watch::channel(false);
        Arc::new(Supervisor {
            url,
            insecure_tls,
            sink,
            observer,
            client: Mutex::new(None),
            exit_tx,
            exit_rx,
        })
    }

    /// Current WS client, if a connection attempt has been made.
    pub fn client(&self) -> Option<Arc<WsClient>> {
        self.client.lock().unwrap().clone()
    }

    fn start_connect(&self, prior_identity: Option<String>) {
        debug!(url = %self.url, "connecting to m2m broker");
        let client = WsClient::connect(
            self.url.clone(),
            prior_identity,
            self.insecure_tls,
            self.sink.clone(),
        );
        *self.client.lock().unwrap() = Some(client);
    }

    /// Run until [`Supervisor::stop`] is called. Intended to be spawned as
    /// its own task.
    pub async fn run(self: Arc<Self>, initial_identity: Option<String>) {
        self.start_connect(initial_identity);

        loop {
            let client = self.client().expect("start_connect always sets a client");
            let identity = client.wait_ready(READY_TIMEOUT).await;
            self.observer.set_identity(identity.clone());

            if client.is_closed() || identity.is_none() {
                self.start_connect(identity);
            }

            let mut exit_rx = self.exit_rx.clone();
            if *exit_rx.borrow() {
                break;
            }
            let _ = tokio::time::timeout(POLL_INTERVAL, exit_rx.changed()).await;
            if *exit_rx.borrow() {
                break;
            }
        }

        self.observer.set_identity(None);
        if let Some(client) = self.client() {
            client.close(Duration::from_secs(5)).await;
        }
    }

    /// Signal [`Supervisor::run`] to exit and tear down the current client.
    pub fn stop(&self) {
        let _ = self.exit_tx.send(true);
    }
}
