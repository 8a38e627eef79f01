//! Owns the WebSocket connection to the M2M broker: the join/identify
//! handshake, the channel table, the outbound send serializer, and the
//! inbound packet dispatch table.
//!
//! Grounded on `wsclient.py`'s `WSClient` (handler methods, `send`,
//! `get_channel`, `channels` dict) and on the teacher's
//! `src/ipc/tcp_socket.rs` for the async read/write-half split.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::bencode::Value;
use crate::channel::Channel;
use crate::dispatch::Dispatcher;
use crate::packet::{Packet, PacketType};

/// Maximum bytes echoed back in a `pong` reply, capping amplification.
const PONG_MAX_BYTES: usize = 1024;

/// Callbacks the owner of a [`WsClient`] wants invoked for events the client
/// itself has no opinion about: inbound instructions and socket closure.
pub trait ClientEventSink: Send + Sync {
    fn on_instruction(&self, sender: Vec<u8>, data: BTreeMap<Vec<u8>, Value>);
    fn on_close(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

pub struct WsClient {
    url: String,
    self_weak: Weak<WsClient>,
    channels: Mutex<HashMap<i64, Arc<Channel>>>,
    sink: Mutex<Arc<dyn ClientEventSink>>,
    identity: Mutex<Option<String>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    closed: AtomicBool,
    outbound: AsyncMutex<Option<WsSink>>,
    pending_commands: Mutex<HashMap<i64, oneshot::Sender<BTreeMap<Vec<u8>, Value>>>>,
}

impl WsClient {
    /// Begin connecting in the background and return immediately; the
    /// caller observes readiness via [`WsClient::wait_ready`].
    pub fn connect(
        url: String,
        prior_identity: Option<String>,
        insecure_tls: bool,
        sink: Arc<dyn ClientEventSink>,
    ) -> Arc<WsClient> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let client = Arc::new_cyclic(|weak| WsClient {
            url: url.clone(),
            self_weak: weak.clone(),
            channels: Mutex::new(HashMap::new()),
            sink: Mutex::new(sink),
            identity: Mutex::new(prior_identity.clone()),
            ready_tx,
            ready_rx,
            closed: AtomicBool::new(false),
            outbound: AsyncMutex::new(None),
            pending_commands: Mutex::new(HashMap::new()),
        });

        let task_client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = task_client.run(prior_identity, insecure_tls).await {
                error!(url = %task_client.url, error = %e, "websocket client exited with error");
            }
            task_client.mark_closed();
        });

        client
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.ready_tx.send(true); // unblock any waiter; identity stays as-is (likely None)
        let sink = self.sink.lock().unwrap().clone();
        sink.on_close();
        for (_, tx) in self.pending_commands.lock().unwrap().drain() {
            let _ = tx.send(BTreeMap::new());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Block up to `timeout` for the handshake to complete (or fail), then
    /// return the resulting identity, if any.
    pub async fn wait_ready(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.ready_rx.clone();
        if !*rx.borrow() {
            let _ = tokio::time::timeout(timeout, rx.changed()).await;
        }
        self.identity.lock().unwrap().clone()
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.lock().unwrap().clone()
    }

    /// Get or create the channel numbered `n`. Channel numbers are reused
    /// freely across opens/closes within one connection.
    pub fn get_channel(self: &Arc<Self>, number: i64) -> Arc<Channel> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(number)
            .or_insert_with(|| Arc::new(Channel::new(number, self.self_weak.clone())))
            .clone()
    }

    /// Send a `send-req` carrying `data` for `channel`. Used by [`Channel::write`].
    pub async fn channel_write(&self, channel: i64, data: &[u8]) -> anyhow::Result<()> {
        self.send(Packet::SendReq {
            channel,
            data: data.to_vec(),
        })
        .await
    }

    /// Serialize `packet` onto the WebSocket as one binary frame.
    pub async fn send(&self, packet: Packet) -> anyhow::Result<()> {
        let bytes = packet.encode();
        let mut outbound = self.outbound.lock().await;
        match outbound.as_mut() {
            Some(sink) => {
                trace!(packet_type = ?packet.packet_type(), len = bytes.len(), "sending packet");
                sink.send(Message::Binary(bytes)).await?;
                Ok(())
            }
            None => anyhow::bail!("websocket not connected"),
        }
    }

    /// Send `request-leave`, wait briefly for the server to close, then
    /// force local teardown regardless.
    pub async fn close(&self, timeout: Duration) {
        if self.is_closed() {
            return;
        }
        let _ = self.send(Packet::LeaveReq).await;
        let mut rx = self.ready_rx.clone();
        let _ = tokio::time::timeout(timeout, async {
            while !self.is_closed() {
                let _ = rx.changed().await;
            }
        })
        .await;
        self.mark_closed();
        *self.outbound.lock().await = None;
    }

    async fn run(self: Arc<Self>, prior_identity: Option<String>, insecure_tls: bool) -> anyhow::Result<()> {
        let ws_stream = connect(&self.url, insecure_tls).await?;
        let (write, mut read) = ws_stream.split();
        *self.outbound.lock().await = Some(write);

        if let Some(uuid) = prior_identity {
            self.send(Packet::IdentifyReq { uuid: uuid.into_bytes() }).await?;
        } else {
            self.send(Packet::JoinReq).await?;
        }

        let dispatcher = build_dispatcher();

        while let Some(message) = read.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "websocket read error, closing");
                    break;
                }
            };
            let bytes = match message {
                Message::Binary(b) => b,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_) => continue,
            };
            match Packet::decode(&bytes) {
                Ok(packet) => dispatcher.dispatch(&self, packet),
                Err(e) => {
                    error!(error = %e, "dropping malformed packet");
                }
            }
        }

        Ok(())
    }
}

fn build_dispatcher() -> Dispatcher<Arc<WsClient>> {
    let mut d = Dispatcher::new();

    d.register(PacketType::SetIdentity, |client, packet| {
        if let Packet::SetIdentity { uuid } = packet {
            let identity = String::from_utf8_lossy(&uuid).into_owned();
            debug!(identity = %identity, "identity set");
            *client.identity.lock().unwrap() = Some(identity);
        }
    });

    d.register(PacketType::Welcome, |client, _packet| {
        debug!("handshake complete");
        let _ = client.ready_tx.send(true);
    });

    d.register(PacketType::Route, |client, packet| {
        if let Packet::Route { channel, data } = packet {
            let ch = client.get_channel(channel);
            ch.on_data(&data);
        }
    });

    d.register(PacketType::NotifyOpen, |client, packet| {
        if let Packet::NotifyOpen { channel } = packet {
            debug!(channel, "channel opened by server");
            client.get_channel(channel).on_control(b"open");
        }
    });

    d.register(PacketType::NotifyClose, |client, packet| {
        if let Packet::NotifyClose { port } = packet {
            debug!(channel = port, "channel closed by server");
            if let Some(ch) = client.channels.lock().unwrap().remove(&port) {
                ch.close();
            }
        }
    });

    d.register(PacketType::Ping, |client, packet| {
        if let Packet::Ping { mut data } = packet {
            data.truncate(PONG_MAX_BYTES);
            let client = client.clone();
            tokio::spawn(async move {
                let _ = client.send(Packet::Pong { data }).await;
            });
        }
    });

    d.register(PacketType::Log, |_client, packet| {
        if let Packet::Log { text } = packet {
            info!(message = %String::from_utf8_lossy(&text), "broker log");
        }
    });

    d.register(PacketType::KeepAlive, |_client, _packet| {
        trace!("keep-alive received");
    });

    d.register(PacketType::Instruction, |client, packet| {
        if let Packet::Instruction { sender, data } = packet {
            let sink = client.sink.lock().unwrap().clone();
            sink.on_instruction(sender, data);
        }
    });

    d.register(PacketType::Response, |client, packet| {
        if let Packet::Response { command_id, result } = packet {
            if let Some(tx) = client.pending_commands.lock().unwrap().remove(&command_id) {
                let _ = tx.send(result);
            }
        }
    });

    d
}

async fn connect(url: &str, insecure_tls: bool) -> anyhow::Result<WsStream> {
    if insecure_tls {
        let connector = insecure_connector();
        let (stream, _response) =
            tokio_tungstenite::connect_async_tls_with_config(url, None, false, Some(connector))
                .await?;
        Ok(stream)
    } else {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(stream)
    }
}

/// Build a TLS connector that skips certificate verification. Only reached
/// when the operator has explicitly opted in via configuration; the default
/// path above always verifies against the webpki root store.
fn insecure_connector() -> tokio_tungstenite::Connector {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct AcceptAny(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny(provider)))
        .with_no_client_auth();
    tokio_tungstenite::Connector::Rustls(Arc::new(config))
}
