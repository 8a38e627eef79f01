//! The narrow seam between the core and the (out-of-scope) JSON-RPC client
//! and input-device subsystem.
//!
//! Grounded on `m2m.py`'s `self.client.set_m2m_identity`, `self.client.sync`
//! and `self.client.rc.open_keyboard`/`open_buttons` call sites. The real
//! HTTP-backed implementations live outside this crate; [`LoggingRpcClient`]
//! and [`LoggingInputDeviceRouter`] keep the agent runnable standalone and
//! give tests a concrete, injectable collaborator.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::channel::Channel;

/// Calls the core makes into the device-registration / telemetry layer.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// The node's current m2m identity changed (or was cleared).
    async fn notify_identity(&self, identity: Option<String>);

    /// Ask the RPC layer to run a sync cycle immediately.
    async fn sync_now(&self);

    /// Piggyback a notification on the next outbound sync batch.
    async fn batch_notify(&self, method: &str, identity: &str);
}

pub struct LoggingRpcClient;

#[async_trait]
impl RpcClient for LoggingRpcClient {
    async fn notify_identity(&self, identity: Option<String>) {
        info!(?identity, "rpc: notify_identity");
    }

    async fn sync_now(&self) {
        info!("rpc: sync_now");
    }

    async fn batch_notify(&self, method: &str, identity: &str) {
        info!(method, identity, "rpc: batch_notify");
    }
}

/// Receives opened channels for the keyboard/button remote-control surface;
/// the wire protocol spoken over those channels is out of scope here.
pub trait InputDeviceRouter: Send + Sync {
    fn open_keyboard(&self, name: &str, channel: Arc<Channel>);
    fn open_buttons(&self, name: &str, channel: Arc<Channel>);
}

pub struct LoggingInputDeviceRouter;

impl InputDeviceRouter for LoggingInputDeviceRouter {
    fn open_keyboard(&self, name: &str, channel: Arc<Channel>) {
        info!(name, channel = channel.number(), "input device: open_keyboard");
    }

    fn open_buttons(&self, name: &str, channel: Arc<Channel>) {
        info!(name, channel = channel.number(), "input device: open_buttons");
    }
}
