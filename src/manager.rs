//! Owns the supervisor, the terminals and port-forward services, and routes
//! inbound instructions to them.
//!
//! Grounded on `m2m.py`'s `M2MManager`/`M2MClient`: `set_identity` notifies
//! the RPC layer on transition, `on_instruction` dispatches by `action`, and
//! `on_client_close` tears down every terminal.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::bencode::Value;
use crate::config::AgentConfig;
use crate::instruction::Instruction;
use crate::portforward::PortForwardManager;
use crate::rpc::{InputDeviceRouter, RpcClient};
use crate::supervisor::{IdentityObserver, Supervisor};
use crate::terminal::Terminal;
use crate::ws_client::ClientEventSink;

pub struct Manager {
    supervisor: Arc<Supervisor>,
    terminals: HashMap<String, Arc<Terminal>>,
    port_forwards: Mutex<PortForwardManager>,
    rpc: Arc<dyn RpcClient>,
    input_router: Arc<dyn InputDeviceRouter>,
    identity: Mutex<Option<String>>,
    notified_identity: Mutex<Option<String>>,
}

impl Manager {
    pub fn new(
        config: &AgentConfig,
        rpc: Arc<dyn RpcClient>,
        input_router: Arc<dyn InputDeviceRouter>,
    ) -> Arc<Manager> {
        let mut port_forwards = PortForwardManager::new();
        for pf in &config.port_forwards {
            port_forwards.add_service(pf.name.clone(), pf.host.clone(), pf.port);
        }

        let mut terminals = HashMap::new();
        for t in &config.terminals {
            terminals.insert(
                t.name.clone(),
                Arc::new(Terminal::new(
                    t.name.clone(),
                    t.command.clone(),
                    t.user.clone(),
                    t.group.clone(),
                )),
            );
        }

        Arc::new_cyclic(|weak: &Weak<Manager>| {
            let sink: Arc<dyn ClientEventSink> = weak.clone().upgrade_to_sink();
            let observer: Arc<dyn IdentityObserver> = weak.clone().upgrade_to_observer();
            let supervisor = Supervisor::new(config.m2m.url.clone(), config.m2m.insecure_tls, sink, observer);
            Manager {
                supervisor,
                terminals,
                port_forwards: Mutex::new(port_forwards),
                rpc,
                input_router,
                identity: Mutex::new(config.m2m.identity.clone()),
                notified_identity: Mutex::new(None),
            }
        })
    }

    /// Start the auto-connect supervisor; runs until [`Manager::close`].
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let identity = self.identity.lock().unwrap().clone();
        tokio::spawn(async move { supervisor.run(identity).await })
    }

    pub async fn close(&self) {
        debug!("manager closing");
        self.supervisor.stop();
        for terminal in self.terminals.values() {
            terminal.close();
        }
    }

    fn dispatch_instruction(&self, sender: Vec<u8>, instruction: Instruction) {
        debug!(?instruction, sender = %String::from_utf8_lossy(&sender), "instruction received");
        match instruction {
            Instruction::Sync => {
                let rpc = self.rpc.clone();
                tokio::spawn(async move { rpc.sync_now().await });
            }
            Instruction::OpenTerminal { name, port, size } => {
                let Some(terminal) = self.terminals.get(&name) else {
                    warn!(terminal = %name, "no terminal with this name");
                    return;
                };
                let Some(client) = self.supervisor.client() else {
                    warn!("no active websocket client, dropping open-terminal");
                    return;
                };
                let channel = client.get_channel(port);
                terminal.launch(channel, size);
            }
            Instruction::OpenKeyboard { name, port } => {
                if let Some(client) = self.supervisor.client() {
                    self.input_router.open_keyboard(&name, client.get_channel(port));
                }
            }
            Instruction::OpenButtons { name, port } => {
                if let Some(client) = self.supervisor.client() {
                    self.input_router.open_buttons(&name, client.get_channel(port));
                }
            }
            Instruction::OpenEcho { port } => {
                let Some(client) = self.supervisor.client() else { return };
                let channel = client.get_channel(port);
                debug!(port, "opening echo service");
                // `on_data` fires synchronously on the WS read loop; queue
                // through an mpsc and let a single writer task drain it so
                // chunks reach `channel.write` in arrival order. Spawning a
                // task per chunk would let two writes race for the channel's
                // send lock and reorder bytes.
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
                channel.set_callbacks(
                    Some(Box::new(move |data: &[u8]| {
                        let _ = tx.send(data.to_vec());
                    })),
                    None,
                    None,
                );
                let echo_channel = channel.clone();
                tokio::spawn(async move {
                    while let Some(data) = rx.recv().await {
                        if echo_channel.write(&data).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Instruction::OpenPortforward { service, route } => {
                let Some(client) = self.supervisor.client() else { return };
                let port_forwards = self.port_forwards.lock().unwrap();
                let Some(svc) = port_forwards.get_service(&service) else {
                    warn!(service = %service, "no port-forward service with this name");
                    return;
                };
                drop(port_forwards);
                let channel_port = route[3];
                svc.connect(client.get_channel(channel_port));
            }
            Instruction::RebootDevice => {
                debug!("reboot requested");
                reboot();
            }
            Instruction::Unknown { action } => {
                warn!(action = %action, "unknown instruction action");
            }
        }
    }
}

/// Fork a detached reboot process. Deliberately not a blocking `Command::status`
/// call, which would prevent the agent from exiting gracefully in the meantime.
fn reboot() {
    match std::process::Command::new("/usr/bin/sudo")
        .arg("/sbin/reboot")
        .spawn()
    {
        Ok(child) => debug!(pid = child.id(), "opened reboot process"),
        Err(e) => warn!(error = %e, "failed to spawn reboot process"),
    }
}

impl ClientEventSink for Manager {
    fn on_instruction(&self, sender: Vec<u8>, data: BTreeMap<Vec<u8>, Value>) {
        match Instruction::parse(&data) {
            Ok(instruction) => self.dispatch_instruction(sender, instruction),
            Err(e) => warn!(error = %e, "malformed instruction, dropping"),
        }
    }

    fn on_close(&self) {
        debug!("websocket client closed, closing terminals");
        for terminal in self.terminals.values() {
            terminal.close();
        }
    }
}

impl IdentityObserver for Manager {
    fn set_identity(&self, identity: Option<String>) {
        *self.identity.lock().unwrap() = identity.clone();
        let should_notify = {
            let mut notified = self.notified_identity.lock().unwrap();
            if identity.is_some() && *notified != identity {
                *notified = identity.clone();
                true
            } else {
                false
            }
        };
        if should_notify {
            let rpc = self.rpc.clone();
            tokio::spawn(async move { rpc.notify_identity(identity).await });
        }
    }
}

/// Piggyback the current identity on the next outbound sync batch, the way
/// `M2MManager.on_sync` does. Exposed for the (out-of-scope) sync loop to
/// call; a no-op if not yet connected.
impl Manager {
    pub async fn on_sync(&self) {
        if let Some(identity) = self.identity.lock().unwrap().clone() {
            self.rpc.batch_notify("m2m.associate", &identity).await;
        }
    }
}

/// Converts a `Weak<Manager>` into the trait objects `Supervisor` needs,
/// without giving the supervisor a strong reference back to its owner.
trait WeakManagerExt {
    fn upgrade_to_sink(self) -> Arc<dyn ClientEventSink>;
    fn upgrade_to_observer(self) -> Arc<dyn IdentityObserver>;
}

impl WeakManagerExt for Weak<Manager> {
    fn upgrade_to_sink(self) -> Arc<dyn ClientEventSink> {
        Arc::new(ManagerRef(self))
    }
    fn upgrade_to_observer(self) -> Arc<dyn IdentityObserver> {
        Arc::new(ManagerRef(self))
    }
}

/// A cheap wrapper that forwards to the real `Manager` once it exists.
/// Needed because `Manager::new` must hand the supervisor a sink/observer
/// before the `Arc<Manager>` it points at has finished constructing
/// (`Arc::new_cyclic`).
struct ManagerRef(Weak<Manager>);

impl ClientEventSink for ManagerRef {
    fn on_instruction(&self, sender: Vec<u8>, data: BTreeMap<Vec<u8>, Value>) {
        if let Some(manager) = self.0.upgrade() {
            manager.on_instruction(sender, data);
        }
    }
    fn on_close(&self) {
        if let Some(manager) = self.0.upgrade() {
            manager.on_close();
        }
    }
}

impl IdentityObserver for ManagerRef {
    fn set_identity(&self, identity: Option<String>) {
        if let Some(manager) = self.0.upgrade() {
            manager.set_identity(identity);
        }
    }
}
