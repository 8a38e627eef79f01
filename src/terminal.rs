//! A named, configured shell that can be spawned into a pty and attached to
//! a channel on demand.
//!
//! Grounded on `m2m.py`'s `Terminal` (launch/close, pruning of dead
//! children) and `remoteprocess.py`'s `RemoteProcess` (the pty<->channel
//! pumps and the channel-closes-on-pty-failure wiring).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::pty::{PtyChild, WindowSize};

struct RunningProcess {
    pty: Arc<Mutex<PtyChild>>,
    exited: Arc<AtomicBool>,
}

impl RunningProcess {
    /// The channel's `on_data` callback holds its own clone of `pty` for as
    /// long as the channel exists, so a strong-count probe never reports
    /// this process dead. `exited` is set by the pty->channel pump the
    /// instant it observes EOF or a read error, which is the actual signal
    /// that the child is gone.
    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }
}

pub struct Terminal {
    name: String,
    command: String,
    user: Option<String>,
    group: Option<String>,
    processes: Mutex<Vec<RunningProcess>>,
}

impl Terminal {
    pub fn new(name: String, command: String, user: Option<String>, group: Option<String>) -> Self {
        Terminal {
            name,
            command,
            user,
            group,
            processes: Mutex::new(Vec::new()),
        }
    }

    fn prune_closed(&self) {
        self.processes.lock().unwrap().retain(|p| p.is_alive());
    }

    /// Spawn `self.command` inside a fresh pty and wire it to `channel`.
    /// Each launch yields an independent child; multiple simultaneous
    /// launches on the same [`Terminal`] are supported.
    pub fn launch(&self, channel: Arc<Channel>, size: Option<WindowSize>) {
        self.prune_closed();
        debug!(terminal = %self.name, "opening terminal");

        let pty = match PtyChild::spawn(
            &self.command,
            self.user.as_deref(),
            self.group.as_deref(),
            size.unwrap_or_default(),
        ) {
            Ok(pty) => pty,
            Err(e) => {
                error!(terminal = %self.name, error = %e, "failed to launch terminal process");
                channel.close();
                return;
            }
        };
        let pty = Arc::new(Mutex::new(pty));
        let exited = Arc::new(AtomicBool::new(false));

        self.processes.lock().unwrap().push(RunningProcess {
            pty: pty.clone(),
            exited: exited.clone(),
        });
        info!(terminal = %self.name, command = %self.command, "launched remote process");

        // channel -> pty: inbound bytes become pty stdin.
        let pty_for_data = pty.clone();
        let channel_for_close = channel.clone();
        channel.set_callbacks(
            Some(Box::new(move |data: &[u8]| {
                if let Err(e) = pty_for_data.lock().unwrap().write_master(data) {
                    warn!(error = %e, "error writing to terminal, closing channel");
                    channel_for_close.close();
                }
            })),
            Some({
                let pty_for_close = pty.clone();
                Box::new(move || {
                    pty_for_close.lock().unwrap().close();
                })
            }),
            None,
        );

        // pty -> channel: pump in a blocking task since pty reads block.
        let pty_for_pump = pty.clone();
        let channel_for_pump = channel;
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                let read = pty_for_pump.lock().unwrap().read_master(&mut buf);
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        let channel = channel_for_pump.clone();
                        // write() is async; block_in_place keeps us on this
                        // worker thread rather than spawning yet another task
                        // per chunk.
                        let handle = tokio::runtime::Handle::current();
                        let _ = handle.block_on(async { channel.write(&data).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading from terminal");
                        break;
                    }
                }
            }
            exited.store(true, Ordering::SeqCst);
            channel_for_pump.close();
        });
    }

    /// Kill and reap every live child, then clear the process list.
    pub fn close(&self) {
        self.prune_closed();
        let mut processes = self.processes.lock().unwrap();
        for process in processes.drain(..) {
            debug!(terminal = %self.name, "closing terminal process");
            process.pty.lock().unwrap().close();
        }
    }
}
