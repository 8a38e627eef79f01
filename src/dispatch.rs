//! A small static dispatch table: binds a [`PacketType`] to a handler
//! closure over some target type, built once at construction time.
//!
//! This replaces the original's metaclass-based packet registry and
//! decorator-exposed handler methods (`@expose(PacketType.welcome)`) with an
//! explicit table assembled in Rust — there is no runtime reflection here.

use std::collections::HashMap;

use tracing::debug;

use crate::packet::{Packet, PacketType};

type Handler<T> = Box<dyn Fn(&T, Packet) + Send + Sync>;

pub struct Dispatcher<T> {
    handlers: HashMap<PacketType, Handler<T>>,
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        Dispatcher {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` to run whenever a packet of type `packet_type`
    /// arrives. Registering the same type twice replaces the old handler.
    pub fn register(
        &mut self,
        packet_type: PacketType,
        handler: impl Fn(&T, Packet) + Send + Sync + 'static,
    ) {
        self.handlers.insert(packet_type, Box::new(handler));
    }

    /// Dispatch `packet` to its registered handler, if any. Unknown types
    /// are logged and dropped rather than treated as an error: the wire
    /// catalog is wider than what any one dispatcher acts on.
    pub fn dispatch(&self, target: &T, packet: Packet) {
        let packet_type = packet.packet_type();
        match self.handlers.get(&packet_type) {
            Some(handler) => handler(target, packet),
            None => debug!(?packet_type, "no handler registered, dropping packet"),
        }
    }
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn dispatches_to_registered_handler() {
        let seen = Arc::new(AtomicI64::new(0));
        let mut dispatcher: Dispatcher<Arc<AtomicI64>> = Dispatcher::new();
        dispatcher.register(PacketType::NotifyOpen, |target, packet| {
            if let Packet::NotifyOpen { channel } = packet {
                target.store(channel, Ordering::SeqCst);
            }
        });
        dispatcher.dispatch(&seen, Packet::NotifyOpen { channel: 42 });
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn unregistered_type_is_dropped_without_panic() {
        let seen = Arc::new(AtomicI64::new(-1));
        let dispatcher: Dispatcher<Arc<AtomicI64>> = Dispatcher::new();
        dispatcher.dispatch(&seen, Packet::KeepAlive);
        assert_eq!(seen.load(Ordering::SeqCst), -1);
    }
}
