//! Typed errors for the parts of the agent where a caller needs to match on
//! the failure kind. Everything else surfaces as `anyhow::Error`.

use thiserror::Error;

/// Errors produced while decoding or constructing a wire [`crate::packet::Packet`].
#[derive(Debug, Error)]
pub enum PacketError {
    /// The bytes were not valid Bencode, the top-level value was not the
    /// `[type, attr...]` list shape the wire format requires, or the type
    /// integer does not name a registered packet type.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The Bencode decoded fine and the packet type is registered, but its
    /// attributes don't match the type's declared shape.
    #[error("bad packet: {0}")]
    BadPacket(String),
}

/// Errors produced while loading [`crate::config::AgentConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ini::Error,
    },

    #[error("invalid value for [{section}] {key}: {value}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}
