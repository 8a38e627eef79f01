//! # M2M Agent
//!
//! An on-device remote-access agent: it multiplexes a remote terminal and
//! configured port forwards over a single auto-reconnecting WebSocket link
//! to an M2M broker.

pub mod bencode;
pub mod channel;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod instruction;
pub mod manager;
pub mod packet;
pub mod portforward;
pub mod pty;
pub mod rpc;
pub mod supervisor;
pub mod terminal;
pub mod ws_client;

mod logging;
pub use logging::ColorizedFormatter;

pub use cli::Args;
pub use config::AgentConfig;
pub use manager::Manager;

/// The current version of the agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Default path to the agent's configuration file.
    pub const CONFIG_PATH: &str = "/etc/dataplicity/dataplicity.conf";

    /// Default rolling log file name when `--log-file` names a directory
    /// rather than "stderr".
    pub const LOG_FILE_NAME: &str = "m2m-agent.log";
}
