pub mod block;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod repcap;
pub mod session;
pub mod transfer;

pub use config::SessionConfig;
pub use error::{Error, ErrorEntry, Result};
pub use session::{Command, Reply, ReplyKind, Session};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
