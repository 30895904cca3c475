//! The bridge core: socket servers, connection proxying, frame inspection
//! and the supervisor that keeps the running set in sync with configuration.

pub mod connection;
pub mod framing;
pub mod listener;
pub mod supervisor;

pub use connection::{ConnectionError, ConnectionSpec};
pub use framing::{Direction, FrameDecoder, StreamSniffer, MAX_FRAME_LEN};
pub use listener::{Server, ServerError, ServerKey, ACCEPT_RETRY_LIMIT};
pub use supervisor::{ConfigSource, SettingsConfigSource, Supervisor};
