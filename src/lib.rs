//! channeld: a publish/subscribe router for channel-addressed datagrams.
//!
//! Every datagram names a list of 64-bit destination channels. The router
//! delivers it to each locally connected participant subscribed to one of
//! those channels (or to a range covering one), then forwards it to the
//! optional parent router, so daemons compose into a tree. Subscriptions
//! are driven by control messages on the reserved channel `1`.
//!
//! # Quick start
//!
//! ```no_run
//! use channeld::{Config, MdServer};
//!
//! #[tokio::main]
//! async fn main() -> channeld::Result<()> {
//!     let config = Config::from_yaml(
//!         "messagedirector:\n  bind: \"127.0.0.1:7199\"\n",
//!     )?;
//!     let server = MdServer::new(config)?;
//!     server.run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod routing;
pub mod server;

pub use config::Config;
pub use error::{DisconnectReason, Error, Result};
pub use events::{EventSender, LoggedEvent};
pub use protocol::{Channel, Datagram, DatagramHandle, DatagramIterator};
pub use routing::{ChannelRange, DatagramSink, MessageDirector, Participant, ParticipantId};
pub use server::MdServer;
