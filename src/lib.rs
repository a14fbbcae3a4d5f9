//! Audio reflector for talkgroup-based amateur-radio voice-over-IP networks.
//!
//! Radio gateway nodes connect over a framed TCP control link, authenticate
//! with an HMAC challenge/response, subscribe to a talkgroup and stream
//! compressed audio frames over UDP. The reflector arbitrates one talker per
//! talkgroup at a time and fans the talker's audio out to every other member,
//! the half-duplex discipline of a two-way radio channel.
//!
//! ## Example
//!
//! ```no_run
//! use reflector::{Config, ReflectorServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = Config::default();
//!     cfg.users.insert("SM0ABC".into(), "change-me".into());
//!     ReflectorServer::new(cfg).serve().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod error;
pub mod messages;
pub mod server;
pub mod tg;
pub mod udp;

pub use error::ReflectorError;
pub use messages::{ControlMessage, FrameDecoder, ProtoVer};
pub use server::{Config, ReflectorServer};
pub use tg::{ClientId, TalkerChange, TgRegistry};
pub use udp::{SeqCheck, UdpHeader, UdpMessage};
