//! SIP user agent: message model, digest auth, outbound registration and
//! the UDP server answering calls.

pub mod auth;
pub mod builder;
pub mod call_handler;
pub mod handler;
pub mod message;
pub mod registration;
pub mod sdp;
pub mod server;
pub mod transport;

pub use auth::DigestChallenge;
pub use builder::ResponseBuilder;
pub use call_handler::{AckHandler, HangupHandler, InviteHandler, OptionsHandler};
pub use handler::SipHandler;
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registration::{RegistrationWorker, ResponseMatchPolicy};
pub use sdp::SdpSession;
pub use server::{SipServer, SipServerConfig};
