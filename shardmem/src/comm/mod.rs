//! Rank groups: rendezvous tokens, the wire protocol, the root relay and the
//! communicator built on top of them.

pub mod communicator;
pub mod protocol;
pub(crate) mod root;
pub mod token;

pub use communicator::{CommHandle, Communicator};
pub use protocol::{Frame, MESSAGE_SIZE_LIMIT};
pub use token::{RendezvousToken, TOKEN_BYTES};
