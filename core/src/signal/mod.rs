// Signaling transport — how two devices find each other through a relay
// that never sees inside their messages

pub mod protocol;
pub mod server;
pub mod transport;

pub use server::RendezvousServer;
pub use transport::{RelayChannel, RelayConnection};
