//! Authenticated peer-to-peer transport (§4.3, §4.4).

mod client;
mod signer;

pub use client::{HttpPeerTransport, PeerDirectory, PeerTransport};
pub use signer::{
    address_from_verifying_key, recover_address, sign_message, SignatureBytes, SignedMessage,
};
