//! noisedir-node: home-hostable privacy-preserving contact directory node.
//!
//! Maps opt-in private contact data (email, phone) to public identities
//! (public key, alias, drop URL) so that a client who already knows a
//! contact's email or phone can discover their identity. The directory
//! cannot be enumerated; mutations are gated on proof of control, either by
//! the identity's private key (an anonymous encrypted envelope) or by
//! out-of-band confirmation at the side-channel being registered.

pub mod api;
pub mod authorization;
pub mod config;
pub mod directory;
pub mod engine;
pub mod ledger;
pub mod query;
pub mod server;
pub mod verification;

pub use config::ServerConfig;
pub use server::DirNodeServer;
