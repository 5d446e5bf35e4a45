//! saltline-core — payload types, wire framing, cryptographic primitives and
//! configuration. Every other saltline crate depends on this one.

pub mod config;
pub mod crypto;
pub mod payload;
pub mod wire;

pub use config::{Crypt, SaltlineConfig, TransportKind};
pub use payload::{Enc, Load, Payload};
pub use wire::Envelope;
