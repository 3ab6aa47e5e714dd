//! Farol Registry - the server-side path
//!
//! A process advertises `(service, address)` in the directory under a
//! TTL lease, keeps the lease alive from a single supervised renewal task,
//! and deregisters exactly once on shutdown. [`Srv`] composes the whole
//! path: bind, optional diagnostics endpoint, register, serve.

pub mod lease;
pub mod registration;
pub mod server;

pub use lease::{LeaseKeeper, LeaseState};
pub use registration::{Registrar, RegistrationHandle};
pub use server::Srv;
