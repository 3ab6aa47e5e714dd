//! Farol Client - the client-side path
//!
//! A [`Resolver`] watches the directory for a service's live addresses, and
//! a [`Cli`] dials either a fixed target or the resolver's round-robin
//! rotation, running a post-connect hook to build typed protocol clients.

pub mod balancer;
pub mod connector;
pub mod resolver;

pub use balancer::RoundRobin;
pub use connector::Cli;
pub use resolver::Resolver;
