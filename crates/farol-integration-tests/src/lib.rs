//! Cross-crate scenario tests for Farol
//!
//! The tests live under `tests/` and run the server path (registrar, renewal
//! task) against the client path (resolver, round robin) over the in-memory
//! directory store, with paused tokio time where the scenario is about
//! timing rather than wall clocks.
