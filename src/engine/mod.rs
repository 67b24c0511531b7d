//! Engine modules shipped with the crate
//!
//! Hosts normally wrap their own engine binary in an
//! [`EngineModule`](crate::bridge::EngineModule). The [`reference`] module
//! implements both ABI variants in pure Rust for tests, demos and headless
//! tooling.

pub mod reference;

pub use reference::{FaultPlan, ReferenceEngine};
