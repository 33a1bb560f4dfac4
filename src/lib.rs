//! Custodial swap portal between an EVM chain and a Cosmos chain.
//!
//! Users deposit tokens to a corporate address on one side; the portal
//! matches the deposit against a registered intent, deducts the fee and
//! disburses the equivalent amount on the other side.

pub mod admission;
pub mod api;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod listeners;
pub mod logging;
pub mod metrics;
pub mod store;
pub mod types;
