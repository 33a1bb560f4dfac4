//! Chain adapters: node RPC plumbing for the EVM and COS sides.

pub mod cos;
pub mod evm;

pub use cos::CosClient;
pub use evm::EvmClient;

/// Terminal result of watching a broadcast transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Success,
    Failed,
}
