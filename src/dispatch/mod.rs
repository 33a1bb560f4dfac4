//! Disbursement dispatchers.
//!
//! Each listener holds the opposite chain's dispatcher behind this trait;
//! the two directions never reference each other directly.

use async_trait::async_trait;

use crate::types::{Intent, Network};

pub mod cos;
pub mod evm;

pub use cos::CosDispatcher;
pub use evm::EvmDispatcher;

/// Pays out a matched intent on one chain and drives it to its terminal
/// state.
///
/// `disburse` takes an intent whose source side is already recorded and
/// always leaves it `completed = true` in the store: after a confirmed
/// payout with `destination_completed = true`, or after any signing,
/// broadcast or confirmation failure with `destination_completed = false`
/// (funds are not returned; the operator steps in). The only errors that
/// surface are store failures.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// The chain this dispatcher pays out on.
    fn network(&self) -> Network;

    async fn disburse(&self, intent: Intent) -> eyre::Result<()>;
}
