//! Chain listeners: consume deposit events, correlate them with open
//! intents and hand matched intents to the opposite-chain dispatcher.

pub mod cos;
pub mod evm;
pub mod matcher;

pub use cos::CosListener;
pub use evm::EvmListener;
pub use matcher::DeferredMatcher;
