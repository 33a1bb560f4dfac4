use bigdecimal::BigDecimal;
use eyre::{eyre, Result, WrapErr};
use lazy_static::lazy_static;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Minutes before a still-open intent may be swept aside by a new one
/// from the same sender.
pub const TIMEOUT_MINUTES: i64 = 3;

/// Deferred-matcher passes before an EVM-sourced intent is abandoned.
pub const MAX_TRIES: i32 = 20;

/// Period of the deferred matching loop.
pub const MATCH_PERIOD: Duration = Duration::from_secs(60);

/// Cadence for receipt/status polling. Kept at 30 s so public RPC rate
/// limits are respected.
pub const POLL_PERIOD: Duration = Duration::from_secs(30);

/// User-unit amount at or above which blacklisted senders are never paid out.
pub const BLACKLIST_THRESHOLD: &str = "1000000";

/// Destination-side fee in user units, deducted from EVM payouts.
pub const EVM_FEE: &str = "2";

/// COS-side fee in user units. Checked at admission; not deducted from
/// payouts (see `CosConfig::deduct_fee`).
pub const COS_FEE: &str = "0.0001";

/// Token decimals on each chain.
pub const EVM_DECIMALS: i64 = 18;
pub const COS_DECIMALS: i64 = 6;

/// Fixed gas limit for the ERC-20 transfer payout.
pub const EVM_TRANSFER_GAS_LIMIT: u64 = 76_708;

/// Fixed gas limit and base-unit fee for the COS bank send payout.
pub const COS_SEND_GAS_LIMIT: u64 = 140_000;
pub const COS_SEND_FEE_BASE: u128 = 1;

/// Capacity of the deferred-matcher admission queue.
pub const MATCH_QUEUE_DEPTH: usize = 64;

lazy_static! {
    /// Fee and threshold constants parsed into user-unit decimals.
    pub static ref EVM_FEE_AMOUNT: BigDecimal =
        EVM_FEE.parse().expect("constant fee is valid");
    pub static ref COS_FEE_AMOUNT: BigDecimal =
        COS_FEE.parse().expect("constant fee is valid");
    pub static ref BLACKLIST_THRESHOLD_AMOUNT: BigDecimal = BLACKLIST_THRESHOLD
        .parse()
        .expect("constant threshold is valid");
}

/// Destination-side admission fee for a network, in user units.
pub fn fee_for(network: crate::types::Network) -> BigDecimal {
    match network {
        crate::types::Network::Evm => EVM_FEE_AMOUNT.clone(),
        crate::types::Network::Cos => COS_FEE_AMOUNT.clone(),
    }
}

/// Main configuration for the portal
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub store: StoreConfig,
    pub evm: EvmConfig,
    pub cos: CosConfig,
}

/// Application-level configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    pub env: String,
    pub port: u16,
    pub tls_enable: bool,
    pub tls_cert_location: String,
    pub tls_priv_key_location: String,
}

/// Store configuration
#[derive(Clone)]
pub struct StoreConfig {
    pub uri: String,
}

/// Custom Debug that redacts the store URI (may contain credentials).
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("uri", &"<redacted>")
            .finish()
    }
}

/// EVM-side configuration
#[derive(Clone)]
pub struct EvmConfig {
    pub node_url: String,
    pub chain_id: u64,
    pub token_contract: String,
    pub corporate_addr: String,
    pub corporate_priv_key: String,
    /// Optional explorer receipt endpoint with a `{txhash}` placeholder.
    /// When unset, receipts are polled from the node directly.
    pub receipt_api_url: Option<String>,
}

/// Custom Debug that redacts the private key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("node_url", &self.node_url)
            .field("chain_id", &self.chain_id)
            .field("token_contract", &self.token_contract)
            .field("corporate_addr", &self.corporate_addr)
            .field("corporate_priv_key", &"<redacted>")
            .field("receipt_api_url", &self.receipt_api_url)
            .finish()
    }
}

/// COS-side configuration
#[derive(Clone)]
pub struct CosConfig {
    /// Tendermint RPC endpoint; the event subscription runs on its
    /// `/websocket` path.
    pub node_url: String,
    /// REST gateway used for the auth account query.
    pub node_grpc_url: String,
    pub corporate_addr: String,
    pub corporate_mnemonic: String,
    pub chain_id: String,
    pub denom: String,
    pub bech32_prefix: String,
    pub coin_type: u32,
    /// Whether the COS fee is deducted from payouts. The portal has never
    /// deducted it; admission still enforces fee < amount.
    pub deduct_fee: bool,
}

/// Custom Debug that redacts the mnemonic to prevent accidental log leakage.
impl fmt::Debug for CosConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CosConfig")
            .field("node_url", &self.node_url)
            .field("node_grpc_url", &self.node_grpc_url)
            .field("corporate_addr", &self.corporate_addr)
            .field("corporate_mnemonic", &"<redacted>")
            .field("chain_id", &self.chain_id)
            .field("denom", &self.denom)
            .field("bech32_prefix", &self.bech32_prefix)
            .field("coin_type", &self.coin_type)
            .field("deduct_fee", &self.deduct_fee)
            .finish()
    }
}

fn default_port() -> u16 {
    1489
}

impl Config {
    /// Load configuration from environment variables.
    /// Loads a .env file if present, then reads from the environment.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let app = AppConfig {
            name: env::var("APP_NAME").unwrap_or_else(|_| "swap-portal".to_string()),
            env: env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or_else(default_port),
            tls_enable: env::var("TLS_ENABLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            tls_cert_location: env::var("TLS_CERT_LOCATION").unwrap_or_default(),
            tls_priv_key_location: env::var("TLS_PRIV_KEY_LOCATION").unwrap_or_default(),
        };

        let store = StoreConfig {
            uri: env::var("STORE_URI")
                .map_err(|_| eyre!("STORE_URI environment variable is required"))?,
        };

        let evm = EvmConfig {
            node_url: env::var("EVM_NODE_URL")
                .map_err(|_| eyre!("EVM_NODE_URL environment variable is required"))?,
            chain_id: env::var("EVM_CHAIN_ID")
                .map_err(|_| eyre!("EVM_CHAIN_ID environment variable is required"))?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            token_contract: env::var("EVM_TOKEN_CONTRACT")
                .map_err(|_| eyre!("EVM_TOKEN_CONTRACT environment variable is required"))?,
            corporate_addr: env::var("EVM_CORPORATE_ADDR")
                .map_err(|_| eyre!("EVM_CORPORATE_ADDR environment variable is required"))?,
            corporate_priv_key: env::var("EVM_CORPORATE_PRIV_KEY")
                .map_err(|_| eyre!("EVM_CORPORATE_PRIV_KEY environment variable is required"))?,
            receipt_api_url: env::var("EVM_RECEIPT_API_URL").ok(),
        };

        let cos = CosConfig {
            node_url: env::var("COS_NODE_URL")
                .map_err(|_| eyre!("COS_NODE_URL environment variable is required"))?,
            node_grpc_url: env::var("COS_NODE_GRPC_URL")
                .map_err(|_| eyre!("COS_NODE_GRPC_URL environment variable is required"))?,
            corporate_addr: env::var("COS_CORPORATE_ADDR")
                .map_err(|_| eyre!("COS_CORPORATE_ADDR environment variable is required"))?,
            corporate_mnemonic: env::var("COS_CORPORATE_MNEMONIC")
                .map_err(|_| eyre!("COS_CORPORATE_MNEMONIC environment variable is required"))?,
            chain_id: env::var("COS_CHAIN_ID").unwrap_or_else(|_| "darchub".to_string()),
            denom: env::var("COS_DENOM").unwrap_or_else(|_| "udarc".to_string()),
            bech32_prefix: env::var("COS_BECH32_PREFIX").unwrap_or_else(|_| "darc".to_string()),
            coin_type: env::var("COS_COIN_TYPE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(118),
            deduct_fee: env::var("COS_DEDUCT_FEE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        };

        let config = Config {
            app,
            store,
            evm,
            cos,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.uri.is_empty() {
            return Err(eyre!("store.uri cannot be empty"));
        }

        if self.evm.node_url.is_empty() {
            return Err(eyre!("evm.node_url cannot be empty"));
        }

        if self.evm.token_contract.len() != 42 || !self.evm.token_contract.starts_with("0x") {
            return Err(eyre!(
                "evm.token_contract must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if self.evm.corporate_addr.len() != 42 || !self.evm.corporate_addr.starts_with("0x") {
            return Err(eyre!(
                "evm.corporate_addr must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        let key = self
            .evm
            .corporate_priv_key
            .strip_prefix("0x")
            .unwrap_or(&self.evm.corporate_priv_key);
        if key.len() != 64 {
            return Err(eyre!("evm.corporate_priv_key must be 64 hex chars"));
        }

        if self.cos.node_url.is_empty() {
            return Err(eyre!("cos.node_url cannot be empty"));
        }

        if self.cos.node_grpc_url.is_empty() {
            return Err(eyre!("cos.node_grpc_url cannot be empty"));
        }

        if !self
            .cos
            .corporate_addr
            .starts_with(&format!("{}1", self.cos.bech32_prefix))
        {
            return Err(eyre!(
                "cos.corporate_addr must be a bech32 address with prefix {}",
                self.cos.bech32_prefix
            ));
        }

        let mnemonic_words: Vec<&str> = self.cos.corporate_mnemonic.split_whitespace().collect();
        if mnemonic_words.len() < 12 {
            return Err(eyre!("cos.corporate_mnemonic must have at least 12 words"));
        }

        if self.cos.chain_id.is_empty() {
            return Err(eyre!("cos.chain_id cannot be empty"));
        }

        if self.cos.denom.is_empty() {
            return Err(eyre!("cos.denom cannot be empty"));
        }

        if self.app.tls_enable
            && (self.app.tls_cert_location.is_empty() || self.app.tls_priv_key_location.is_empty())
        {
            return Err(eyre!(
                "TLS_CERT_LOCATION and TLS_PRIV_KEY_LOCATION are required when TLS_ENABLE is set"
            ));
        }

        Ok(())
    }
}
