//! Chain configuration and genesis allocation, deserializable from JSON
//! with 0x-prefixed hex values for addresses, balances and code.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::common::{Addr, Bytes, Gas, Wei};

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Minimum parent-to-child timestamp spacing, seconds.
    pub block_time: u64,
    /// Per-block gas limit; identical across every produced block.
    pub gas_limit: Gas,
    /// Ordered initial authority set.
    pub validators: Vec<Addr>,
    pub min_gas_price: Wei,
    pub max_pool_size: usize,
    pub max_account_transactions: usize,
    /// Pool entry age-out, seconds.
    pub transaction_timeout: u64,
    /// Missed-slot count that deactivates a validator.
    pub inactivity_threshold: u32,
    /// Timestamp of the genesis block.
    pub genesis_timestamp: u64,
    /// Genesis allocation, keyed by 0x-prefixed hex address.
    pub alloc: BTreeMap<String, GenesisAccount>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GenesisAccount {
    pub balance: Wei,
    pub nonce: u64,
    pub code: Bytes,
    /// Storage preset, hex word key to hex word value.
    pub storage: BTreeMap<String, String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            block_time: 5,
            gas_limit: 8_000_000,
            validators: Vec::new(),
            min_gas_price: Wei::from(1u64),
            max_pool_size: 4096,
            max_account_transactions: 64,
            transaction_timeout: 3600,
            inactivity_threshold: 10,
            genesis_timestamp: 0,
            alloc: BTreeMap::new(),
        }
    }
}

impl ChainConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
