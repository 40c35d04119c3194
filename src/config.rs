use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::blockchain::block::default_genesis_timestamp;
use crate::blockchain::chain::{DEFAULT_BLOCK_GAS_LIMIT, DEFAULT_NATIVE_SYMBOL};
use crate::blockchain::{Address, Amount};
use crate::vm::engine::DEFAULT_MAX_CALL_GAS;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusKind {
    Poa,
    Pos,
}

/// A PoS validator and its stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub address: Address,
    pub stake: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// `poa` or `pos`
    pub kind: String,
    pub block_interval_ms: u64,
    /// Address this node proposes as; absent means the node only follows
    pub validator: Option<Address>,
    pub authorities: Vec<Address>,
    pub validators: Vec<ValidatorConfig>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            kind: "poa".to_string(),
            block_interval_ms: 5_000,
            validator: None,
            authorities: Vec::new(),
            validators: Vec::new(),
        }
    }
}

impl ConsensusConfig {
    pub fn kind(&self) -> Result<ConsensusKind, ConfigError> {
        match self.kind.to_ascii_lowercase().as_str() {
            "poa" => Ok(ConsensusKind::Poa),
            "pos" => Ok(ConsensusKind::Pos),
            other => Err(ConfigError::Invalid(format!(
                "unknown consensus kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub timestamp: DateTime<Utc>,
    /// Native-coin balances minted in the genesis block
    pub allocations: BTreeMap<Address, Amount>,
    /// Opening balances of the contract fee ledger
    pub fee_allocations: BTreeMap<Address, Amount>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        GenesisConfig {
            timestamp: default_genesis_timestamp(),
            allocations: BTreeMap::new(),
            fee_allocations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub max_call_gas: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_gas: DEFAULT_MAX_CALL_GAS,
        }
    }
}

/// Node configuration, read from JSON. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network_id: String,
    pub native_symbol: String,
    pub block_gas_limit: u64,
    pub max_block_transactions: usize,
    pub mempool_capacity: Option<usize>,
    /// Directory of the write-behind store; absent means in-memory only
    pub data_dir: Option<PathBuf>,
    pub genesis: GenesisConfig,
    pub consensus: ConsensusConfig,
    pub vm: VmConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network_id: "ganimed-devnet".to_string(),
            native_symbol: DEFAULT_NATIVE_SYMBOL.to_string(),
            block_gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
            max_block_transactions: 500,
            mempool_capacity: None,
            data_dir: None,
            genesis: GenesisConfig::default(),
            consensus: ConsensusConfig::default(),
            vm: VmConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reads a JSON config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_id.trim().is_empty() {
            return Err(ConfigError::Invalid("network_id is empty".to_string()));
        }
        if self.native_symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("native_symbol is empty".to_string()));
        }
        if self.block_gas_limit == 0 {
            return Err(ConfigError::Invalid("block_gas_limit must be positive".to_string()));
        }
        if self.max_block_transactions == 0 {
            return Err(ConfigError::Invalid(
                "max_block_transactions must be positive".to_string(),
            ));
        }
        if self.consensus.block_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "consensus.block_interval_ms must be positive".to_string(),
            ));
        }

        for (address, amount) in self
            .genesis
            .allocations
            .iter()
            .chain(self.genesis.fee_allocations.iter())
        {
            if !address.is_account() {
                return Err(ConfigError::Invalid(format!(
                    "genesis allocation to invalid address {}",
                    address
                )));
            }
            if *amount == 0 {
                return Err(ConfigError::Invalid(format!(
                    "genesis allocation to {} is zero",
                    address
                )));
            }
        }

        match self.consensus.kind()? {
            ConsensusKind::Poa => {
                if self.consensus.authorities.is_empty() {
                    return Err(ConfigError::Invalid("PoA authority set is empty".to_string()));
                }
                if let Some(bad) = self.consensus.authorities.iter().find(|a| !a.is_account()) {
                    return Err(ConfigError::Invalid(format!("invalid authority {}", bad)));
                }
            }
            ConsensusKind::Pos => {
                let total: Amount = self
                    .consensus
                    .validators
                    .iter()
                    .fold(0, |acc: Amount, v| acc.saturating_add(v.stake));
                if total == 0 {
                    return Err(ConfigError::Invalid("PoS total stake is zero".to_string()));
                }
                if let Some(bad) = self
                    .consensus
                    .validators
                    .iter()
                    .find(|v| !v.address.is_account())
                {
                    return Err(ConfigError::Invalid(format!(
                        "invalid validator {}",
                        bad.address
                    )));
                }
            }
        }

        if let Some(validator) = &self.consensus.validator {
            if !validator.is_account() {
                return Err(ConfigError::Invalid(format!("invalid validator {}", validator)));
            }
        }

        Ok(())
    }

    /// Single-authority devnet config where `validator` proposes every block
    pub fn single_authority(validator: Address) -> Self {
        let mut config = NodeConfig::default();
        config.consensus.authorities = vec![validator.clone()];
        config.consensus.validator = Some(validator);
        config
    }

    pub fn genesis_allocations(&self) -> Vec<(Address, Amount)> {
        self.genesis
            .allocations
            .iter()
            .map(|(address, amount)| (address.clone(), *amount))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Wallet;
    use std::io::Write;

    fn valid() -> NodeConfig {
        NodeConfig::single_authority(Wallet::generate().address().clone())
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.native_symbol, "GND");
        assert_eq!(config.consensus.kind().unwrap(), ConsensusKind::Poa);
        // No authorities configured
        assert!(config.validate().is_err());
        valid().validate().unwrap();
    }

    #[test]
    fn test_from_file_with_partial_json() {
        let alice = Wallet::generate();
        let json = format!(
            r#"{{
                "network_id": "testnet",
                "genesis": {{ "allocations": {{ "{alice}": 340282366920938463463374607431768211455 }} }},
                "consensus": {{ "kind": "pos", "validators": [ {{ "address": "{alice}", "stake": 10 }} ] }}
            }}"#,
            alice = alice.address()
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.network_id, "testnet");
        assert_eq!(config.block_gas_limit, DEFAULT_BLOCK_GAS_LIMIT);
        assert_eq!(config.genesis.allocations[alice.address()], u128::MAX);
        assert_eq!(config.consensus.kind().unwrap(), ConsensusKind::Pos);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            NodeConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            NodeConfig::from_file("/definitely/missing.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_validation_rules() {
        let mut unknown = valid();
        unknown.consensus.kind = "pow".to_string();
        assert!(unknown.validate().is_err());

        let mut no_gas = valid();
        no_gas.block_gas_limit = 0;
        assert!(no_gas.validate().is_err());

        let mut bad_alloc = valid();
        bad_alloc
            .genesis
            .allocations
            .insert(Address("nope".to_string()), 1);
        assert!(bad_alloc.validate().is_err());

        let mut no_stake = valid();
        no_stake.consensus.kind = "pos".to_string();
        no_stake.consensus.validators = vec![ValidatorConfig {
            address: Wallet::generate().address().clone(),
            stake: 0,
        }];
        assert!(no_stake.validate().is_err());
    }

    #[test]
    fn test_zero_allocations_rejected() {
        let mut zero_coin = valid();
        zero_coin
            .genesis
            .allocations
            .insert(Wallet::generate().address().clone(), 0);
        assert!(matches!(zero_coin.validate(), Err(ConfigError::Invalid(_))));

        let mut zero_fee = valid();
        zero_fee
            .genesis
            .fee_allocations
            .insert(Wallet::generate().address().clone(), 0);
        assert!(matches!(zero_fee.validate(), Err(ConfigError::Invalid(_))));
    }
}
