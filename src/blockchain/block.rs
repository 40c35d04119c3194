use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::chain::BlockchainError;
use super::crypto::Address;
use super::transaction::Transaction;
use super::Amount;

/// Consensus tag carried by the genesis block
pub const GENESIS_TAG: &str = "genesis";

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Version of the block structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Index of the block in the chain
    pub index: u64,

    /// Timestamp when the block was created
    pub timestamp: DateTime<Utc>,

    /// Hash of the previous block, empty for genesis
    pub prev_hash: String,

    /// Hash of the current block (calculated)
    pub hash: String,

    /// Proposer of the block
    pub miner: Address,

    pub nonce: u64,

    /// Gas reserved by the contained transactions
    pub gas_used: u64,

    pub gas_limit: u64,

    /// Which consensus engine produced the block (`poa`, `pos`, `genesis`)
    pub consensus_tag: String,

    /// List of transactions included in this block
    pub transactions: Vec<Transaction>,
}

/// Default version for blocks
fn default_version() -> u32 {
    1
}

impl Block {
    /// Creates a new block
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `prev_hash` - The hash of the previous block
    /// * `miner` - The proposer of the block
    /// * `transactions` - The list of transactions to include in the block
    ///
    /// # Returns
    ///
    /// A new Block stamped with the current time. `gas_used` is the sum of the
    /// transactions' gas limits, saturating at `u64::MAX`, and `gas_limit`
    /// defaults to the same value.
    pub fn new(index: u64, prev_hash: String, miner: Address, transactions: Vec<Transaction>) -> Self {
        let gas_used = transactions
            .iter()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.gas_limit));

        let mut block = Block {
            version: default_version(),
            index,
            timestamp: Utc::now(),
            prev_hash,
            hash: String::new(),
            miner,
            nonce: 0,
            gas_used,
            gas_limit: gas_used,
            consensus_tag: String::new(),
            transactions,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Builds the genesis block: index 0, empty `prev_hash`, one mint per allocation
    pub fn genesis(
        miner: Address,
        allocations: &[(Address, Amount)],
        timestamp: DateTime<Utc>,
        gas_limit: u64,
    ) -> Self {
        let transactions = allocations
            .iter()
            .map(|(address, amount)| Transaction::mint(address.clone(), *amount))
            .collect();

        Block::new(0, String::new(), miner, transactions)
            .with_timestamp(timestamp)
            .with_gas_limit(gas_limit)
            .with_consensus_tag(GENESIS_TAG)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self.hash = self.compute_hash();
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self.hash = self.compute_hash();
        self
    }

    pub fn with_consensus_tag(mut self, tag: &str) -> Self {
        self.consensus_tag = tag.to_string();
        self.hash = self.compute_hash();
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self.hash = self.compute_hash();
        self
    }

    /// Calculates the hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 hash over every field except `hash`, including the ordered
    /// transaction hashes, as a hexadecimal string
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update(self.version.to_le_bytes());
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.timestamp.timestamp_millis().to_le_bytes());
        update_with_str(&mut hasher, &self.prev_hash);
        update_with_str(&mut hasher, self.miner.as_str());
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.gas_used.to_le_bytes());
        hasher.update(self.gas_limit.to_le_bytes());
        update_with_str(&mut hasher, &self.consensus_tag);

        hasher.update((self.transactions.len() as u64).to_le_bytes());
        for transaction in &self.transactions {
            update_with_str(&mut hasher, &transaction.hash);
        }

        hex::encode(hasher.finalize())
    }

    /// Fails with `HashMismatch` if the stored hash disagrees with the recomputed one
    pub fn validate_self(&self) -> Result<(), BlockchainError> {
        let computed = self.compute_hash();
        if computed != self.hash {
            return Err(BlockchainError::HashMismatch {
                stored: self.hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.prev_hash.is_empty()
    }

    pub fn transaction_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.hash.clone()).collect()
    }
}

/// Fixed genesis timestamp used when the configuration does not set one
pub fn default_genesis_timestamp() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000)
        .single()
        .unwrap_or_default()
}

fn update_with_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}
