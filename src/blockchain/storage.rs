use std::fmt;
use std::path::Path;

use log::warn;
use sled::{Db, Tree};
use thiserror::Error;

use super::account::Account;
use super::block::Block;
use super::chain::Receipt;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Write-behind mirror of the committed chain
///
/// The in-memory chain is authoritative; a store only ever receives data that
/// has already been committed, and is read back once at startup.
pub trait ChainStore: Send + Sync + fmt::Debug {
    fn save_block(&self, block: &Block) -> Result<(), StorageError>;

    fn save_receipts(&self, receipts: &[Receipt]) -> Result<(), StorageError>;

    fn save_accounts(&self, accounts: &[Account]) -> Result<(), StorageError>;

    /// Every stored block, ordered by index
    fn load_blocks(&self) -> Result<Vec<Block>, StorageError>;

    fn load_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, StorageError>;

    fn load_accounts(&self) -> Result<Vec<Account>, StorageError>;

    /// Hash of the most recently saved block, if any
    fn latest_block_hash(&self) -> Result<Option<String>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

/// `sled`-backed store with bincode-encoded values
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian index
    blocks: Tree,

    /// Receipts keyed by transaction hash
    receipts: Tree,

    /// Account views keyed by address
    accounts: Tree,

    /// Tree for metadata
    metadata: Tree,
}

impl fmt::Debug for SledStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledStore")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl SledStore {
    /// Opens (or creates) a store under `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let receipts = db.open_tree("receipts")?;
        let accounts = db.open_tree("accounts")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            receipts,
            accounts,
            metadata,
        })
    }
}

impl ChainStore for SledStore {
    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks.insert(block.index.to_be_bytes(), encode(block)?)?;

        // Update latest block hash
        self.metadata
            .insert("latest_block_hash", block.hash.as_bytes())?;

        Ok(())
    }

    fn save_receipts(&self, receipts: &[Receipt]) -> Result<(), StorageError> {
        for receipt in receipts {
            self.receipts
                .insert(receipt.tx_hash.as_bytes(), encode(receipt)?)?;
        }
        Ok(())
    }

    fn save_accounts(&self, accounts: &[Account]) -> Result<(), StorageError> {
        for account in accounts {
            self.accounts
                .insert(account.address.as_str().as_bytes(), encode(account)?)?;
        }
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        let mut deserialization_errors = Vec::new();

        for result in self.blocks.iter() {
            let (key, value) = result?;
            match decode::<Block>(&value) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    deserialization_errors.push(format!("{:?}: {}", key.as_ref(), e));
                }
            }
        }

        if !deserialization_errors.is_empty() {
            // A hole in the sequence would make replay diverge, so refuse outright
            warn!(
                "Some blocks could not be deserialized: {}",
                deserialization_errors.join(", ")
            );
            return Err(StorageError::DeserializationError(format!(
                "{} corrupt block(s)",
                deserialization_errors.len()
            )));
        }

        // Big-endian keys iterate in index order already
        blocks.sort_by_key(|block| block.index);

        Ok(blocks)
    }

    fn load_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, StorageError> {
        match self.receipts.get(tx_hash.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn load_accounts(&self) -> Result<Vec<Account>, StorageError> {
        self.accounts
            .iter()
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    fn latest_block_hash(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .metadata
            .get("latest_block_hash")?
            .map(|value| String::from_utf8_lossy(&value).to_string()))
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::default_genesis_timestamp;
    use crate::blockchain::chain::ReceiptStatus;
    use crate::blockchain::crypto::{Address, Wallet};
    use crate::blockchain::transaction::Transaction;
    use std::collections::BTreeMap;

    fn genesis() -> Block {
        Block::genesis(
            Address::system(),
            &[(Wallet::generate().address().clone(), 1_000)],
            default_genesis_timestamp(),
            1_000_000,
        )
    }

    #[test]
    fn test_save_and_load_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let genesis = genesis();
        let next = Block::new(1, genesis.hash.clone(), Address::system(), Vec::new());
        store.save_block(&next).unwrap();
        store.save_block(&genesis).unwrap();
        store.flush().unwrap();

        let loaded = store.load_blocks().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], genesis);
        assert_eq!(loaded[1], next);
        assert_eq!(store.latest_block_hash().unwrap(), Some(genesis.hash));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let genesis = genesis();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.save_block(&genesis).unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.load_blocks().unwrap(), vec![genesis]);
    }

    #[test]
    fn test_receipts_and_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let tx = Transaction::mint(Wallet::generate().address().clone(), 5);
        let receipt = Receipt {
            tx_hash: tx.hash.clone(),
            block_index: 0,
            status: ReceiptStatus::Applied,
            gas_used: 1,
            events: Vec::new(),
        };
        store.save_receipts(std::slice::from_ref(&receipt)).unwrap();
        assert_eq!(store.load_receipt(&tx.hash).unwrap(), Some(receipt));
        assert_eq!(store.load_receipt("missing").unwrap(), None);

        let mut account = Account::new(tx.to.clone());
        account.balances = BTreeMap::from([("GND".to_string(), 5)]);
        store.save_accounts(std::slice::from_ref(&account)).unwrap();
        assert_eq!(store.load_accounts().unwrap(), vec![account]);
    }
}
