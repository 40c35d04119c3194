use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use std::sync::Arc;

use crate::blockchain::{
    AccountError, Address, Amount, Block, Blockchain, BlockchainError, LedgerState, Mempool,
    MempoolError, SledStore, StorageError, Transaction, TransactionError, TransactionKind,
};
use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{self, ConsensusEngine, ConsensusError};
use crate::vm::{CallValue, ContractCall, ContractEvent, ExecutionEngine, VmError};

/// Errors surfaced by the node context
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Blockchain error: {0}")]
    BlockchainError(#[from] BlockchainError),

    #[error("Consensus error: {0}")]
    ConsensusError(#[from] ConsensusError),

    #[error("Mempool error: {0}")]
    MempoolError(#[from] MempoolError),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("VM error: {0}")]
    VmError(#[from] VmError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Where a submitted transaction currently is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransactionStatus {
    Confirmed { block_index: u64, applied: bool },
    Pending,
    Unknown,
}

/// State capabilities offered to orchestration layers
pub trait StateAccess {
    fn get_balance(&self, address: &Address) -> Amount;

    fn add_balance(&self, address: &Address, amount: Amount) -> Result<(), NodeError>;

    fn sub_balance(&self, address: &Address, amount: Amount) -> Result<(), NodeError>;

    /// Applies a signed transaction outside of any block
    ///
    /// Transfers go to the native ledger and contract transactions to the
    /// execution engine. Genesis mints are refused.
    fn apply_transaction(&self, transaction: &Transaction) -> Result<(), NodeError>;

    fn get_nonce(&self, address: &Address) -> u64;

    /// Read-only contract call; nothing is persisted or charged
    fn call_static(
        &self,
        from: &Address,
        contract: &Address,
        call: &ContractCall,
    ) -> Result<CallValue, NodeError>;
}

/// A single node: ledger, execution engine, chain, mempool and consensus engine
///
/// Every registry is owned here and handed to collaborators by `Arc`, so two
/// nodes in one process never share state.
pub struct Node {
    config: NodeConfig,
    chain: Arc<Blockchain>,
    mempool: Arc<Mempool>,
    consensus: Box<dyn ConsensusEngine>,
}

impl Node {
    /// Builds a node from `config`
    ///
    /// With `data_dir` set, the chain is restored from the store found there
    /// (or a fresh one is created). Without it the node is in-memory only.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let ledger = Arc::new(LedgerState::new(&config.native_symbol));
        let engine = Arc::new(ExecutionEngine::new(ledger, config.vm.max_call_gas));
        for (address, amount) in &config.genesis.fee_allocations {
            engine.credit_fee_balance(address, *amount)?;
        }

        let genesis = Block::genesis(
            Address::system(),
            &config.genesis_allocations(),
            config.genesis.timestamp,
            config.block_gas_limit,
        );
        info!("Genesis block {} for network {}", genesis.hash, config.network_id);

        let chain = match &config.data_dir {
            Some(dir) => {
                let store = Arc::new(SledStore::open(dir)?);
                info!("Opened chain store at {}", dir.display());
                Blockchain::restore(genesis, engine, config.block_gas_limit, store)?
            }
            None => Blockchain::with_state(genesis, engine, config.block_gas_limit)?,
        };

        let mempool = match config.mempool_capacity {
            Some(capacity) => Mempool::with_capacity(capacity),
            None => Mempool::new(),
        };
        let consensus = consensus::from_config(&config)?;

        Ok(Node {
            config,
            chain: Arc::new(chain),
            mempool: Arc::new(mempool),
            consensus,
        })
    }

    pub fn start(&self) -> Result<(), NodeError> {
        self.consensus
            .start(self.chain.clone(), self.mempool.clone())?;
        Ok(())
    }

    pub fn stop(&self) {
        self.consensus.stop();
    }

    pub fn is_running(&self) -> bool {
        self.consensus.is_running()
    }

    pub fn consensus_kind(&self) -> &'static str {
        self.consensus.kind()
    }

    /// Admits a signed transaction into the mempool and returns its hash
    pub fn submit_transaction(&self, transaction: Transaction) -> Result<String, NodeError> {
        if transaction.is_mint() {
            return Err(TransactionError::MintOutsideGenesis.into());
        }
        transaction.validate_fields()?;
        transaction.verify_signature()?;

        let current = self.chain.ledger().get_nonce(&transaction.from);
        if transaction.nonce < current {
            return Err(AccountError::NonceMismatch {
                expected: current,
                got: transaction.nonce,
            }
            .into());
        }
        if self.chain.contains_transaction(&transaction.hash) {
            return Err(MempoolError::AlreadyExists(transaction.hash).into());
        }

        let hash = transaction.hash.clone();
        self.mempool.insert_new(transaction)?;
        info!("Accepted transaction {} into the mempool", hash);
        Ok(hash)
    }

    pub fn transaction_status(&self, hash: &str) -> TransactionStatus {
        if let Some(receipt) = self.chain.receipt(hash) {
            return TransactionStatus::Confirmed {
                block_index: receipt.block_index,
                applied: receipt.is_applied(),
            };
        }
        if self.mempool.exists(hash) {
            return TransactionStatus::Pending;
        }
        TransactionStatus::Unknown
    }

    /// Runs one consensus step on the caller's thread
    pub fn produce_block(&self) -> Result<Option<Block>, NodeError> {
        match self.consensus.tick(&self.chain, &self.mempool) {
            Ok(block) => Ok(block),
            Err(err) => {
                warn!("Block production failed: {}", err);
                Err(err.into())
            }
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> Arc<Blockchain> {
        self.chain.clone()
    }

    pub fn mempool(&self) -> Arc<Mempool> {
        self.mempool.clone()
    }

    pub fn ledger(&self) -> Arc<LedgerState> {
        self.chain.ledger()
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        self.chain.engine()
    }

    /// Subscribes to events of every contract transaction executed from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<ContractEvent> {
        self.engine().subscribe()
    }

    pub fn height(&self) -> u64 {
        self.chain.height()
    }
}

impl StateAccess for Node {
    fn get_balance(&self, address: &Address) -> Amount {
        self.ledger().get_native_balance(address)
    }

    fn add_balance(&self, address: &Address, amount: Amount) -> Result<(), NodeError> {
        let ledger = self.ledger();
        ledger.credit(address, ledger.native_symbol(), amount)?;
        Ok(())
    }

    fn sub_balance(&self, address: &Address, amount: Amount) -> Result<(), NodeError> {
        let ledger = self.ledger();
        ledger.sub_balance(address, ledger.native_symbol(), amount)?;
        Ok(())
    }

    fn apply_transaction(&self, transaction: &Transaction) -> Result<(), NodeError> {
        if transaction.is_mint() {
            return Err(TransactionError::MintOutsideGenesis.into());
        }
        transaction.validate_fields()?;
        transaction.verify_signature()?;

        match transaction.kind {
            TransactionKind::Transfer => self.ledger().apply_transaction(transaction)?,
            _ => {
                self.engine().execute(transaction)?;
            }
        }
        Ok(())
    }

    fn get_nonce(&self, address: &Address) -> u64 {
        self.ledger().get_nonce(address)
    }

    fn call_static(
        &self,
        from: &Address,
        contract: &Address,
        call: &ContractCall,
    ) -> Result<CallValue, NodeError> {
        Ok(self.engine().call_static(from, contract, call)?)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("network_id", &self.config.network_id)
            .field("consensus", &self.consensus.kind())
            .field("height", &self.chain.height())
            .field("pending", &self.mempool.size())
            .finish()
    }
}
