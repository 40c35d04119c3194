use dashmap::DashMap;
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::account::{Account, AccountError, LedgerState};
use super::block::Block;
use super::crypto::Address;
use super::storage::{ChainStore, StorageError};
use super::transaction::{Transaction, TransactionError, TransactionKind};
use crate::vm::engine::DEFAULT_MAX_CALL_GAS;
use crate::vm::{ContractEvent, ExecutionEngine, VmError};

/// Native asset symbol used when no configuration supplies one
pub const DEFAULT_NATIVE_SYMBOL: &str = "GND";

/// Default ceiling on a block's gas limit
pub const DEFAULT_BLOCK_GAS_LIMIT: u64 = 30_000_000;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch { stored: String, computed: String },

    #[error("Previous hash mismatch: expected {expected}, got {got}")]
    PrevHashMismatch { expected: String, got: String },

    #[error("Index mismatch: expected {expected}, got {got}")]
    IndexMismatch { expected: u64, got: u64 },

    #[error("Gas limit exceeded: {0}")]
    GasLimitExceeded(String),

    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("VM error: {0}")]
    VmError(#[from] VmError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Outcome of one transaction inside a committed block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Applied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_index: u64,
    pub status: ReceiptStatus,
    pub gas_used: u64,
    /// Contract events, empty for transfers and failed transactions
    pub events: Vec<ContractEvent>,
}

impl Receipt {
    pub fn is_applied(&self) -> bool {
        self.status == ReceiptStatus::Applied
    }
}

#[derive(Debug)]
struct ChainInner {
    genesis: Block,
    /// Blocks after genesis, in index order
    blocks: Vec<Block>,
    by_hash: HashMap<String, u64>,
}

impl ChainInner {
    fn head(&self) -> &Block {
        self.blocks.last().unwrap_or(&self.genesis)
    }

    fn get(&self, index: u64) -> Option<&Block> {
        match index {
            0 => Some(&self.genesis),
            i => self.blocks.get((i - 1) as usize),
        }
    }
}

/// Ordered chain of committed blocks applied to the ledger
///
/// Linkage and hash checks reject a block outright. Once a block is accepted,
/// every transaction in it yields a [`Receipt`]; a transaction that fails is
/// recorded as failed and has no effect on state.
#[derive(Debug)]
pub struct Blockchain {
    inner: RwLock<ChainInner>,
    receipts: DashMap<String, Receipt>,
    ledger: Arc<LedgerState>,
    engine: Arc<ExecutionEngine>,
    block_gas_limit: u64,
    store: Option<Arc<dyn ChainStore>>,
}

impl Blockchain {
    /// Creates a chain with its own ledger and execution engine
    ///
    /// # Arguments
    ///
    /// * `genesis` - The genesis block, applied to state immediately
    pub fn new(genesis: Block) -> Result<Self, BlockchainError> {
        let ledger = Arc::new(LedgerState::new(DEFAULT_NATIVE_SYMBOL));
        Self::with_state(
            genesis,
            Arc::new(ExecutionEngine::new(ledger, DEFAULT_MAX_CALL_GAS)),
            DEFAULT_BLOCK_GAS_LIMIT,
        )
    }

    /// Creates a chain over a shared engine and the ledger it is bound to
    ///
    /// # Arguments
    ///
    /// * `genesis` - The genesis block
    /// * `engine` - Engine that executes contract transactions; its ledger
    ///   receives every committed block
    /// * `block_gas_limit` - Ceiling on any block's gas limit
    pub fn with_state(
        genesis: Block,
        engine: Arc<ExecutionEngine>,
        block_gas_limit: u64,
    ) -> Result<Self, BlockchainError> {
        let ledger = engine.ledger();
        genesis.validate_self()?;
        if !genesis.is_genesis() {
            return Err(BlockchainError::InvalidBlock(
                "genesis must have index 0 and an empty previous hash".to_string(),
            ));
        }

        let mut receipts = Vec::with_capacity(genesis.transactions.len());
        for transaction in &genesis.transactions {
            if transaction.kind != TransactionKind::Mint {
                return Err(BlockchainError::InvalidBlock(format!(
                    "genesis may only contain mint transactions, found {:?}",
                    transaction.kind
                )));
            }
            ledger.apply_mint(transaction)?;
            receipts.push(Receipt {
                tx_hash: transaction.hash.clone(),
                block_index: 0,
                status: ReceiptStatus::Applied,
                gas_used: 0,
                events: Vec::new(),
            });
        }

        let chain = Blockchain {
            inner: RwLock::new(ChainInner {
                by_hash: HashMap::from([(genesis.hash.clone(), 0)]),
                genesis,
                blocks: Vec::new(),
            }),
            receipts: DashMap::new(),
            ledger,
            engine,
            block_gas_limit,
            store: None,
        };
        for receipt in receipts {
            chain.receipts.insert(receipt.tx_hash.clone(), receipt);
        }

        Ok(chain)
    }

    /// Attaches a write-behind store and mirrors the genesis block into it if empty
    pub fn with_store(mut self, store: Arc<dyn ChainStore>) -> Self {
        match store.load_blocks() {
            Ok(blocks) if blocks.is_empty() => {
                let genesis = self.inner.read().genesis.clone();
                let receipts: Vec<Receipt> = genesis
                    .transactions
                    .iter()
                    .filter_map(|tx| self.receipt(&tx.hash))
                    .collect();
                self.persist(store.as_ref(), &genesis, &receipts);
            }
            Ok(_) => {}
            Err(err) => warn!("Failed to read store while attaching it: {}", err),
        }

        self.store = Some(store);
        self
    }

    /// Rebuilds a chain by replaying every block held in `store`
    ///
    /// The stored genesis must match `genesis`. Replay goes through
    /// [`Blockchain::add_block`], so the resulting state is identical to the
    /// state of the node that wrote the store. Replayed receipts and the
    /// head hash must agree with what the store mirrored; mirrored account
    /// balances that disagree with the replay are reported and replaced.
    pub fn restore(
        genesis: Block,
        engine: Arc<ExecutionEngine>,
        block_gas_limit: u64,
        store: Arc<dyn ChainStore>,
    ) -> Result<Self, BlockchainError> {
        let chain = Self::with_state(genesis, engine, block_gas_limit)?;
        let stored = store.load_blocks()?;

        let mut replayed = 0;
        for block in stored {
            if block.index == 0 {
                let genesis_hash = chain.inner.read().genesis.hash.clone();
                if block.hash != genesis_hash {
                    return Err(BlockchainError::InvalidChain(format!(
                        "stored genesis {} does not match configured genesis {}",
                        block.hash, genesis_hash
                    )));
                }
                continue;
            }
            let receipts = chain.add_block(block)?;
            check_mirrored_receipts(store.as_ref(), &receipts)?;
            replayed += 1;
        }

        let head = chain.latest_block().hash;
        match store.latest_block_hash()? {
            Some(mirrored) if mirrored != head => {
                return Err(BlockchainError::InvalidChain(format!(
                    "store head {} does not match replayed head {}",
                    mirrored, head
                )));
            }
            _ => {}
        }

        let diverged = diverging_accounts(&store.load_accounts()?, &chain.ledger.get_all_accounts());
        if !diverged.is_empty() {
            warn!(
                "Mirrored state of {} account(s) differs from replay, keeping the replayed state: {}",
                diverged.len(),
                diverged
                    .iter()
                    .map(|address| address.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        info!("Restored {} block(s) from store", replayed);
        let chain = chain.with_store(store.clone());
        if !diverged.is_empty() {
            store.save_accounts(&chain.ledger.get_all_accounts())?;
            store.flush()?;
        }
        Ok(chain)
    }

    pub fn ledger(&self) -> Arc<LedgerState> {
        self.ledger.clone()
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        self.engine.clone()
    }

    pub fn block_gas_limit(&self) -> u64 {
        self.block_gas_limit
    }

    /// Gets the current chain head
    pub fn latest_block(&self) -> Block {
        self.inner.read().head().clone()
    }

    /// Index of the chain head; 0 when only genesis exists
    pub fn height(&self) -> u64 {
        self.inner.read().head().index
    }

    /// Number of blocks including genesis
    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len() + 1
    }

    pub fn get_block_by_index(&self, index: u64) -> Option<Block> {
        self.inner.read().get(index).cloned()
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Option<Block> {
        let inner = self.inner.read();
        inner
            .by_hash
            .get(hash)
            .and_then(|index| inner.get(*index))
            .cloned()
    }

    /// Gets the entire blockchain
    pub fn all_blocks(&self) -> Vec<Block> {
        let inner = self.inner.read();
        std::iter::once(&inner.genesis)
            .chain(inner.blocks.iter())
            .cloned()
            .collect()
    }

    pub fn receipt(&self, tx_hash: &str) -> Option<Receipt> {
        self.receipts.get(tx_hash).map(|entry| entry.value().clone())
    }

    pub fn contains_transaction(&self, tx_hash: &str) -> bool {
        self.receipts.contains_key(tx_hash)
    }

    /// Validates and commits a block, then applies its transactions in order
    ///
    /// # Arguments
    ///
    /// * `block` - The block to append
    ///
    /// # Returns
    ///
    /// One receipt per contained transaction. Block-level failures leave the
    /// chain and the ledger unchanged.
    pub fn add_block(&self, block: Block) -> Result<Vec<Receipt>, BlockchainError> {
        let mut inner = self.inner.write();

        let head = inner.head();
        if block.prev_hash != head.hash {
            return Err(BlockchainError::PrevHashMismatch {
                expected: head.hash.clone(),
                got: block.prev_hash.clone(),
            });
        }
        block.validate_self()?;
        if block.index != head.index + 1 {
            return Err(BlockchainError::IndexMismatch {
                expected: head.index + 1,
                got: block.index,
            });
        }
        self.check_gas(&block)?;
        self.check_duplicates(&block)?;

        let receipts: Vec<Receipt> = block
            .transactions
            .iter()
            .map(|transaction| self.apply(block.index, transaction))
            .collect();

        let applied = receipts.iter().filter(|r| r.is_applied()).count();
        info!(
            "Committed block {} ({}) with {} transaction(s), {} applied",
            block.index,
            block.hash,
            block.transactions.len(),
            applied
        );

        for receipt in &receipts {
            self.receipts.insert(receipt.tx_hash.clone(), receipt.clone());
        }
        inner.by_hash.insert(block.hash.clone(), block.index);
        inner.blocks.push(block);

        if let Some(store) = &self.store {
            if let Some(block) = inner.blocks.last() {
                self.persist(store.as_ref(), block, &receipts);
            }
        }

        Ok(receipts)
    }

    /// Checks hashes and linkage of every stored block
    pub fn is_valid(&self) -> bool {
        let inner = self.inner.read();
        if inner.genesis.validate_self().is_err() {
            return false;
        }

        let mut previous = &inner.genesis;
        for block in &inner.blocks {
            if block.validate_self().is_err()
                || block.prev_hash != previous.hash
                || block.index != previous.index + 1
            {
                return false;
            }
            previous = block;
        }

        true
    }

    fn check_gas(&self, block: &Block) -> Result<(), BlockchainError> {
        if block.gas_limit > self.block_gas_limit {
            return Err(BlockchainError::GasLimitExceeded(format!(
                "block gas limit {} above chain maximum {}",
                block.gas_limit, self.block_gas_limit
            )));
        }

        let reserved = block
            .transactions
            .iter()
            .try_fold(0u64, |acc, tx| acc.checked_add(tx.gas_limit))
            .ok_or_else(|| {
                BlockchainError::GasLimitExceeded(
                    "transaction gas limits overflow".to_string(),
                )
            })?;
        if block.gas_used > block.gas_limit || reserved > block.gas_limit {
            return Err(BlockchainError::GasLimitExceeded(format!(
                "gas used {} (reserved {}) above block gas limit {}",
                block.gas_used, reserved, block.gas_limit
            )));
        }

        Ok(())
    }

    fn check_duplicates(&self, block: &Block) -> Result<(), BlockchainError> {
        let mut seen = HashSet::with_capacity(block.transactions.len());
        for transaction in &block.transactions {
            if !seen.insert(transaction.hash.as_str()) || self.contains_transaction(&transaction.hash) {
                return Err(BlockchainError::DuplicateTransaction(transaction.hash.clone()));
            }
        }
        Ok(())
    }

    fn apply(&self, block_index: u64, transaction: &Transaction) -> Receipt {
        let (status, events) = match self.execute(transaction) {
            Ok(events) => (ReceiptStatus::Applied, events),
            Err(err) => {
                warn!(
                    "Transaction {} in block {} failed: {}",
                    transaction.hash, block_index, err
                );
                (ReceiptStatus::Failed(err.to_string()), Vec::new())
            }
        };

        Receipt {
            tx_hash: transaction.hash.clone(),
            block_index,
            gas_used: match status {
                ReceiptStatus::Applied => transaction.gas_limit,
                ReceiptStatus::Failed(_) => 0,
            },
            status,
            events,
        }
    }

    /// Applies one non-genesis transaction to state
    ///
    /// Contract transactions consume their nonce inside the engine, which
    /// keeps it consumed when execution fails.
    fn execute(&self, transaction: &Transaction) -> Result<Vec<ContractEvent>, BlockchainError> {
        if transaction.is_mint() {
            return Err(TransactionError::MintOutsideGenesis.into());
        }
        transaction.validate_fields()?;
        transaction.verify_signature()?;

        match transaction.kind {
            TransactionKind::Transfer => {
                self.ledger.apply_transaction(transaction)?;
                Ok(Vec::new())
            }
            _ => Ok(self.engine.execute(transaction)?.events),
        }
    }

    fn persist(&self, store: &dyn ChainStore, block: &Block, receipts: &[Receipt]) {
        let result = store
            .save_block(block)
            .and_then(|_| store.save_receipts(receipts))
            .and_then(|_| store.save_accounts(&self.ledger.get_all_accounts()))
            .and_then(|_| store.flush());

        if let Err(err) = result {
            warn!("Failed to mirror block {} to store: {}", block.index, err);
        }
    }
}

fn check_mirrored_receipts(store: &dyn ChainStore, receipts: &[Receipt]) -> Result<(), BlockchainError> {
    for receipt in receipts {
        match store.load_receipt(&receipt.tx_hash)? {
            Some(mirrored) if &mirrored != receipt => {
                return Err(BlockchainError::InvalidChain(format!(
                    "replayed receipt of {} in block {} differs from the stored one",
                    receipt.tx_hash, receipt.block_index
                )));
            }
            Some(_) => {}
            None => warn!("No stored receipt for transaction {}", receipt.tx_hash),
        }
    }
    Ok(())
}

/// Addresses whose mirrored account differs from the replayed one, in either direction
fn diverging_accounts(mirrored: &[Account], replayed: &[Account]) -> Vec<Address> {
    let mirrored: BTreeMap<&Address, &Account> = mirrored.iter().map(|a| (&a.address, a)).collect();
    let replayed: BTreeMap<&Address, &Account> = replayed.iter().map(|a| (&a.address, a)).collect();

    let mut diverged: Vec<Address> = mirrored
        .keys()
        .chain(replayed.keys())
        .filter(|address| mirrored.get(*address) != replayed.get(*address))
        .map(|address| (*address).clone())
        .collect();
    diverged.sort();
    diverged.dedup();
    diverged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::default_genesis_timestamp;
    use crate::blockchain::crypto::{Address, Wallet};
    use crate::blockchain::storage::SledStore;
    use crate::vm::{ContractCall, DeployPayload, DEPLOY_GAS};

    const GND: &str = DEFAULT_NATIVE_SYMBOL;

    struct Fixture {
        chain: Blockchain,
        alice: Wallet,
        bob: Wallet,
    }

    fn genesis_for(alice: &Wallet) -> Block {
        Block::genesis(
            Address::system(),
            &[(alice.address().clone(), 1_000_000)],
            default_genesis_timestamp(),
            DEFAULT_BLOCK_GAS_LIMIT,
        )
    }

    fn fixture() -> Fixture {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let chain = Blockchain::new(genesis_for(&alice)).unwrap();
        Fixture { chain, alice, bob }
    }

    fn transfer(from: &Wallet, to: &Wallet, value: u128, nonce: u64) -> Transaction {
        let mut tx = Transaction::transfer(
            from.address().clone(),
            to.address().clone(),
            value,
            1,
            21_000,
            nonce,
        );
        tx.sign(from).unwrap();
        tx
    }

    fn engine() -> Arc<ExecutionEngine> {
        Arc::new(ExecutionEngine::new(
            Arc::new(LedgerState::new(GND)),
            DEFAULT_MAX_CALL_GAS,
        ))
    }

    fn next_block(chain: &Blockchain, transactions: Vec<Transaction>) -> Block {
        let head = chain.latest_block();
        Block::new(
            head.index + 1,
            head.hash,
            Address::system(),
            transactions,
        )
    }

    #[test]
    fn test_new_blockchain() {
        let fx = fixture();
        let genesis = fx.chain.latest_block();

        assert_eq!(fx.chain.height(), 0);
        assert_eq!(fx.chain.block_count(), 1);
        assert_eq!(genesis.hash, genesis.compute_hash());
        assert_eq!(
            fx.chain.ledger().get_balance(fx.alice.address(), GND),
            1_000_000
        );
        assert!(fx.chain.is_valid());
    }

    #[test]
    fn test_empty_genesis() {
        let genesis = Block::genesis(Address::system(), &[], default_genesis_timestamp(), 0);
        let chain = Blockchain::new(genesis).unwrap();
        assert_eq!(chain.height(), 0);
        assert!(chain.latest_block().transactions.is_empty());
    }

    #[test]
    fn test_genesis_must_be_genesis() {
        let block = Block::new(3, "abc".to_string(), Address::system(), Vec::new());
        assert!(matches!(
            Blockchain::new(block),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_add_block_applies_transfer() {
        let fx = fixture();
        let tx = transfer(&fx.alice, &fx.bob, 500, 0);
        let block = next_block(&fx.chain, vec![tx.clone()]);

        let receipts = fx.chain.add_block(block.clone()).unwrap();
        assert_eq!(receipts.len(), 1);
        assert!(receipts[0].is_applied());

        let ledger = fx.chain.ledger();
        assert_eq!(ledger.get_balance(fx.bob.address(), GND), 500);
        assert_eq!(ledger.get_balance(fx.alice.address(), GND), 1_000_000 - 500 - 21_000);
        assert_eq!(ledger.get_nonce(fx.alice.address()), 1);

        assert_eq!(fx.chain.block_count(), 2);
        assert_eq!(fx.chain.get_block_by_hash(&block.hash), Some(block.clone()));
        assert_eq!(fx.chain.get_block_by_index(1), Some(block));
        assert_eq!(fx.chain.receipt(&tx.hash), Some(receipts[0].clone()));
        assert!(fx.chain.is_valid());
    }

    #[test]
    fn test_prev_hash_mismatch() {
        let fx = fixture();
        fx.chain
            .add_block(next_block(&fx.chain, vec![transfer(&fx.alice, &fx.bob, 1, 0)]))
            .unwrap();

        let bad = Block::new(2, "not-the-head".to_string(), Address::system(), Vec::new());
        assert!(matches!(
            fx.chain.add_block(bad),
            Err(BlockchainError::PrevHashMismatch { .. })
        ));
        assert_eq!(fx.chain.block_count(), 2);
    }

    #[test]
    fn test_hash_mismatch() {
        let fx = fixture();
        let mut block = next_block(&fx.chain, Vec::new());
        block.nonce = 42;
        assert!(matches!(
            fx.chain.add_block(block),
            Err(BlockchainError::HashMismatch { .. })
        ));
        assert_eq!(fx.chain.block_count(), 1);
    }

    #[test]
    fn test_index_mismatch() {
        let fx = fixture();
        let head = fx.chain.latest_block();
        let block = Block::new(5, head.hash, Address::system(), Vec::new());
        assert!(matches!(
            fx.chain.add_block(block),
            Err(BlockchainError::IndexMismatch { expected: 1, got: 5 })
        ));
    }

    #[test]
    fn test_gas_limits() {
        let fx = fixture();
        let tx = transfer(&fx.alice, &fx.bob, 1, 0);

        let over_reserved = next_block(&fx.chain, vec![tx.clone()]).with_gas_limit(10);
        assert!(matches!(
            fx.chain.add_block(over_reserved),
            Err(BlockchainError::GasLimitExceeded(_))
        ));

        let over_chain = next_block(&fx.chain, vec![tx]).with_gas_limit(DEFAULT_BLOCK_GAS_LIMIT + 1);
        assert!(matches!(
            fx.chain.add_block(over_chain),
            Err(BlockchainError::GasLimitExceeded(_))
        ));
    }

    #[test]
    fn test_overflowing_gas_limits_rejected() {
        let fx = fixture();
        let mut huge = Transaction::transfer(
            fx.alice.address().clone(),
            fx.bob.address().clone(),
            1,
            1,
            u64::MAX,
            0,
        );
        huge.sign(&fx.alice).unwrap();
        let mut small = Transaction::transfer(
            fx.alice.address().clone(),
            fx.bob.address().clone(),
            1,
            1,
            1_000,
            1,
        );
        small.sign(&fx.alice).unwrap();

        // Header claims a small total while the transactions sum past u64::MAX
        let mut block = next_block(&fx.chain, vec![huge, small]);
        block.gas_used = 1_000;
        block.gas_limit = 1_000;
        block.hash = block.compute_hash();

        match fx.chain.add_block(block) {
            Err(BlockchainError::GasLimitExceeded(reason)) => assert!(reason.contains("overflow")),
            other => panic!("expected gas overflow, got {:?}", other),
        }
        assert_eq!(fx.chain.height(), 0);
        assert_eq!(fx.chain.ledger().get_nonce(fx.alice.address()), 0);
    }

    #[test]
    fn test_duplicate_transactions() {
        let fx = fixture();
        let tx = transfer(&fx.alice, &fx.bob, 1, 0);

        let doubled = next_block(&fx.chain, vec![tx.clone(), tx.clone()]);
        assert!(matches!(
            fx.chain.add_block(doubled),
            Err(BlockchainError::DuplicateTransaction(_))
        ));

        fx.chain.add_block(next_block(&fx.chain, vec![tx.clone()])).unwrap();
        let replay = next_block(&fx.chain, vec![tx]);
        assert!(matches!(
            fx.chain.add_block(replay),
            Err(BlockchainError::DuplicateTransaction(_))
        ));
    }

    #[test]
    fn test_failed_transactions_get_failed_receipts() {
        let fx = fixture();
        let good = transfer(&fx.alice, &fx.bob, 10, 0);
        let wrong_nonce = transfer(&fx.alice, &fx.bob, 10, 7);
        let broke = transfer(&fx.bob, &fx.alice, 10, 0);
        let mut forged = transfer(&fx.alice, &fx.bob, 10, 1);
        forged.value = 999;
        forged.hash = forged.compute_hash();
        let mint = Transaction::mint(fx.bob.address().clone(), 1_000);

        let block = next_block(
            &fx.chain,
            vec![good.clone(), wrong_nonce, broke, forged, mint],
        );
        let receipts = fx.chain.add_block(block).unwrap();

        let statuses: Vec<bool> = receipts.iter().map(|r| r.is_applied()).collect();
        assert_eq!(statuses, vec![true, false, false, false, false]);
        assert_eq!(receipts[1].gas_used, 0);

        let ledger = fx.chain.ledger();
        assert_eq!(ledger.get_balance(fx.bob.address(), GND), 10);
        assert_eq!(ledger.get_nonce(fx.alice.address()), 1);
        assert_eq!(ledger.get_nonce(fx.bob.address()), 0);
        assert_eq!(fx.chain.height(), 1);
    }

    #[test]
    fn test_contract_transactions_in_blocks() {
        let fx = fixture();
        let engine = fx.chain.engine();
        engine
            .credit_fee_balance(fx.alice.address(), 1_000_000)
            .unwrap();

        let payload = DeployPayload {
            standard: "erc20".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            bytecode: b"gsh".to_vec(),
            name: "Ganimed Share".to_string(),
            symbol: "GSH".to_string(),
            decimals: 0,
            total_supply: 1_000,
            bridge_address: None,
        };
        let mut deploy = Transaction::deploy(
            fx.alice.address().clone(),
            payload.encode().unwrap(),
            1,
            DEPLOY_GAS,
            0,
        );
        deploy.sign(&fx.alice).unwrap();
        let contract = crate::blockchain::AddressCodec::contract_address(b"gsh", 0);

        let call = ContractCall::Transfer {
            to: fx.bob.address().clone(),
            amount: 400,
        };
        let mut call_tx = Transaction::call(
            fx.alice.address().clone(),
            contract.clone(),
            call.encode().unwrap(),
            1,
            call.gas_cost(),
            1,
        );
        call_tx.sign(&fx.alice).unwrap();

        // Fails in the engine but still consumes nonce 2
        let bad = ContractCall::Transfer {
            to: fx.bob.address().clone(),
            amount: 1_000_000,
        };
        let mut bad_tx = Transaction::call(
            fx.alice.address().clone(),
            contract.clone(),
            bad.encode().unwrap(),
            1,
            bad.gas_cost(),
            2,
        );
        bad_tx.sign(&fx.alice).unwrap();

        let receipts = fx
            .chain
            .add_block(next_block(&fx.chain, vec![deploy, call_tx, bad_tx]))
            .unwrap();
        let statuses: Vec<bool> = receipts.iter().map(|r| r.is_applied()).collect();
        assert_eq!(statuses, vec![true, true, false]);

        let balance = engine
            .contract(&contract)
            .unwrap()
            .read(|token| token.balance_of(fx.bob.address()));
        assert_eq!(balance, 400);
        assert_eq!(fx.chain.ledger().get_nonce(fx.alice.address()), 3);

        assert_eq!(receipts[0].events.len(), 1);
        assert!(matches!(
            &receipts[0].events[0],
            ContractEvent::Deployed { contract: deployed, .. } if deployed == &contract
        ));
        assert_eq!(
            receipts[1].events,
            vec![ContractEvent::Transfer {
                contract: contract.clone(),
                from: fx.alice.address().clone(),
                to: fx.bob.address().clone(),
                amount: 400,
            }]
        );
        assert!(receipts[2].events.is_empty());
    }

    #[test]
    fn test_contract_nonce_consumed_once_per_transaction() {
        let fx = fixture();
        fx.chain
            .engine()
            .credit_fee_balance(fx.alice.address(), 1_000_000)
            .unwrap();

        let call = ContractCall::TotalSupply;
        let mut missing = Transaction::call(
            fx.alice.address().clone(),
            crate::blockchain::AddressCodec::contract_address(b"nowhere", 0),
            call.encode().unwrap(),
            1,
            call.gas_cost(),
            0,
        );
        missing.sign(&fx.alice).unwrap();
        let follow_up = transfer(&fx.alice, &fx.bob, 5, 1);

        let receipts = fx
            .chain
            .add_block(next_block(&fx.chain, vec![missing, follow_up]))
            .unwrap();
        let statuses: Vec<bool> = receipts.iter().map(|r| r.is_applied()).collect();
        assert_eq!(statuses, vec![false, true]);
        assert_eq!(fx.chain.ledger().get_nonce(fx.alice.address()), 2);
    }

    #[test]
    fn test_store_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let genesis = genesis_for(&alice);

        let head_hash = {
            let store: Arc<dyn ChainStore> = Arc::new(SledStore::open(dir.path()).unwrap());
            let chain = Blockchain::new(genesis.clone()).unwrap().with_store(store);
            for nonce in 0..3 {
                chain
                    .add_block(next_block(&chain, vec![transfer(&alice, &bob, 100, nonce)]))
                    .unwrap();
            }
            chain.latest_block().hash
        };

        let store: Arc<dyn ChainStore> = Arc::new(SledStore::open(dir.path()).unwrap());
        let restored = Blockchain::restore(
            genesis,
            engine(),
            DEFAULT_BLOCK_GAS_LIMIT,
            store,
        )
        .unwrap();

        assert_eq!(restored.height(), 3);
        assert_eq!(restored.latest_block().hash, head_hash);
        assert_eq!(restored.ledger().get_balance(bob.address(), GND), 300);
        assert_eq!(restored.ledger().get_nonce(alice.address()), 3);
    }

    fn stored_chain(dir: &std::path::Path, alice: &Wallet, bob: &Wallet) -> (Block, Vec<Receipt>) {
        let genesis = genesis_for(alice);
        let store: Arc<dyn ChainStore> = Arc::new(SledStore::open(dir).unwrap());
        let chain = Blockchain::new(genesis.clone()).unwrap().with_store(store);
        let receipts = chain
            .add_block(next_block(&chain, vec![transfer(alice, bob, 100, 0)]))
            .unwrap();
        (genesis, receipts)
    }

    #[test]
    fn test_restore_rejects_diverging_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let (genesis, receipts) = stored_chain(dir.path(), &alice, &bob);

        let store: Arc<dyn ChainStore> = Arc::new(SledStore::open(dir.path()).unwrap());
        let mut tampered = receipts[0].clone();
        tampered.status = ReceiptStatus::Failed("rewritten".to_string());
        store.save_receipts(&[tampered]).unwrap();

        let result = Blockchain::restore(genesis, engine(), DEFAULT_BLOCK_GAS_LIMIT, store);
        assert!(matches!(result, Err(BlockchainError::InvalidChain(_))));
    }

    #[test]
    fn test_restore_rejects_stale_head() {
        let dir = tempfile::tempdir().unwrap();
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let (genesis, _) = stored_chain(dir.path(), &alice, &bob);

        // Rewriting genesis moves the stored head pointer back to it
        let store: Arc<dyn ChainStore> = Arc::new(SledStore::open(dir.path()).unwrap());
        store.save_block(&genesis).unwrap();

        let result = Blockchain::restore(genesis, engine(), DEFAULT_BLOCK_GAS_LIMIT, store);
        assert!(matches!(result, Err(BlockchainError::InvalidChain(_))));
    }

    #[test]
    fn test_restore_replaces_diverging_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let (genesis, _) = stored_chain(dir.path(), &alice, &bob);

        let store: Arc<dyn ChainStore> = Arc::new(SledStore::open(dir.path()).unwrap());
        let mut inflated = Account::new(bob.address().clone());
        inflated.balances = BTreeMap::from([(GND.to_string(), 1_000_000_000)]);
        store.save_accounts(&[inflated]).unwrap();

        let restored =
            Blockchain::restore(genesis, engine(), DEFAULT_BLOCK_GAS_LIMIT, store.clone()).unwrap();
        assert_eq!(restored.ledger().get_balance(bob.address(), GND), 100);

        let mirrored = store
            .load_accounts()
            .unwrap()
            .into_iter()
            .find(|account| &account.address == bob.address())
            .unwrap();
        assert_eq!(mirrored.balances.get(GND), Some(&100));
    }

    #[test]
    fn test_diverging_accounts() {
        let alice = Account::new(Wallet::generate().address().clone());
        let mut bob = Account::new(Wallet::generate().address().clone());
        bob.nonce = 1;
        let mut bob_mirrored = bob.clone();
        bob_mirrored.nonce = 0;

        assert!(diverging_accounts(&[alice.clone(), bob.clone()], &[bob.clone(), alice.clone()]).is_empty());
        assert_eq!(
            diverging_accounts(&[alice.clone(), bob_mirrored], &[alice.clone(), bob.clone()]),
            vec![bob.address.clone()]
        );
        assert_eq!(
            diverging_accounts(&[], &[alice.clone()]),
            vec![alice.address.clone()]
        );
    }

    #[test]
    fn test_restore_rejects_foreign_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ChainStore> = Arc::new(SledStore::open(dir.path()).unwrap());
        let _chain = Blockchain::new(genesis_for(&Wallet::generate()))
            .unwrap()
            .with_store(store.clone());

        let result = Blockchain::restore(
            genesis_for(&Wallet::generate()),
            engine(),
            DEFAULT_BLOCK_GAS_LIMIT,
            store,
        );
        assert!(matches!(result, Err(BlockchainError::InvalidChain(_))));
    }
}
