use log::{debug, error, info, warn};
use parking_lot::Mutex;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{ConsensusEngine, ConsensusError, ProposerSelection};
use crate::blockchain::{Address, Block, Blockchain, Mempool, Transaction, TransactionKind};

/// Settings shared by every engine variant
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Local proposer; `None` means the node never proposes
    pub validator: Option<Address>,
    pub block_interval: Duration,
    pub max_block_transactions: usize,
    pub block_gas_limit: u64,
}

/// Interval-driven block production over a proposer selection strategy
pub struct BlockProducer<S: ProposerSelection> {
    strategy: Arc<S>,
    config: ProducerConfig,
    /// Flag of the current run; each `start` gets a fresh one
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl<S: ProposerSelection> BlockProducer<S> {
    pub fn new(strategy: S, config: ProducerConfig) -> Self {
        BlockProducer {
            strategy: Arc::new(strategy),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }
}

impl<S: ProposerSelection> ConsensusEngine for BlockProducer<S> {
    fn start(&self, chain: Arc<Blockchain>, mempool: Arc<Mempool>) -> Result<(), ConsensusError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConsensusError::NoRuntime(e.to_string()))?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ConsensusError::AlreadyRunning);
        }

        let flag = Arc::new(AtomicBool::new(true));
        *running = Some(flag.clone());

        let strategy = self.strategy.clone();
        let config = self.config.clone();
        let kind = strategy.kind();

        info!(
            "Starting {} consensus, block interval {:?}, validator {}",
            kind,
            config.block_interval,
            config
                .validator
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(config.block_interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    break;
                }

                match produce_block(strategy.as_ref(), &config, &chain, &mempool) {
                    Ok(Some(block)) => debug!("{} produced block {}", kind, block.index),
                    Ok(None) => {}
                    Err(err) => error!("{} consensus tick failed: {}", kind, err),
                }
            }

            info!("{} consensus stopped", kind);
        });

        Ok(())
    }

    fn stop(&self) {
        if let Some(flag) = self.running.lock().take() {
            flag.store(false, Ordering::SeqCst);
            info!("Stopping {} consensus", self.strategy.kind());
        }
    }

    fn kind(&self) -> &'static str {
        self.strategy.kind()
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn tick(&self, chain: &Blockchain, mempool: &Mempool) -> Result<Option<Block>, ConsensusError> {
        produce_block(self.strategy.as_ref(), &self.config, chain, mempool)
    }
}

/// Runs one production step
///
/// Returns `Ok(None)` when the local validator is not the proposer for the
/// next height or when nothing is admissible.
pub fn produce_block<S: ProposerSelection + ?Sized>(
    strategy: &S,
    config: &ProducerConfig,
    chain: &Blockchain,
    mempool: &Mempool,
) -> Result<Option<Block>, ConsensusError> {
    let validator = match &config.validator {
        Some(validator) => validator,
        None => return Ok(None),
    };

    let head = chain.latest_block();
    let height = head.index + 1;
    if strategy.select(height, &head.hash).as_ref() != Some(validator) {
        debug!("{} is not the proposer for height {}", validator, height);
        return Ok(None);
    }

    let gas_limit = config.block_gas_limit.min(chain.block_gas_limit());
    let transactions = select_transactions(chain, mempool, config.max_block_transactions, gas_limit);
    if transactions.is_empty() {
        return Ok(None);
    }

    let block = Block::new(height, head.hash, validator.clone(), transactions)
        .with_gas_limit(gas_limit)
        .with_consensus_tag(strategy.kind());
    let hashes = block.transaction_hashes();

    chain.add_block(block.clone())?;
    mempool.remove_many(&hashes);

    Ok(Some(block))
}

/// Picks an ordered batch of admissible transactions from the mempool
///
/// Candidates are ordered by sender, then nonce, then descending gas price,
/// and dry-run against a fork of the ledger. Transactions that can never
/// apply are evicted from the mempool.
pub fn select_transactions(
    chain: &Blockchain,
    mempool: &Mempool,
    max_transactions: usize,
    gas_limit: u64,
) -> Vec<Transaction> {
    let mut candidates = mempool.all();
    candidates.sort_by(|a, b| {
        a.from
            .cmp(&b.from)
            .then(a.nonce.cmp(&b.nonce))
            .then(b.gas_price.cmp(&a.gas_price))
    });

    let ledger = chain.ledger();
    let fork = ledger.fork();
    let mut selected = Vec::new();
    let mut reserved: u64 = 0;

    for transaction in candidates {
        if selected.len() >= max_transactions {
            break;
        }

        if let Some(reason) = never_applicable(chain, &transaction, gas_limit) {
            warn!("Evicting transaction {}: {}", transaction.hash, reason);
            mempool.remove(&transaction.hash);
            continue;
        }

        let next_reserved = match reserved.checked_add(transaction.gas_limit) {
            Some(total) if total <= gas_limit => total,
            _ => continue,
        };

        let admissible = match transaction.kind {
            TransactionKind::Transfer => fork.apply_transaction(&transaction).is_ok(),
            _ => fork
                .consume_nonce(&transaction.from, transaction.nonce)
                .is_ok(),
        };

        if admissible {
            reserved = next_reserved;
            selected.push(transaction);
        }
    }

    selected
}

fn never_applicable(chain: &Blockchain, transaction: &Transaction, gas_limit: u64) -> Option<String> {
    if chain.contains_transaction(&transaction.hash) {
        return Some("already committed".to_string());
    }
    if transaction.is_mint() {
        return Some("mint outside genesis".to_string());
    }
    if let Err(err) = transaction
        .validate_fields()
        .and_then(|_| transaction.verify_signature())
    {
        return Some(err.to_string());
    }
    if transaction.gas_limit > gas_limit {
        return Some(format!("gas limit above block gas limit {}", gas_limit));
    }

    let current = chain.ledger().get_nonce(&transaction.from);
    if transaction.nonce < current {
        return Some(format!("stale nonce {} (current {})", transaction.nonce, current));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::default_genesis_timestamp;
    use crate::blockchain::chain::DEFAULT_BLOCK_GAS_LIMIT;
    use crate::blockchain::{LedgerState, Wallet};
    use crate::consensus::{AuthorityRotation, PoaEngine};
    use crate::vm::engine::DEFAULT_MAX_CALL_GAS;
    use crate::vm::ExecutionEngine;

    struct Fixture {
        chain: Arc<Blockchain>,
        mempool: Arc<Mempool>,
        alice: Wallet,
        bob: Wallet,
        validator: Wallet,
    }

    fn fixture() -> Fixture {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let validator = Wallet::generate();
        let genesis = Block::genesis(
            Address::system(),
            &[(alice.address().clone(), 1_000_000)],
            default_genesis_timestamp(),
            DEFAULT_BLOCK_GAS_LIMIT,
        );
        let chain = Blockchain::with_state(
            genesis,
            Arc::new(ExecutionEngine::new(
                Arc::new(LedgerState::new("GND")),
                DEFAULT_MAX_CALL_GAS,
            )),
            DEFAULT_BLOCK_GAS_LIMIT,
        )
        .unwrap();

        Fixture {
            chain: Arc::new(chain),
            mempool: Arc::new(Mempool::new()),
            alice,
            bob,
            validator,
        }
    }

    fn config(validator: &Wallet, interval_ms: u64) -> ProducerConfig {
        ProducerConfig {
            validator: Some(validator.address().clone()),
            block_interval: Duration::from_millis(interval_ms),
            max_block_transactions: 100,
            block_gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
        }
    }

    fn engine(fx: &Fixture, interval_ms: u64) -> PoaEngine {
        let rotation = AuthorityRotation::new(vec![fx.validator.address().clone()]).unwrap();
        PoaEngine::new(rotation, config(&fx.validator, interval_ms))
    }

    fn transfer(from: &Wallet, to: &Wallet, value: u128, gas_price: u128, nonce: u64) -> Transaction {
        let mut tx = Transaction::transfer(
            from.address().clone(),
            to.address().clone(),
            value,
            gas_price,
            21_000,
            nonce,
        );
        tx.sign(from).unwrap();
        tx
    }

    #[test]
    fn test_tick_produces_block_and_clears_mempool() {
        let fx = fixture();
        let engine = engine(&fx, 1_000);
        for nonce in (0..3).rev() {
            fx.mempool.add(transfer(&fx.alice, &fx.bob, 10, 1, nonce));
        }

        let block = engine.tick(&fx.chain, &fx.mempool).unwrap().unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.consensus_tag, "poa");
        assert_eq!(&block.miner, fx.validator.address());
        let nonces: Vec<u64> = block.transactions.iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![0, 1, 2]);

        assert_eq!(fx.mempool.size(), 0);
        assert_eq!(fx.chain.height(), 1);
        assert_eq!(fx.chain.ledger().get_balance(fx.bob.address(), "GND"), 30);
    }

    #[test]
    fn test_tick_without_transactions_produces_nothing() {
        let fx = fixture();
        let engine = engine(&fx, 1_000);
        assert!(engine.tick(&fx.chain, &fx.mempool).unwrap().is_none());
        assert_eq!(fx.chain.height(), 0);
    }

    #[test]
    fn test_not_proposer() {
        let fx = fixture();
        let other = Wallet::generate();
        let rotation = AuthorityRotation::new(vec![other.address().clone()]).unwrap();
        let engine = PoaEngine::new(rotation, config(&fx.validator, 1_000));

        fx.mempool.add(transfer(&fx.alice, &fx.bob, 10, 1, 0));
        assert!(engine.tick(&fx.chain, &fx.mempool).unwrap().is_none());
        assert_eq!(fx.mempool.size(), 1);
    }

    #[test]
    fn test_selection_evicts_and_skips() {
        let fx = fixture();
        fx.chain
            .add_block(Block::new(
                1,
                fx.chain.latest_block().hash,
                Address::system(),
                vec![transfer(&fx.alice, &fx.bob, 1, 1, 0)],
            ))
            .unwrap();

        let stale = transfer(&fx.alice, &fx.bob, 1, 1, 0);
        let mut unsigned = transfer(&fx.alice, &fx.bob, 2, 1, 1);
        unsigned.signature = None;
        let gap = transfer(&fx.alice, &fx.bob, 1, 1, 5);
        let good = transfer(&fx.alice, &fx.bob, 3, 1, 1);
        let broke = transfer(&fx.bob, &fx.alice, 1_000_000, 1, 0);
        for tx in [&stale, &unsigned, &gap, &good, &broke] {
            fx.mempool.add(tx.clone());
        }

        let selected = select_transactions(&fx.chain, &fx.mempool, 10, DEFAULT_BLOCK_GAS_LIMIT);
        assert_eq!(selected, vec![good.clone()]);

        // Stale and unsigned are gone; the nonce gap and the underfunded one wait
        assert!(!fx.mempool.exists(&stale.hash));
        assert!(!fx.mempool.exists(&unsigned.hash));
        assert!(fx.mempool.exists(&gap.hash));
        assert!(fx.mempool.exists(&broke.hash));
        assert!(fx.mempool.exists(&good.hash));
    }

    #[test]
    fn test_selection_prefers_higher_gas_price_for_same_nonce() {
        let fx = fixture();
        let cheap = transfer(&fx.alice, &fx.bob, 1, 1, 0);
        let pricey = transfer(&fx.alice, &fx.bob, 1, 5, 0);
        fx.mempool.add(cheap);
        fx.mempool.add(pricey.clone());

        let selected = select_transactions(&fx.chain, &fx.mempool, 10, DEFAULT_BLOCK_GAS_LIMIT);
        assert_eq!(selected, vec![pricey]);
    }

    #[test]
    fn test_selection_respects_limits() {
        let fx = fixture();
        for nonce in 0..5 {
            fx.mempool.add(transfer(&fx.alice, &fx.bob, 1, 1, nonce));
        }

        assert_eq!(select_transactions(&fx.chain, &fx.mempool, 2, DEFAULT_BLOCK_GAS_LIMIT).len(), 2);
        assert_eq!(select_transactions(&fx.chain, &fx.mempool, 10, 21_000 * 3).len(), 3);
        assert_eq!(fx.mempool.size(), 5);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let fx = fixture();
        let engine = engine(&fx, 20);

        assert!(!engine.is_running());
        engine.start(fx.chain.clone(), fx.mempool.clone()).unwrap();
        assert!(engine.is_running());
        assert!(matches!(
            engine.start(fx.chain.clone(), fx.mempool.clone()),
            Err(ConsensusError::AlreadyRunning)
        ));

        fx.mempool.add(transfer(&fx.alice, &fx.bob, 10, 1, 0));
        for _ in 0..100 {
            if fx.chain.height() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.chain.height(), 1);
        assert_eq!(fx.mempool.size(), 0);

        engine.stop();
        assert!(!engine.is_running());

        // Once the loop has observed the flag no further blocks appear
        tokio::time::sleep(Duration::from_millis(60)).await;
        fx.mempool.add(transfer(&fx.alice, &fx.bob, 10, 1, 1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.chain.height(), 1);

        // And it can be restarted
        engine.start(fx.chain.clone(), fx.mempool.clone()).unwrap();
        for _ in 0..100 {
            if fx.chain.height() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.chain.height(), 2);
        engine.stop();
    }

    #[test]
    fn test_start_requires_runtime() {
        let fx = fixture();
        let engine = engine(&fx, 20);
        assert!(matches!(
            engine.start(fx.chain.clone(), fx.mempool.clone()),
            Err(ConsensusError::NoRuntime(_))
        ));
        assert!(!engine.is_running());
    }
}
