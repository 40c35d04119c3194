// Consensus
//
// A consensus engine runs a background task that periodically turns pending
// transactions into blocks. Engines differ only in how the proposer for a
// height is chosen.

pub mod poa;
pub mod pos;
pub mod producer;

use thiserror::Error;

use std::sync::Arc;
use std::time::Duration;

use crate::blockchain::{Address, Block, Blockchain, BlockchainError, Mempool};
use crate::config::{ConsensusKind, NodeConfig};

pub use poa::AuthorityRotation;
pub use pos::StakeWeighted;
pub use producer::{produce_block, select_transactions, BlockProducer, ProducerConfig};

pub type PoaEngine = BlockProducer<AuthorityRotation>;
pub type PosEngine = BlockProducer<StakeWeighted>;

/// Errors that can occur in a consensus engine
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Consensus engine already running")]
    AlreadyRunning,

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Invalid consensus configuration: {0}")]
    InvalidConfig(String),

    #[error("Blockchain error: {0}")]
    BlockchainError(#[from] BlockchainError),
}

/// Pluggable block production. `Stopped -> start() -> Running -> stop() -> Stopped`.
pub trait ConsensusEngine: Send + Sync {
    /// Spawns the production loop on the current tokio runtime
    fn start(&self, chain: Arc<Blockchain>, mempool: Arc<Mempool>) -> Result<(), ConsensusError>;

    /// Requests the loop to stop. The loop notices at its next tick at the latest.
    fn stop(&self);

    fn kind(&self) -> &'static str;

    fn is_running(&self) -> bool;

    /// Runs a single production step synchronously
    fn tick(&self, chain: &Blockchain, mempool: &Mempool) -> Result<Option<Block>, ConsensusError>;
}

/// Chooses who may propose the block at a given height
pub trait ProposerSelection: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Proposer for `height`, given the hash of the block it builds on
    fn select(&self, height: u64, prev_hash: &str) -> Option<Address>;
}

/// Builds the consensus engine described by `config`
pub fn from_config(config: &NodeConfig) -> Result<Box<dyn ConsensusEngine>, ConsensusError> {
    let consensus = &config.consensus;
    let producer_config = ProducerConfig {
        validator: consensus.validator.clone(),
        block_interval: Duration::from_millis(consensus.block_interval_ms),
        max_block_transactions: config.max_block_transactions,
        block_gas_limit: config.block_gas_limit,
    };

    let kind = consensus
        .kind()
        .map_err(|e| ConsensusError::InvalidConfig(e.to_string()))?;

    let engine: Box<dyn ConsensusEngine> = match kind {
        ConsensusKind::Poa => Box::new(PoaEngine::new(
            AuthorityRotation::new(consensus.authorities.clone())?,
            producer_config,
        )),
        ConsensusKind::Pos => {
            let validators = consensus
                .validators
                .iter()
                .map(|v| (v.address.clone(), v.stake))
                .collect();
            Box::new(PosEngine::new(StakeWeighted::new(validators)?, producer_config))
        }
    };

    Ok(engine)
}
