//! Core of a single blockchain node
//!
//! Ledger, mempool, chain of blocks, pluggable consensus (PoA and PoS) and a
//! fungible token execution engine. Every shared structure is owned by a
//! [`Node`] and safe to use from many threads at once.

pub mod blockchain;
pub mod config;
pub mod consensus;
pub mod node;
pub mod signer;
pub mod vm;

pub use blockchain::{Address, Amount, Block, Blockchain, Mempool, Transaction, Wallet};
pub use config::NodeConfig;
pub use consensus::ConsensusEngine;
pub use node::{Node, NodeError, StateAccess, TransactionStatus};
