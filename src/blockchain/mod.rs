// Blockchain module
//
// This module contains the core ledger implementation including:
// - Address codec, wallets and signatures
// - Transaction and block model
// - Ledger state (balances and nonces)
// - Mempool of pending transactions
// - The chain itself and its write-behind store

pub mod account;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod mempool;
pub mod storage;
pub mod transaction;

/// Monetary amount in the smallest indivisible unit
pub type Amount = u128;

// Re-export main components for easier access
pub use account::{AccountError, LedgerState};
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, Receipt, ReceiptStatus};
pub use crypto::{Address, AddressCodec, DigitalSignature, Wallet};
pub use mempool::{Mempool, MempoolError};
pub use storage::{ChainStore, SledStore, StorageError};
pub use transaction::{Transaction, TransactionError, TransactionKind, TransactionSignature};
