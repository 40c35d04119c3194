// Contract execution
//
// - Token standards and their capability sets
// - Structured call data and deploy payloads
// - The fungible token contract
// - The execution engine: fee ledger, contract registry and dispatch
// - Contract events and their in-process subscribers

pub mod call;
pub mod engine;
pub mod events;
pub mod standard;
pub mod token;

use thiserror::Error;

use crate::blockchain::{AccountError, Address, Amount, Transaction, TransactionError};

pub use call::{ContractCall, DeployPayload, DEPLOY_GAS};
pub use engine::{CallValue, Contract, ContractMeta, ExecutionEngine, ExecutionResult, TokenMetadata};
pub use events::{ContractEvent, EventBus};
pub use standard::{Capability, TokenStandard};
pub use token::{ModuleHandler, ModuleInfo, Snapshot, TokenContract, TokenError};

/// Errors that can occur during contract deployment and execution
#[derive(Debug, Error)]
pub enum VmError {
    #[error("Insufficient gas: {0}")]
    InsufficientGas(String),

    #[error("Gas limit {limit} exceeds the maximum of {max}")]
    GasLimitExceeded { limit: u64, max: u64 },

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Method {method} not supported by {standard} contracts")]
    MethodNotSupported { standard: String, method: String },

    #[error("Argument type mismatch: {0}")]
    ArgumentTypeMismatch(String),

    #[error("Token already registered: {0}")]
    TokenAlreadyRegistered(String),

    #[error("Token standard not supported: {0}")]
    StandardNotSupported(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not a contract transaction: {0}")]
    NotContractTransaction(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Arithmetic overflow")]
    Overflow,

    #[error("Token error: {0}")]
    TokenError(#[from] TokenError),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),
}

/// Contract capability surface consumed by deployer and API layers
pub trait ContractVm: Send + Sync {
    /// Deploys the contract described by a signed deploy transaction
    fn deploy_contract(&self, transaction: &Transaction) -> Result<Address, VmError>;

    /// Executes a signed call transaction
    fn call_contract(&self, transaction: &Transaction) -> Result<ExecutionResult, VmError>;

    /// Fee-ledger balance of `address`
    fn get_balance(&self, address: &Address) -> Amount;
}
