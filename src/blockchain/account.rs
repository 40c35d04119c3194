use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::{BTreeMap, HashMap};

use super::crypto::Address;
use super::transaction::{Transaction, TransactionError, TransactionKind};
use super::Amount;

/// Errors that can occur during account operations
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Invalid address: {0}")]
    AddressInvalid(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },

    #[error("Balance overflow")]
    Overflow,

    #[error("{0:?} transactions do not apply to the native ledger")]
    UnsupportedKind(TransactionKind),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),
}

/// Read-only view of one address: every asset balance plus the nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Version of the account structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// The account's address
    pub address: Address,

    /// Balance per asset symbol
    pub balances: BTreeMap<String, Amount>,

    /// The account's nonce (used to prevent replay attacks)
    pub nonce: u64,
}

/// Default version for accounts
fn default_version() -> u32 {
    1
}

impl Account {
    pub fn new(address: Address) -> Self {
        Account {
            version: default_version(),
            address,
            balances: BTreeMap::new(),
            nonce: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Ledger {
    balances: HashMap<(Address, String), Amount>,
    nonces: HashMap<Address, u64>,
}

impl Ledger {
    fn balance(&self, address: &Address, symbol: &str) -> Amount {
        self.balances
            .get(&(address.clone(), symbol.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn nonce(&self, address: &Address) -> u64 {
        self.nonces.get(address).copied().unwrap_or(0)
    }

    fn credit(&mut self, address: &Address, symbol: &str, amount: Amount) -> Result<(), AccountError> {
        let entry = self
            .balances
            .entry((address.clone(), symbol.to_string()))
            .or_insert(0);
        *entry = entry.checked_add(amount).ok_or(AccountError::Overflow)?;
        Ok(())
    }

    fn debit(&mut self, address: &Address, symbol: &str, amount: Amount) -> Result<(), AccountError> {
        let available = self.balance(address, symbol);
        if available < amount {
            return Err(AccountError::InsufficientFunds {
                required: amount,
                available,
            });
        }

        let key = (address.clone(), symbol.to_string());
        let remaining = available - amount;
        if remaining == 0 {
            self.balances.remove(&key);
        } else {
            self.balances.insert(key, remaining);
        }
        Ok(())
    }

    fn check_nonce(&self, address: &Address, got: u64) -> Result<(), AccountError> {
        let expected = self.nonce(address);
        if got != expected {
            return Err(AccountError::NonceMismatch { expected, got });
        }
        Ok(())
    }

    fn bump_nonce(&mut self, address: &Address) {
        *self.nonces.entry(address.clone()).or_insert(0) += 1;
    }
}

/// Authoritative balances and nonces, guarded by a single reader-writer lock
///
/// Balances are keyed by `(address, symbol)`. Fees and transaction values are
/// always denominated in the native symbol.
#[derive(Debug)]
pub struct LedgerState {
    native_symbol: String,
    inner: RwLock<Ledger>,
}

impl LedgerState {
    /// Creates an empty ledger whose native asset is `native_symbol`
    pub fn new(native_symbol: &str) -> Self {
        LedgerState {
            native_symbol: native_symbol.to_string(),
            inner: RwLock::new(Ledger::default()),
        }
    }

    pub fn native_symbol(&self) -> &str {
        &self.native_symbol
    }

    /// Gets the balance of `address` in `symbol`, zero for unknown entries
    pub fn get_balance(&self, address: &Address, symbol: &str) -> Amount {
        self.inner.read().balance(address, symbol)
    }

    pub fn get_native_balance(&self, address: &Address) -> Amount {
        self.get_balance(address, &self.native_symbol)
    }

    /// Unconditionally increases a balance
    ///
    /// # Arguments
    ///
    /// * `address` - The account to credit
    /// * `symbol` - The asset symbol
    /// * `amount` - The amount to add, must be non-zero
    pub fn credit(&self, address: &Address, symbol: &str, amount: Amount) -> Result<(), AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        self.inner.write().credit(address, symbol, amount)
    }

    /// Decreases a balance, failing without change if it is too small
    ///
    /// # Arguments
    ///
    /// * `address` - The account to debit
    /// * `symbol` - The asset symbol
    /// * `amount` - The amount to subtract, must be non-zero
    pub fn debit(&self, address: &Address, symbol: &str, amount: Amount) -> Result<(), AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        self.inner.write().debit(address, symbol, amount)
    }

    /// Alias of [`LedgerState::debit`] used by the state capability surface
    pub fn sub_balance(&self, address: &Address, symbol: &str, amount: Amount) -> Result<(), AccountError> {
        self.debit(address, symbol, amount)
    }

    pub fn get_nonce(&self, address: &Address) -> u64 {
        self.inner.read().nonce(address)
    }

    /// Applies a value transfer: nonce check, cost check, debit, credit and nonce bump
    ///
    /// Every step happens under one write-lock acquisition, so either the whole
    /// transition is visible or none of it is.
    ///
    /// # Arguments
    ///
    /// * `transaction` - The transaction to apply
    ///
    /// # Returns
    ///
    /// Result indicating success or failure. On failure the ledger is unchanged.
    pub fn apply_transaction(&self, transaction: &Transaction) -> Result<(), AccountError> {
        if transaction.kind != TransactionKind::Transfer {
            return Err(AccountError::UnsupportedKind(transaction.kind));
        }
        if !transaction.from.is_account() {
            return Err(AccountError::AddressInvalid(transaction.from.to_string()));
        }
        if !transaction.to.is_well_formed() {
            return Err(AccountError::AddressInvalid(transaction.to.to_string()));
        }

        let total_cost = transaction.total_cost()?;
        let symbol = self.native_symbol.as_str();

        let mut ledger = self.inner.write();

        ledger.check_nonce(&transaction.from, transaction.nonce)?;

        let available = ledger.balance(&transaction.from, symbol);
        if available < total_cost {
            return Err(AccountError::InsufficientFunds {
                required: total_cost,
                available,
            });
        }

        // The recipient credit is the only step that can still fail, so check it
        // before anything is written.
        if transaction.from != transaction.to {
            ledger
                .balance(&transaction.to, symbol)
                .checked_add(transaction.value)
                .ok_or(AccountError::Overflow)?;
        }

        ledger.debit(&transaction.from, symbol, total_cost)?;
        if transaction.value > 0 {
            ledger.credit(&transaction.to, symbol, transaction.value)?;
        }
        ledger.bump_nonce(&transaction.from);

        Ok(())
    }

    /// Credits a genesis allocation
    pub fn apply_mint(&self, transaction: &Transaction) -> Result<(), AccountError> {
        if !transaction.to.is_account() {
            return Err(AccountError::AddressInvalid(transaction.to.to_string()));
        }

        self.credit(&transaction.to, &self.native_symbol, transaction.value)
    }

    /// Increments the nonce of `address` if it currently equals `expected`
    pub fn consume_nonce(&self, address: &Address, expected: u64) -> Result<(), AccountError> {
        let mut ledger = self.inner.write();
        ledger.check_nonce(address, expected)?;
        ledger.bump_nonce(address);
        Ok(())
    }

    /// Creates an independent copy of the current state, used for dry runs
    pub fn fork(&self) -> LedgerState {
        LedgerState {
            native_symbol: self.native_symbol.clone(),
            inner: RwLock::new(self.inner.read().clone()),
        }
    }

    /// Sum of every balance held in `symbol`
    pub fn total_supply(&self, symbol: &str) -> Amount {
        self.inner
            .read()
            .balances
            .iter()
            .filter(|((_, asset), _)| asset == symbol)
            .map(|(_, amount)| *amount)
            .sum()
    }

    /// Gets a view of a single account
    pub fn get_account(&self, address: &Address) -> Account {
        let ledger = self.inner.read();
        let mut account = Account::new(address.clone());
        account.nonce = ledger.nonce(address);
        for ((owner, symbol), amount) in &ledger.balances {
            if owner == address {
                account.balances.insert(symbol.clone(), *amount);
            }
        }
        account
    }

    /// Gets a view of every known account, ordered by address
    pub fn get_all_accounts(&self) -> Vec<Account> {
        let ledger = self.inner.read();
        let mut accounts: BTreeMap<Address, Account> = BTreeMap::new();

        for ((owner, symbol), amount) in &ledger.balances {
            accounts
                .entry(owner.clone())
                .or_insert_with(|| Account::new(owner.clone()))
                .balances
                .insert(symbol.clone(), *amount);
        }
        for (owner, nonce) in &ledger.nonces {
            accounts
                .entry(owner.clone())
                .or_insert_with(|| Account::new(owner.clone()))
                .nonce = *nonce;
        }

        accounts.into_values().collect()
    }
}
