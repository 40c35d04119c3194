use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::blockchain::{Address, Amount};

/// Errors raised by token operations. Every failing operation leaves the token unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Amount, available: Amount },

    #[error("Allowance exceeded: requested {requested}, allowed {allowed}")]
    AllowanceExceeded { requested: Amount, allowed: Amount },

    #[error("KYC required for {0}")]
    KycRequired(Address),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(u64),

    #[error("No dividend pool set for snapshot {0}")]
    DividendPoolNotSet(u64),

    #[error("Dividend pool already set for snapshot {0}")]
    DividendPoolAlreadySet(u64),

    #[error("Dividends already claimed for snapshot {0}")]
    DividendsAlreadyClaimed(u64),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module {name} failed: {reason}")]
    ModuleFailed { name: String, reason: String },

    #[error("No bridge address configured")]
    BridgeNotConfigured,

    #[error("Arithmetic overflow")]
    Overflow,
}

/// Frozen copy of the balance map, never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub taken_at: DateTime<Utc>,
    pub balances: HashMap<Address, Amount>,
    /// Sum of `balances`
    pub total_supply: Amount,
}

impl Snapshot {
    pub fn balance_of(&self, holder: &Address) -> Amount {
        self.balances.get(holder).copied().unwrap_or(0)
    }
}

/// Dividend pool funded against a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DividendPool {
    pub funder: Address,
    pub amount: Amount,
    pub claimed: bool,
}

/// Registration record of an extension module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub address: Address,
    pub description: String,
}

/// Executable behaviour behind a registered module
pub trait ModuleHandler: Send + Sync {
    fn call(&self, module: &ModuleInfo, payload: &[u8]) -> Result<Vec<u8>, String>;
}

#[derive(Clone)]
struct ModuleEntry {
    info: ModuleInfo,
    handler: Option<Arc<dyn ModuleHandler>>,
    calls: u64,
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("info", &self.info)
            .field("bound", &self.handler.is_some())
            .field("calls", &self.calls)
            .finish()
    }
}

/// Record of an amount locked at the bridge address for another chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTransfer {
    pub from: Address,
    pub target_chain: String,
    pub to: String,
    pub amount: Amount,
}

/// A fungible token: balances, allowances, KYC flags, snapshots, dividends and modules
#[derive(Debug, Clone)]
pub struct TokenContract {
    name: String,
    symbol: String,
    decimals: u8,
    total_supply: Amount,
    owner: Address,
    balances: HashMap<Address, Amount>,
    allowances: HashMap<Address, HashMap<Address, Amount>>,
    kyc: HashSet<Address>,
    require_kyc: bool,
    bridge_address: Option<Address>,
    bridge_transfers: Vec<BridgeTransfer>,
    snapshots: BTreeMap<u64, Arc<Snapshot>>,
    next_snapshot_id: u64,
    dividends: HashMap<u64, DividendPool>,
    modules: HashMap<String, ModuleEntry>,
}

impl TokenContract {
    /// Creates a token whose entire supply belongs to `owner`
    pub fn new(
        name: &str,
        symbol: &str,
        decimals: u8,
        total_supply: Amount,
        owner: Address,
        bridge_address: Option<Address>,
    ) -> Self {
        let mut balances = HashMap::new();
        if total_supply > 0 {
            balances.insert(owner.clone(), total_supply);
        }

        TokenContract {
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals,
            total_supply,
            owner,
            balances,
            allowances: HashMap::new(),
            kyc: HashSet::new(),
            require_kyc: false,
            bridge_address,
            bridge_transfers: Vec::new(),
            snapshots: BTreeMap::new(),
            next_snapshot_id: 1,
            dividends: HashMap::new(),
            modules: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    pub fn owner(&self) -> &Address {
        &self.owner
    }

    pub fn bridge_address(&self) -> Option<&Address> {
        self.bridge_address.as_ref()
    }

    pub fn balance_of(&self, holder: &Address) -> Amount {
        self.balances.get(holder).copied().unwrap_or(0)
    }

    /// Sum of every live balance
    pub fn circulating(&self) -> Amount {
        self.balances.values().sum()
    }

    /// Sum of funded dividend pools that have not been distributed yet
    pub fn undistributed_dividends(&self) -> Amount {
        self.dividends
            .values()
            .filter(|pool| !pool.claimed)
            .map(|pool| pool.amount)
            .sum()
    }

    /// Moves `amount` from `from` to `to`
    pub fn transfer(&mut self, from: &Address, to: &Address, amount: Amount) -> Result<(), TokenError> {
        self.check_transfer(from, to, amount)?;
        self.move_balance(from, to, amount);
        Ok(())
    }

    pub fn approve(&mut self, owner: &Address, spender: &Address, amount: Amount) {
        let allowed = self.allowances.entry(owner.clone()).or_default();
        if amount == 0 {
            allowed.remove(spender);
        } else {
            allowed.insert(spender.clone(), amount);
        }
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|allowed| allowed.get(spender))
            .copied()
            .unwrap_or(0)
    }

    /// Spends `spender`'s allowance over `from` to move `amount` to `to`
    pub fn transfer_from(
        &mut self,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TokenError> {
        let allowed = self.allowance(from, spender);
        if allowed < amount {
            return Err(TokenError::AllowanceExceeded {
                requested: amount,
                allowed,
            });
        }
        self.check_transfer(from, to, amount)?;

        self.approve(from, spender, allowed - amount);
        self.move_balance(from, to, amount);
        Ok(())
    }

    /// Locks `amount` at the bridge address; no finality or proofs are involved
    pub fn cross_chain_transfer(
        &mut self,
        from: &Address,
        target_chain: &str,
        to: &str,
        amount: Amount,
    ) -> Result<BridgeTransfer, TokenError> {
        let bridge = self
            .bridge_address
            .clone()
            .ok_or(TokenError::BridgeNotConfigured)?;
        self.transfer(from, &bridge, amount)?;

        let record = BridgeTransfer {
            from: from.clone(),
            target_chain: target_chain.to_string(),
            to: to.to_string(),
            amount,
        };
        self.bridge_transfers.push(record.clone());
        Ok(record)
    }

    pub fn bridge_transfers(&self) -> &[BridgeTransfer] {
        &self.bridge_transfers
    }

    pub fn set_kyc_status(&mut self, user: &Address, passed: bool) {
        if passed {
            self.kyc.insert(user.clone());
        } else {
            self.kyc.remove(user);
        }
    }

    pub fn is_kyc_passed(&self, user: &Address) -> bool {
        self.kyc.contains(user)
    }

    /// When set, both parties of a transfer must have passed KYC
    pub fn set_require_kyc(&mut self, required: bool) {
        self.require_kyc = required;
    }

    pub fn requires_kyc(&self) -> bool {
        self.require_kyc
    }

    /// Freezes the current balances under a new id and returns it
    pub fn snapshot(&mut self) -> u64 {
        let id = self.next_snapshot_id;
        self.next_snapshot_id += 1;

        let snapshot = Snapshot {
            id,
            taken_at: Utc::now(),
            total_supply: self.circulating(),
            balances: self.balances.clone(),
        };
        self.snapshots.insert(id, Arc::new(snapshot));
        id
    }

    pub fn get_snapshot(&self, id: u64) -> Option<Arc<Snapshot>> {
        self.snapshots.get(&id).cloned()
    }

    pub fn get_snapshot_balance(&self, user: &Address, id: u64) -> Result<Amount, TokenError> {
        self.snapshots
            .get(&id)
            .map(|snapshot| snapshot.balance_of(user))
            .ok_or(TokenError::SnapshotNotFound(id))
    }

    /// Moves `amount` from `funder` into the dividend pool of snapshot `id`
    pub fn set_dividend_pool(&mut self, funder: &Address, id: u64, amount: Amount) -> Result<(), TokenError> {
        if !self.snapshots.contains_key(&id) {
            return Err(TokenError::SnapshotNotFound(id));
        }
        if self.dividends.contains_key(&id) {
            return Err(TokenError::DividendPoolAlreadySet(id));
        }
        if amount == 0 {
            return Err(TokenError::InvalidAmount);
        }

        let available = self.balance_of(funder);
        if available < amount {
            return Err(TokenError::InsufficientBalance {
                required: amount,
                available,
            });
        }

        self.set_balance(funder, available - amount);
        self.dividends.insert(
            id,
            DividendPool {
                funder: funder.clone(),
                amount,
                claimed: false,
            },
        );
        Ok(())
    }

    pub fn dividend_pool(&self, id: u64) -> Option<&DividendPool> {
        self.dividends.get(&id)
    }

    /// Pays every holder of snapshot `id` its pro-rata share of the pool
    ///
    /// Shares use integer division; the remainder returns to the funder.
    /// Returns the payouts, ordered by address.
    pub fn claim_dividends(&mut self, id: u64) -> Result<Vec<(Address, Amount)>, TokenError> {
        let snapshot = self
            .snapshots
            .get(&id)
            .cloned()
            .ok_or(TokenError::SnapshotNotFound(id))?;
        let pool = self
            .dividends
            .get(&id)
            .cloned()
            .ok_or(TokenError::DividendPoolNotSet(id))?;
        if pool.claimed {
            return Err(TokenError::DividendsAlreadyClaimed(id));
        }

        let mut holders: Vec<(&Address, &Amount)> = snapshot.balances.iter().collect();
        holders.sort();

        let mut payouts = Vec::with_capacity(holders.len());
        let mut distributed: Amount = 0;
        if snapshot.total_supply > 0 {
            for (holder, balance) in holders {
                let share = balance
                    .checked_mul(pool.amount)
                    .ok_or(TokenError::Overflow)?
                    / snapshot.total_supply;
                if share > 0 {
                    distributed += share;
                    payouts.push((holder.clone(), share));
                }
            }
        }

        // Everything was computed up front; the writes below cannot fail
        for (holder, share) in &payouts {
            let balance = self.balance_of(holder);
            self.set_balance(holder, balance + share);
        }
        let remainder = pool.amount - distributed;
        if remainder > 0 {
            let balance = self.balance_of(&pool.funder);
            self.set_balance(&pool.funder, balance + remainder);
        }
        if let Some(pool) = self.dividends.get_mut(&id) {
            pool.claimed = true;
        }

        Ok(payouts)
    }

    /// Registers (or replaces) a module; any bound handler is dropped
    pub fn register_module(&mut self, name: &str, address: Address, description: &str) {
        self.modules.insert(
            name.to_string(),
            ModuleEntry {
                info: ModuleInfo {
                    name: name.to_string(),
                    address,
                    description: description.to_string(),
                },
                handler: None,
                calls: 0,
            },
        );
    }

    pub fn bind_module_handler(
        &mut self,
        name: &str,
        handler: Arc<dyn ModuleHandler>,
    ) -> Result<(), TokenError> {
        let entry = self
            .modules
            .get_mut(name)
            .ok_or_else(|| TokenError::ModuleNotFound(name.to_string()))?;
        entry.handler = Some(handler);
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.get(name).map(|entry| &entry.info)
    }

    /// Invokes a module. Without a bound handler the call is acknowledged.
    pub fn module_call(&mut self, name: &str, payload: &[u8]) -> Result<Vec<u8>, TokenError> {
        let entry = self
            .modules
            .get_mut(name)
            .ok_or_else(|| TokenError::ModuleNotFound(name.to_string()))?;

        let output = match &entry.handler {
            Some(handler) => handler
                .call(&entry.info, payload)
                .map_err(|reason| TokenError::ModuleFailed {
                    name: name.to_string(),
                    reason,
                })?,
            None => format!("ack:{}:{}", entry.info.address, entry.calls + 1).into_bytes(),
        };

        entry.calls += 1;
        Ok(output)
    }

    fn check_transfer(&self, from: &Address, to: &Address, amount: Amount) -> Result<(), TokenError> {
        if amount == 0 {
            return Err(TokenError::InvalidAmount);
        }

        if self.require_kyc {
            for party in [from, to] {
                if !self.is_kyc_passed(party) {
                    return Err(TokenError::KycRequired(party.clone()));
                }
            }
        }

        let available = self.balance_of(from);
        if available < amount {
            return Err(TokenError::InsufficientBalance {
                required: amount,
                available,
            });
        }

        Ok(())
    }

    /// Caller has already checked that `from` holds `amount`
    fn move_balance(&mut self, from: &Address, to: &Address, amount: Amount) {
        if from == to {
            return;
        }
        let from_balance = self.balance_of(from);
        self.set_balance(from, from_balance - amount);
        let to_balance = self.balance_of(to);
        self.set_balance(to, to_balance + amount);
    }

    fn set_balance(&mut self, holder: &Address, amount: Amount) {
        if amount == 0 {
            self.balances.remove(holder);
        } else {
            self.balances.insert(holder.clone(), amount);
        }
    }
}
