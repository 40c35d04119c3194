use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tokio::sync::broadcast;

use std::collections::HashMap;
use std::sync::Arc;

use super::call::{ContractCall, DeployPayload, DEPLOY_GAS};
use super::events::{ContractEvent, EventBus};
use super::standard::TokenStandard;
use super::token::{ModuleHandler, TokenContract};
use super::{ContractVm, VmError};
use crate::blockchain::{Address, AddressCodec, Amount, LedgerState, Transaction, TransactionKind};

/// Default per-transaction gas ceiling
pub const DEFAULT_MAX_CALL_GAS: u64 = 10_000_000;

/// Descriptive metadata recorded at deploy time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMeta {
    pub standard: TokenStandard,
    pub owner: Address,
    pub description: String,
    pub version: String,
}

/// Summary returned by the `metadata` method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: Amount,
    pub owner: Address,
    pub standard: TokenStandard,
}

/// Value produced by a contract method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallValue {
    None,
    Bool(bool),
    Amount(Amount),
    Address(Address),
    SnapshotId(u64),
    Metadata(TokenMetadata),
    Bytes(Vec<u8>),
    Payouts(Vec<(Address, Amount)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Intrinsic gas of the executed method
    pub gas_used: u64,
    pub value: CallValue,
    pub events: Vec<ContractEvent>,
}

/// A deployed contract. Its storage is serialized by its own lock.
#[derive(Debug)]
pub struct Contract {
    pub address: Address,
    pub meta: ContractMeta,
    pub bytecode: Vec<u8>,
    pub deployed_at: DateTime<Utc>,
    storage: RwLock<TokenContract>,
}

impl Contract {
    /// Runs `f` against a read guard of the contract storage
    pub fn read<R>(&self, f: impl FnOnce(&TokenContract) -> R) -> R {
        f(&self.storage.read())
    }

    pub fn metadata(&self) -> TokenMetadata {
        metadata_of(&self.meta, &self.storage.read())
    }
}

fn metadata_of(meta: &ContractMeta, token: &TokenContract) -> TokenMetadata {
    TokenMetadata {
        name: token.name().to_string(),
        symbol: token.symbol().to_string(),
        decimals: token.decimals(),
        total_supply: token.total_supply(),
        owner: token.owner().clone(),
        standard: meta.standard,
    }
}

#[derive(Debug, Default)]
struct Registry {
    contracts: HashMap<Address, Arc<Contract>>,
    /// Upper-cased symbol to contract address
    symbols: HashMap<String, Address>,
}

/// Fee ledger, contract registry and method dispatch
///
/// Sender nonces live in the shared [`LedgerState`], so contract and transfer
/// transactions of one sender draw from a single sequence.
///
/// Lock order is fee ledger before registry on deploy, and contract storage
/// before fee ledger on calls. Neither path takes the other's first lock
/// while holding its second. The ledger lock is never held together with
/// either.
#[derive(Debug)]
pub struct ExecutionEngine {
    ledger: Arc<LedgerState>,
    fee_ledger: RwLock<HashMap<Address, Amount>>,
    registry: RwLock<Registry>,
    events: EventBus,
    max_call_gas: u64,
}

impl ExecutionEngine {
    pub fn new(ledger: Arc<LedgerState>, max_call_gas: u64) -> Self {
        ExecutionEngine {
            ledger,
            fee_ledger: RwLock::new(HashMap::new()),
            registry: RwLock::new(Registry::default()),
            events: EventBus::default(),
            max_call_gas,
        }
    }

    /// Ledger holding the sender nonces
    pub fn ledger(&self) -> Arc<LedgerState> {
        self.ledger.clone()
    }

    /// Receives every event of every successful deploy and call from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ContractEvent> {
        self.events.subscribe()
    }

    pub fn max_call_gas(&self) -> u64 {
        self.max_call_gas
    }

    /// Fee-ledger balance of `address`
    pub fn get_balance(&self, address: &Address) -> Amount {
        self.fee_ledger.read().get(address).copied().unwrap_or(0)
    }

    /// Funds the fee ledger of `address`
    pub fn credit_fee_balance(&self, address: &Address, amount: Amount) -> Result<(), VmError> {
        if amount == 0 {
            return Err(VmError::InvalidAmount("Amount must be positive".to_string()));
        }

        let mut fees = self.fee_ledger.write();
        let balance = fees.entry(address.clone()).or_insert(0);
        *balance = balance.checked_add(amount).ok_or(VmError::Overflow)?;
        Ok(())
    }

    pub fn contract(&self, address: &Address) -> Option<Arc<Contract>> {
        self.registry.read().contracts.get(address).cloned()
    }

    pub fn contract_by_symbol(&self, symbol: &str) -> Option<Arc<Contract>> {
        let registry = self.registry.read();
        registry
            .symbols
            .get(&symbol.to_ascii_uppercase())
            .and_then(|address| registry.contracts.get(address))
            .cloned()
    }

    pub fn contracts(&self) -> Vec<Arc<Contract>> {
        self.registry.read().contracts.values().cloned().collect()
    }

    /// Executes a deploy or call transaction
    pub fn execute(&self, transaction: &Transaction) -> Result<ExecutionResult, VmError> {
        match transaction.kind {
            TransactionKind::ContractDeploy => self.deploy(transaction),
            TransactionKind::ContractCall => self.call(transaction),
            _ => Err(VmError::NotContractTransaction(transaction.hash.clone())),
        }
    }

    /// Deploys a token contract
    ///
    /// The sender nonce is consumed as soon as the signature checks out and
    /// stays consumed if the deploy then fails. The fee check, the
    /// registration and the fee debit happen under the fee-ledger write lock,
    /// so a rejected registration charges nothing.
    pub fn deploy(&self, transaction: &Transaction) -> Result<ExecutionResult, VmError> {
        if transaction.kind != TransactionKind::ContractDeploy {
            return Err(VmError::NotContractTransaction(transaction.hash.clone()));
        }
        transaction.validate_fields()?;
        transaction.verify_signature()?;
        self.ledger
            .consume_nonce(&transaction.from, transaction.nonce)?;
        self.check_gas_limit(transaction.gas_limit, DEPLOY_GAS)?;

        let payload = DeployPayload::decode(&transaction.data)?;
        let standard: TokenStandard = payload.standard.parse()?;
        if payload.symbol.trim().is_empty() || payload.bytecode.is_empty() {
            return Err(VmError::ArgumentTypeMismatch(
                "symbol and bytecode must not be empty".to_string(),
            ));
        }

        let fee = transaction.fee()?;
        let from = &transaction.from;
        let address = AddressCodec::contract_address(&payload.bytecode, transaction.nonce);
        let symbol_key = payload.symbol.to_ascii_uppercase();

        let mut fees = self.fee_ledger.write();
        let available = fees.get(from).copied().unwrap_or(0);
        if available < fee {
            return Err(VmError::InsufficientGas(format!(
                "fee {} exceeds fee balance {}",
                fee, available
            )));
        }

        {
            let mut registry = self.registry.write();
            if registry.contracts.contains_key(&address) {
                return Err(VmError::TokenAlreadyRegistered(address.to_string()));
            }
            if registry.symbols.contains_key(&symbol_key) {
                return Err(VmError::TokenAlreadyRegistered(payload.symbol.clone()));
            }

            let token = TokenContract::new(
                &payload.name,
                &payload.symbol,
                payload.decimals,
                payload.total_supply,
                from.clone(),
                payload.bridge_address.clone(),
            );
            let contract = Contract {
                address: address.clone(),
                meta: ContractMeta {
                    standard,
                    owner: from.clone(),
                    description: payload.description.clone(),
                    version: payload.version.clone(),
                },
                bytecode: payload.bytecode.clone(),
                deployed_at: Utc::now(),
                storage: RwLock::new(token),
            };

            registry.symbols.insert(symbol_key, address.clone());
            registry.contracts.insert(address.clone(), Arc::new(contract));
        }

        if fee > 0 {
            fees.insert(from.clone(), available - fee);
        }
        drop(fees);

        info!(
            "Deployed {} contract {} ({}) owned by {}",
            standard, address, payload.symbol, from
        );

        let events = vec![ContractEvent::Deployed {
            contract: address.clone(),
            owner: from.clone(),
            standard,
            symbol: payload.symbol,
        }];
        self.events.publish(&events);

        Ok(ExecutionResult {
            gas_used: DEPLOY_GAS,
            value: CallValue::Address(address),
            events,
        })
    }

    /// Executes a contract call carried by a transaction
    ///
    /// The sender nonce is consumed as soon as the signature checks out, so a
    /// signed call runs at most once. The method runs under the contract's
    /// storage lock with the fee ledger locked; the fee is debited only after
    /// the method succeeds.
    pub fn call(&self, transaction: &Transaction) -> Result<ExecutionResult, VmError> {
        if transaction.kind != TransactionKind::ContractCall {
            return Err(VmError::NotContractTransaction(transaction.hash.clone()));
        }
        transaction.validate_fields()?;
        transaction.verify_signature()?;
        self.ledger
            .consume_nonce(&transaction.from, transaction.nonce)?;

        let call = ContractCall::decode(&transaction.data)?;
        let gas_used = call.gas_cost();
        self.check_gas_limit(transaction.gas_limit, gas_used)?;

        let fee = transaction.fee()?;
        let from = &transaction.from;
        let contract = self.admitted_contract(from, &transaction.to, &call)?;

        let mut storage = contract.storage.write();
        let mut fees = self.fee_ledger.write();

        let available = fees.get(from).copied().unwrap_or(0);
        if available < fee {
            return Err(VmError::InsufficientGas(format!(
                "fee {} exceeds fee balance {}",
                fee, available
            )));
        }

        let mut events = Vec::new();
        let value = dispatch(&mut storage, &contract, from, &call, &mut events)?;

        if fee > 0 {
            fees.insert(from.clone(), available - fee);
        }
        drop(fees);
        drop(storage);

        debug!(
            "Executed {} on {} for {} (gas {})",
            call.method(),
            contract.address,
            from,
            gas_used
        );

        self.events.publish(&events);

        Ok(ExecutionResult {
            gas_used,
            value,
            events,
        })
    }

    /// Simulates a call against a copy of the contract storage; nothing is persisted or charged
    pub fn call_static(
        &self,
        from: &Address,
        to: &Address,
        call: &ContractCall,
    ) -> Result<CallValue, VmError> {
        let contract = self.admitted_contract(from, to, call)?;
        let mut scratch = contract.storage.read().clone();
        dispatch(&mut scratch, &contract, from, call, &mut Vec::new())
    }

    /// Attaches executable behaviour to a module registered on `contract`
    pub fn bind_module_handler(
        &self,
        contract: &Address,
        name: &str,
        handler: Arc<dyn ModuleHandler>,
    ) -> Result<(), VmError> {
        let contract = self
            .contract(contract)
            .ok_or_else(|| VmError::ContractNotFound(contract.to_string()))?;
        let mut storage = contract.storage.write();
        storage.bind_module_handler(name, handler)?;
        Ok(())
    }

    fn check_gas_limit(&self, gas_limit: u64, required: u64) -> Result<(), VmError> {
        if gas_limit > self.max_call_gas {
            return Err(VmError::GasLimitExceeded {
                limit: gas_limit,
                max: self.max_call_gas,
            });
        }
        if gas_limit < required {
            return Err(VmError::InsufficientGas(format!(
                "gas limit {} below required {}",
                gas_limit, required
            )));
        }
        Ok(())
    }

    /// Looks up the target and checks the method against its standard and owner
    fn admitted_contract(
        &self,
        from: &Address,
        to: &Address,
        call: &ContractCall,
    ) -> Result<Arc<Contract>, VmError> {
        let contract = self
            .contract(to)
            .ok_or_else(|| VmError::ContractNotFound(to.to_string()))?;

        if !call.is_supported_by(contract.meta.standard) {
            return Err(VmError::MethodNotSupported {
                standard: contract.meta.standard.to_string(),
                method: call.method().to_string(),
            });
        }

        if call.is_admin() && from != &contract.meta.owner {
            return Err(VmError::Unauthorized(format!(
                "{} may only be called by the contract owner",
                call.method()
            )));
        }

        Ok(contract)
    }
}

impl ContractVm for ExecutionEngine {
    fn deploy_contract(&self, transaction: &Transaction) -> Result<Address, VmError> {
        match self.deploy(transaction)?.value {
            CallValue::Address(address) => Ok(address),
            other => Err(VmError::ArgumentTypeMismatch(format!(
                "deploy returned {:?}",
                other
            ))),
        }
    }

    fn call_contract(&self, transaction: &Transaction) -> Result<ExecutionResult, VmError> {
        self.call(transaction)
    }

    fn get_balance(&self, address: &Address) -> Amount {
        ExecutionEngine::get_balance(self, address)
    }
}

/// Routes a call to the token method it names. `from` is the message sender.
///
/// Events of a successful state change are appended to `events`.
fn dispatch(
    token: &mut TokenContract,
    contract: &Contract,
    from: &Address,
    call: &ContractCall,
    events: &mut Vec<ContractEvent>,
) -> Result<CallValue, VmError> {
    let address = &contract.address;
    let value = match call {
        ContractCall::BalanceOf { owner } => CallValue::Amount(token.balance_of(owner)),
        ContractCall::TotalSupply => CallValue::Amount(token.total_supply()),
        ContractCall::Metadata => CallValue::Metadata(metadata_of(&contract.meta, token)),
        ContractCall::Transfer { to, amount } => {
            token.transfer(from, to, *amount)?;
            events.push(ContractEvent::Transfer {
                contract: address.clone(),
                from: from.clone(),
                to: to.clone(),
                amount: *amount,
            });
            CallValue::Bool(true)
        }
        ContractCall::Approve { spender, amount } => {
            token.approve(from, spender, *amount);
            events.push(ContractEvent::Approval {
                contract: address.clone(),
                owner: from.clone(),
                spender: spender.clone(),
                amount: *amount,
            });
            CallValue::Bool(true)
        }
        ContractCall::Allowance { owner, spender } => {
            CallValue::Amount(token.allowance(owner, spender))
        }
        ContractCall::TransferFrom {
            from: owner,
            to,
            amount,
        } => {
            token.transfer_from(from, owner, to, *amount)?;
            events.push(ContractEvent::Transfer {
                contract: address.clone(),
                from: owner.clone(),
                to: to.clone(),
                amount: *amount,
            });
            CallValue::Bool(true)
        }
        ContractCall::SetKycStatus { user, passed } => {
            token.set_kyc_status(user, *passed);
            events.push(ContractEvent::KycStatusChanged {
                contract: address.clone(),
                user: user.clone(),
                passed: *passed,
            });
            CallValue::None
        }
        ContractCall::SetRequireKyc { required } => {
            token.set_require_kyc(*required);
            CallValue::None
        }
        ContractCall::IsKycPassed { user } => CallValue::Bool(token.is_kyc_passed(user)),
        ContractCall::Snapshot => {
            let snapshot_id = token.snapshot();
            events.push(ContractEvent::SnapshotTaken {
                contract: address.clone(),
                snapshot_id,
            });
            CallValue::SnapshotId(snapshot_id)
        }
        ContractCall::GetSnapshotBalance { user, snapshot_id } => {
            CallValue::Amount(token.get_snapshot_balance(user, *snapshot_id)?)
        }
        ContractCall::SetDividendPool {
            snapshot_id,
            amount,
        } => {
            token.set_dividend_pool(from, *snapshot_id, *amount)?;
            events.push(ContractEvent::DividendPoolSet {
                contract: address.clone(),
                snapshot_id: *snapshot_id,
                amount: *amount,
            });
            CallValue::None
        }
        ContractCall::ClaimDividends { snapshot_id } => {
            let payouts = token.claim_dividends(*snapshot_id)?;
            events.extend(payouts.iter().map(|(holder, amount)| ContractEvent::DividendPaid {
                contract: address.clone(),
                snapshot_id: *snapshot_id,
                holder: holder.clone(),
                amount: *amount,
            }));
            CallValue::Payouts(payouts)
        }
        ContractCall::CrossChainTransfer {
            target_chain,
            to,
            amount,
        } => {
            let record = token.cross_chain_transfer(from, target_chain, to, *amount)?;
            let amount = record.amount;
            events.push(ContractEvent::CrossChainTransfer {
                contract: address.clone(),
                from: record.from,
                target_chain: record.target_chain,
                to: record.to,
                amount,
            });
            CallValue::Amount(amount)
        }
        ContractCall::RegisterModule {
            name,
            address: module,
            description,
        } => {
            token.register_module(name, module.clone(), description);
            events.push(ContractEvent::ModuleRegistered {
                contract: address.clone(),
                name: name.clone(),
                address: module.clone(),
            });
            CallValue::None
        }
        ContractCall::ModuleCall { name, payload } => {
            CallValue::Bytes(token.module_call(name, payload)?)
        }
    };

    Ok(value)
}
