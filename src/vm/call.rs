use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::standard::{Capability, TokenStandard};
use super::VmError;
use crate::blockchain::{Address, Amount};

/// Gas charged for deploying a contract
pub const DEPLOY_GAS: u64 = 100_000;

/// Parameters of a contract deployment, carried serde_json-encoded in a deploy transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployPayload {
    /// Token standard name, e.g. `erc20` or `gndst1`
    pub standard: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_contract_version")]
    pub version: String,
    pub bytecode: Vec<u8>,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: Amount,
    #[serde(default)]
    pub bridge_address: Option<Address>,
}

fn default_contract_version() -> String {
    "1.0.0".to_string()
}

/// A structured contract method invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractCall {
    BalanceOf { owner: Address },
    TotalSupply,
    Metadata,
    Transfer { to: Address, amount: Amount },
    Approve { spender: Address, amount: Amount },
    Allowance { owner: Address, spender: Address },
    TransferFrom { from: Address, to: Address, amount: Amount },
    SetKycStatus { user: Address, passed: bool },
    SetRequireKyc { required: bool },
    IsKycPassed { user: Address },
    Snapshot,
    GetSnapshotBalance { user: Address, snapshot_id: u64 },
    SetDividendPool { snapshot_id: u64, amount: Amount },
    ClaimDividends { snapshot_id: u64 },
    CrossChainTransfer { target_chain: String, to: String, amount: Amount },
    RegisterModule { name: String, address: Address, description: String },
    ModuleCall { name: String, payload: Vec<u8> },
}

impl ContractCall {
    pub fn method(&self) -> &'static str {
        match self {
            ContractCall::BalanceOf { .. } => "balance_of",
            ContractCall::TotalSupply => "total_supply",
            ContractCall::Metadata => "metadata",
            ContractCall::Transfer { .. } => "transfer",
            ContractCall::Approve { .. } => "approve",
            ContractCall::Allowance { .. } => "allowance",
            ContractCall::TransferFrom { .. } => "transfer_from",
            ContractCall::SetKycStatus { .. } => "set_kyc_status",
            ContractCall::SetRequireKyc { .. } => "set_require_kyc",
            ContractCall::IsKycPassed { .. } => "is_kyc_passed",
            ContractCall::Snapshot => "snapshot",
            ContractCall::GetSnapshotBalance { .. } => "get_snapshot_balance",
            ContractCall::SetDividendPool { .. } => "set_dividend_pool",
            ContractCall::ClaimDividends { .. } => "claim_dividends",
            ContractCall::CrossChainTransfer { .. } => "cross_chain_transfer",
            ContractCall::RegisterModule { .. } => "register_module",
            ContractCall::ModuleCall { .. } => "module_call",
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            ContractCall::BalanceOf { .. }
            | ContractCall::TotalSupply
            | ContractCall::Metadata
            | ContractCall::Transfer { .. }
            | ContractCall::Approve { .. }
            | ContractCall::Allowance { .. }
            | ContractCall::TransferFrom { .. } => Capability::Core,
            ContractCall::SetKycStatus { .. }
            | ContractCall::SetRequireKyc { .. }
            | ContractCall::IsKycPassed { .. } => Capability::Kyc,
            ContractCall::Snapshot | ContractCall::GetSnapshotBalance { .. } => {
                Capability::Snapshots
            }
            ContractCall::SetDividendPool { .. } | ContractCall::ClaimDividends { .. } => {
                Capability::Dividends
            }
            ContractCall::CrossChainTransfer { .. } => Capability::CrossChain,
            ContractCall::RegisterModule { .. } | ContractCall::ModuleCall { .. } => {
                Capability::Modules
            }
        }
    }

    /// Methods only the contract owner may invoke
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            ContractCall::SetKycStatus { .. }
                | ContractCall::SetRequireKyc { .. }
                | ContractCall::Snapshot
                | ContractCall::SetDividendPool { .. }
                | ContractCall::RegisterModule { .. }
        )
    }

    /// Intrinsic gas cost of the method
    pub fn gas_cost(&self) -> u64 {
        match self {
            ContractCall::BalanceOf { .. }
            | ContractCall::TotalSupply
            | ContractCall::Metadata
            | ContractCall::Allowance { .. }
            | ContractCall::IsKycPassed { .. }
            | ContractCall::GetSnapshotBalance { .. } => 5_000,
            ContractCall::SetKycStatus { .. } | ContractCall::SetRequireKyc { .. } => 20_000,
            ContractCall::Approve { .. } => 25_000,
            ContractCall::ModuleCall { .. } => 25_000,
            ContractCall::Transfer { .. } => 30_000,
            ContractCall::RegisterModule { .. } => 30_000,
            ContractCall::TransferFrom { .. } => 40_000,
            ContractCall::SetDividendPool { .. } => 40_000,
            ContractCall::Snapshot => 50_000,
            ContractCall::CrossChainTransfer { .. } => 50_000,
            ContractCall::ClaimDividends { .. } => 80_000,
        }
    }

    pub fn is_supported_by(&self, standard: TokenStandard) -> bool {
        standard.supports(self.capability())
    }

    pub fn encode(&self) -> Result<Vec<u8>, VmError> {
        encode_payload(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, VmError> {
        decode_payload(data)
    }
}

impl DeployPayload {
    pub fn encode(&self) -> Result<Vec<u8>, VmError> {
        encode_payload(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, VmError> {
        decode_payload(data)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, VmError> {
    serde_json::to_vec(value).map_err(|e| VmError::ArgumentTypeMismatch(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T, VmError> {
    serde_json::from_slice(data).map_err(|e| VmError::ArgumentTypeMismatch(e.to_string()))
}
