use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::crypto::{
    public_key_from_bytes, verify_signature, Address, CryptoError, DigitalSignature, Wallet,
};
use super::Amount;
use crate::signer::{Signer, SignerError};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Transaction not signed")]
    NotSigned,

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Invalid recipient address: {0}")]
    InvalidRecipientAddress(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch { stored: String, computed: String },

    #[error("Mint transactions are only valid in the genesis block")]
    MintOutsideGenesis,

    #[error("Arithmetic overflow computing transaction cost")]
    Overflow,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Signer error: {0}")]
    SignerError(#[from] SignerError),
}

/// What a transaction does once applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Transfer,
    ContractDeploy,
    ContractCall,
    /// Genesis allocation from the system address
    Mint,
}

impl TransactionKind {
    fn tag(&self) -> &'static str {
        match self {
            TransactionKind::Transfer => "transfer",
            TransactionKind::ContractDeploy => "contract_deploy",
            TransactionKind::ContractCall => "contract_call",
            TransactionKind::Mint => "mint",
        }
    }
}

/// Signature attached to a transaction together with the signing public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    /// Hex-encoded ed25519 public key
    pub public_key: String,

    pub signature: DigitalSignature,
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Version of the transaction structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Digest of every field except the signature
    pub hash: String,

    /// Sender's address
    pub from: Address,

    /// Recipient's address (a contract address for contract calls)
    pub to: Address,

    /// Amount being transferred
    pub value: Amount,

    pub gas_price: Amount,

    pub gas_limit: u64,

    /// Nonce to prevent replay attacks
    pub nonce: u64,

    /// Free-form payload; bytecode/deploy payload or call data for contract kinds
    #[serde(default)]
    pub data: Vec<u8>,

    pub kind: TransactionKind,

    #[serde(default)]
    pub signature: Option<TransactionSignature>,
}

/// Default version for transactions
fn default_version() -> u32 {
    1
}

impl Transaction {
    /// Creates a new unsigned transaction with zero gas and empty data
    pub fn new(kind: TransactionKind, from: Address, to: Address, value: Amount, nonce: u64) -> Self {
        let mut transaction = Transaction {
            version: default_version(),
            hash: String::new(),
            from,
            to,
            value,
            gas_price: 0,
            gas_limit: 0,
            nonce,
            data: Vec::new(),
            kind,
            signature: None,
        };
        transaction.hash = transaction.compute_hash();
        transaction
    }

    /// Creates a native-coin transfer
    pub fn transfer(
        from: Address,
        to: Address,
        value: Amount,
        gas_price: Amount,
        gas_limit: u64,
        nonce: u64,
    ) -> Self {
        Self::new(TransactionKind::Transfer, from, to, value, nonce).with_gas(gas_price, gas_limit)
    }

    /// Creates a contract deployment carrying an encoded deploy payload
    pub fn deploy(
        from: Address,
        payload: Vec<u8>,
        gas_price: Amount,
        gas_limit: u64,
        nonce: u64,
    ) -> Self {
        // The contract address is derived at execution time; `to` stays the sender
        let to = from.clone();
        Self::new(TransactionKind::ContractDeploy, from, to, 0, nonce)
            .with_gas(gas_price, gas_limit)
            .with_data(payload)
    }

    /// Creates a call into a deployed contract
    pub fn call(
        from: Address,
        contract: Address,
        call_data: Vec<u8>,
        gas_price: Amount,
        gas_limit: u64,
        nonce: u64,
    ) -> Self {
        Self::new(TransactionKind::ContractCall, from, contract, 0, nonce)
            .with_gas(gas_price, gas_limit)
            .with_data(call_data)
    }

    /// Creates a genesis allocation (the node's coinbase)
    pub fn mint(to: Address, value: Amount) -> Self {
        Self::new(TransactionKind::Mint, Address::system(), to, value, 0).with_gas(0, 1)
    }

    pub fn with_gas(mut self, gas_price: Amount, gas_limit: u64) -> Self {
        self.gas_price = gas_price;
        self.gas_limit = gas_limit;
        self.hash = self.compute_hash();
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self.hash = self.compute_hash();
        self
    }

    /// Computes the hash over every field except the signature, in a fixed order
    pub fn compute_hash(&self) -> String {
        hex::encode(self.hash_bytes())
    }

    fn hash_bytes(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        update_with_str(&mut hasher, self.from.as_str());
        update_with_str(&mut hasher, self.to.as_str());
        hasher.update(self.value.to_le_bytes());
        hasher.update(self.gas_price.to_le_bytes());
        hasher.update(self.gas_limit.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.update((self.data.len() as u64).to_le_bytes());
        hasher.update(&self.data);
        update_with_str(&mut hasher, self.kind.tag());
        hasher.finalize().into()
    }

    /// Signs the transaction with a wallet
    pub fn sign(&mut self, wallet: &Wallet) -> Result<(), TransactionError> {
        self.ensure_signable(wallet.address())?;

        let signature = wallet.sign(&self.hash_bytes());
        self.signature = Some(TransactionSignature {
            public_key: hex::encode(wallet.public_key().as_bytes()),
            signature,
        });

        Ok(())
    }

    /// Signs the transaction through a signing collaborator holding the key
    pub async fn sign_with(
        &mut self,
        signer: &dyn Signer,
        wallet_id: Uuid,
    ) -> Result<(), TransactionError> {
        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        let public_key = signer.public_key(wallet_id).await?;
        let verifying_key = public_key_from_bytes(&public_key)?;
        self.ensure_signable(&Address::from_public_key(&verifying_key))?;

        let signature = signer.sign_digest(wallet_id, &self.hash_bytes()).await?;
        self.signature = Some(TransactionSignature {
            public_key: hex::encode(public_key),
            signature: DigitalSignature::from_bytes(&signature),
        });

        Ok(())
    }

    fn ensure_signable(&self, signer_address: &Address) -> Result<(), TransactionError> {
        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        if signer_address != &self.from {
            return Err(TransactionError::InvalidSenderAddress(
                "Signer address does not match sender address".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks that the stored hash is current and that the sender signed it
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        self.verify_hash()?;

        let signature = self.signature.as_ref().ok_or(TransactionError::NotSigned)?;

        let key_bytes = hex::decode(&signature.public_key)
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;
        let public_key = public_key_from_bytes(&key_bytes)?;

        if Address::from_public_key(&public_key) != self.from {
            return Err(TransactionError::InvalidSenderAddress(
                "Public key does not derive the sender address".to_string(),
            ));
        }

        if !verify_signature(&self.hash_bytes(), &signature.signature, &public_key)? {
            return Err(TransactionError::InvalidSignature);
        }

        Ok(())
    }

    pub fn verify_hash(&self) -> Result<(), TransactionError> {
        let computed = self.compute_hash();
        if computed != self.hash {
            return Err(TransactionError::HashMismatch {
                stored: self.hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Structural checks that do not depend on ledger state
    pub fn validate_fields(&self) -> Result<(), TransactionError> {
        if self.gas_limit == 0 {
            return Err(TransactionError::InvalidField(
                "gas limit must be greater than 0".to_string(),
            ));
        }

        match self.kind {
            TransactionKind::Mint => {
                if !self.from.is_system() {
                    return Err(TransactionError::InvalidSenderAddress(self.from.to_string()));
                }
            }
            _ => {
                if self.gas_price == 0 {
                    return Err(TransactionError::InvalidField(
                        "gas price must be greater than 0".to_string(),
                    ));
                }
                if !self.from.is_account() {
                    return Err(TransactionError::InvalidSenderAddress(self.from.to_string()));
                }
            }
        }

        match self.kind {
            TransactionKind::ContractDeploy if self.data.is_empty() => {
                Err(TransactionError::InvalidField("deploy payload is empty".to_string()))
            }
            TransactionKind::ContractCall if !self.to.is_contract() => {
                Err(TransactionError::InvalidRecipientAddress(self.to.to_string()))
            }
            _ if !self.to.is_well_formed() => {
                Err(TransactionError::InvalidRecipientAddress(self.to.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Fee reserved by the transaction: `gas_price * gas_limit`
    pub fn fee(&self) -> Result<Amount, TransactionError> {
        self.gas_price
            .checked_mul(Amount::from(self.gas_limit))
            .ok_or(TransactionError::Overflow)
    }

    /// Gets the total amount required for the transaction (value + fee)
    pub fn total_cost(&self) -> Result<Amount, TransactionError> {
        self.value
            .checked_add(self.fee()?)
            .ok_or(TransactionError::Overflow)
    }

    pub fn is_mint(&self) -> bool {
        self.kind == TransactionKind::Mint
    }

    pub fn is_contract(&self) -> bool {
        matches!(
            self.kind,
            TransactionKind::ContractDeploy | TransactionKind::ContractCall
        )
    }
}

fn update_with_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}
