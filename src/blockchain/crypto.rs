use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Prefix used for freshly derived account addresses
pub const DEFAULT_PREFIX: &[u8; PREFIX_LEN] = b"GND";

/// Every prefix the codec accepts when validating an account address
pub const KNOWN_PREFIXES: [&[u8; PREFIX_LEN]; 2] = [b"GND", b"GN_"];

/// Textual prefix of contract addresses
pub const CONTRACT_PREFIX: &str = "GNDct";

/// Reserved sender of genesis allocations. Never a valid account address.
pub const SYSTEM_ADDRESS: &str = "GND_SYSTEM";

const PREFIX_LEN: usize = 3;
const HASH_LEN: usize = 20;
const CHECKSUM_LEN: usize = 4;
const PAYLOAD_LEN: usize = PREFIX_LEN + HASH_LEN + CHECKSUM_LEN;
const CONTRACT_HASH_HEX_LEN: usize = 64;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Represents an account or contract address
///
/// Account addresses are `base58(prefix || ripemd160(sha256(pubkey)) || checksum)`,
/// contract addresses are `GNDct` followed by a hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Creates a new address from a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        AddressCodec::encode(public_key.as_bytes())
    }

    /// The reserved sender of genesis allocations
    pub fn system() -> Self {
        Address(SYSTEM_ADDRESS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_ADDRESS
    }

    pub fn is_contract(&self) -> bool {
        AddressCodec::validate_contract(&self.0)
    }

    pub fn is_account(&self) -> bool {
        AddressCodec::validate(&self.0)
    }

    /// True for any well-formed account or contract address
    pub fn is_well_formed(&self) -> bool {
        self.is_account() || self.is_contract()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        if !address.is_well_formed() {
            return Err(CryptoError::InvalidAddress(s.to_string()));
        }
        Ok(address)
    }
}

/// Derives and validates addresses. All functions are pure.
pub struct AddressCodec;

impl AddressCodec {
    /// Encodes a public key under the default prefix
    pub fn encode(public_key: &[u8]) -> Address {
        Self::encode_with_prefix(DEFAULT_PREFIX, public_key)
    }

    /// Encodes a public key under an explicit prefix
    pub fn encode_with_prefix(prefix: &[u8; PREFIX_LEN], public_key: &[u8]) -> Address {
        let hash = public_key_hash(public_key);

        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.extend_from_slice(prefix);
        payload.extend_from_slice(&hash);
        let checksum = checksum(&payload);
        payload.extend_from_slice(&checksum);

        Address(bs58::encode(payload).into_string())
    }

    /// Decodes an account address into its prefix and public-key hash
    pub fn decode(address: &str) -> Result<([u8; PREFIX_LEN], [u8; HASH_LEN]), CryptoError> {
        let bytes = bs58::decode(address)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        if bytes.len() != PAYLOAD_LEN {
            return Err(CryptoError::InvalidAddress(format!(
                "decoded length {} (expected {})",
                bytes.len(),
                PAYLOAD_LEN
            )));
        }

        let (payload, check) = bytes.split_at(PREFIX_LEN + HASH_LEN);
        let prefix = &payload[..PREFIX_LEN];
        if !KNOWN_PREFIXES.iter().any(|known| known.as_slice() == prefix) {
            return Err(CryptoError::InvalidAddress("unknown prefix".to_string()));
        }

        if checksum(payload).as_slice() != check {
            return Err(CryptoError::InvalidAddress("checksum mismatch".to_string()));
        }

        let mut prefix_out = [0u8; PREFIX_LEN];
        prefix_out.copy_from_slice(prefix);
        let mut hash_out = [0u8; HASH_LEN];
        hash_out.copy_from_slice(&payload[PREFIX_LEN..]);
        Ok((prefix_out, hash_out))
    }

    /// Checks that a string is a well-formed account address
    pub fn validate(address: &str) -> bool {
        Self::decode(address).is_ok()
    }

    /// Derives the deterministic address of a contract deployed with `bytecode` at `nonce`
    pub fn contract_address(bytecode: &[u8], nonce: u64) -> Address {
        let mut hasher = Sha256::new();
        hasher.update(bytecode);
        hasher.update(nonce.to_le_bytes());
        Address(format!("{}{}", CONTRACT_PREFIX, hex::encode(hasher.finalize())))
    }

    /// Checks that a string is a well-formed contract address
    pub fn validate_contract(address: &str) -> bool {
        match address.strip_prefix(CONTRACT_PREFIX) {
            Some(digest) => {
                digest.len() == CONTRACT_HASH_HEX_LEN
                    && digest
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            }
            None => false,
        }
    }
}

/// ripemd160(sha256(public_key))
fn public_key_hash(public_key: &[u8]) -> [u8; HASH_LEN] {
    let sha = Sha256::digest(public_key);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&ripe);
    out
}

/// First four bytes of sha256(sha256(payload))
fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

/// Represents a digital signature (base58 of the raw signature bytes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    /// Creates a new digital signature from a signature
    pub fn from_signature(signature: &Signature) -> Self {
        Self::from_bytes(&signature.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        DigitalSignature(bs58::encode(bytes).into_string())
    }

    /// Converts the digital signature to a signature
    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let signature_bytes: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidSignature("Invalid signature length".to_string())
        })?;

        Ok(Signature::from_bytes(&signature_bytes))
    }
}

/// Parses raw public key bytes
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey("Invalid public key length".to_string()))?;

    VerifyingKey::from_bytes(&array).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Represents a wallet with a keypair
#[derive(Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    address: Address,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish()
    }
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Self::from_signing_key(signing_key)
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes_array)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = Address::from_public_key(&verifying_key);

        Wallet {
            signing_key,
            verifying_key,
            address,
        }
    }

    /// Gets the wallet's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Gets the wallet's public key
    pub fn public_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Signs a message with the wallet's private key
    pub fn sign(&self, message: &[u8]) -> DigitalSignature {
        DigitalSignature::from_signature(&self.signing_key.sign(message))
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

/// Verifies a signature against a message and public key
pub fn verify_signature(
    message: &[u8],
    signature: &DigitalSignature,
    public_key: &VerifyingKey,
) -> Result<bool, CryptoError> {
    let signature = signature.to_signature()?;
    Ok(public_key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_address_is_valid() {
        let wallet = Wallet::generate();
        assert!(AddressCodec::validate(wallet.address().as_str()));
        assert!(wallet.address().is_account());
        assert!(!wallet.address().is_contract());
    }

    #[test]
    fn test_encode_is_deterministic() {
        let key = [7u8; 32];
        assert_eq!(AddressCodec::encode(&key), AddressCodec::encode(&key));
        assert_ne!(AddressCodec::encode(&key), AddressCodec::encode(&[8u8; 32]));
    }

    #[test]
    fn test_alternate_prefix_validates() {
        let address = AddressCodec::encode_with_prefix(b"GN_", &[1u8; 32]);
        let (prefix, _) = AddressCodec::decode(address.as_str()).unwrap();
        assert_eq!(&prefix, b"GN_");
    }

    #[test]
    fn test_unknown_prefix_rejected() {
        let address = AddressCodec::encode_with_prefix(b"XYZ", &[1u8; 32]);
        assert!(!AddressCodec::validate(address.as_str()));
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let address = AddressCodec::encode(&[3u8; 32]);
        let mut bytes = bs58::decode(address.as_str()).into_vec().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = bs58::encode(bytes).into_string();
        assert!(!AddressCodec::validate(&tampered));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let short = bs58::encode([0u8; 10]).into_string();
        assert!(!AddressCodec::validate(&short));
        assert!(!AddressCodec::validate("not base58 0OIl"));
        assert!(!AddressCodec::validate(""));
    }

    #[test]
    fn test_system_address_is_not_an_account() {
        assert!(!Address::system().is_well_formed());
        assert!(Address::system().is_system());
    }

    #[test]
    fn test_contract_address() {
        let a = AddressCodec::contract_address(b"bytecode", 0);
        let b = AddressCodec::contract_address(b"bytecode", 1);
        assert_ne!(a, b);
        assert!(a.is_contract());
        assert!(a.as_str().starts_with(CONTRACT_PREFIX));
        assert!(!AddressCodec::validate_contract("GNDctXYZ"));
    }

    #[test]
    fn test_signing_and_verification() {
        let wallet = Wallet::generate();
        let message = b"Hello, world!";

        let signature = wallet.sign(message);
        assert!(verify_signature(message, &signature, wallet.public_key()).unwrap());
        assert!(!verify_signature(b"Wrong message", &signature, wallet.public_key()).unwrap());
    }

    #[test]
    fn test_wallet_roundtrip_from_secret() {
        let wallet = Wallet::generate();
        let restored = Wallet::from_secret_key(&wallet.export_secret_key()).unwrap();
        assert_eq!(wallet.address(), restored.address());
        assert!(Wallet::from_secret_key(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_from_str() {
        let wallet = Wallet::generate();
        let parsed: Address = wallet.address().as_str().parse().unwrap();
        assert_eq!(&parsed, wallet.address());
        assert!("garbage".parse::<Address>().is_err());
    }
}
