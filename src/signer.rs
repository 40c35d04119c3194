use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::blockchain::{Address, Wallet};

/// Errors reported by a signing collaborator
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Wallet not found: {0}")]
    WalletNotFound(Uuid),

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

/// Custodial key holder. The core only ever asks it to sign digests.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Signs `digest` with the key of `wallet_id`, returning raw signature bytes
    async fn sign_digest(&self, wallet_id: Uuid, digest: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// Raw public key bytes of `wallet_id`
    async fn public_key(&self, wallet_id: Uuid) -> Result<Vec<u8>, SignerError>;
}

/// In-memory signer keyed by wallet id
#[derive(Debug, Default)]
pub struct LocalSigner {
    wallets: DashMap<Uuid, Wallet>,
}

impl LocalSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a new key and returns its id and address
    pub fn create_wallet(&self) -> (Uuid, Address) {
        self.import_wallet(Wallet::generate())
    }

    pub fn import_wallet(&self, wallet: Wallet) -> (Uuid, Address) {
        let id = Uuid::new_v4();
        let address = wallet.address().clone();
        self.wallets.insert(id, wallet);
        (id, address)
    }

    pub fn address(&self, wallet_id: Uuid) -> Option<Address> {
        self.wallets
            .get(&wallet_id)
            .map(|wallet| wallet.address().clone())
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign_digest(&self, wallet_id: Uuid, digest: &[u8]) -> Result<Vec<u8>, SignerError> {
        let wallet = self
            .wallets
            .get(&wallet_id)
            .ok_or(SignerError::WalletNotFound(wallet_id))?;

        let signature = wallet
            .sign(digest)
            .to_signature()
            .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    async fn public_key(&self, wallet_id: Uuid) -> Result<Vec<u8>, SignerError> {
        self.wallets
            .get(&wallet_id)
            .map(|wallet| wallet.public_key().as_bytes().to_vec())
            .ok_or(SignerError::WalletNotFound(wallet_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::{public_key_from_bytes, verify_signature, DigitalSignature};

    #[tokio::test]
    async fn test_sign_and_verify_digest() {
        let signer = LocalSigner::new();
        let (id, address) = signer.create_wallet();
        assert_eq!(signer.address(id), Some(address.clone()));

        let digest = [9u8; 32];
        let signature = signer.sign_digest(id, &digest).await.unwrap();
        let public_key = public_key_from_bytes(&signer.public_key(id).await.unwrap()).unwrap();

        assert_eq!(Address::from_public_key(&public_key), address);
        assert!(verify_signature(&digest, &DigitalSignature::from_bytes(&signature), &public_key).unwrap());
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let signer = LocalSigner::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            signer.sign_digest(missing, b"x").await,
            Err(SignerError::WalletNotFound(_))
        ));
        assert!(signer.public_key(missing).await.is_err());
    }
}
