use sha2::{Digest, Sha256};

use super::{ConsensusError, ProposerSelection};
use crate::blockchain::{Address, Amount};

/// Proof of stake: a deterministic stake-weighted draw per height
#[derive(Debug, Clone)]
pub struct StakeWeighted {
    /// Sorted by address so every node walks the same order
    validators: Vec<(Address, Amount)>,
    total_stake: Amount,
}

impl StakeWeighted {
    pub fn new(mut validators: Vec<(Address, Amount)>) -> Result<Self, ConsensusError> {
        validators.retain(|(_, stake)| *stake > 0);
        validators.sort();

        let total_stake = validators
            .iter()
            .try_fold(0 as Amount, |acc, (_, stake)| acc.checked_add(*stake))
            .ok_or_else(|| ConsensusError::InvalidConfig("total stake overflows".to_string()))?;
        if total_stake == 0 {
            return Err(ConsensusError::InvalidConfig(
                "total validator stake is zero".to_string(),
            ));
        }

        Ok(StakeWeighted {
            validators,
            total_stake,
        })
    }

    pub fn total_stake(&self) -> Amount {
        self.total_stake
    }

    /// Draw in `[0, total_stake)` seeded by `sha256(prev_hash || height)`
    fn draw(&self, height: u64, prev_hash: &str) -> Amount {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(height.to_le_bytes());
        let digest = hasher.finalize();

        let mut seed = [0u8; 16];
        seed.copy_from_slice(&digest[..16]);
        u128::from_le_bytes(seed) % self.total_stake
    }
}

impl ProposerSelection for StakeWeighted {
    fn kind(&self) -> &'static str {
        "pos"
    }

    fn select(&self, height: u64, prev_hash: &str) -> Option<Address> {
        let mut point = self.draw(height, prev_hash);
        for (address, stake) in &self.validators {
            if point < *stake {
                return Some(address.clone());
            }
            point -= stake;
        }
        None
    }
}
