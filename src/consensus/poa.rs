use super::{ConsensusError, ProposerSelection};
use crate::blockchain::Address;

/// Proof of authority: a fixed authority set taking turns by height
#[derive(Debug, Clone)]
pub struct AuthorityRotation {
    authorities: Vec<Address>,
}

impl AuthorityRotation {
    pub fn new(authorities: Vec<Address>) -> Result<Self, ConsensusError> {
        if authorities.is_empty() {
            return Err(ConsensusError::InvalidConfig(
                "authority set is empty".to_string(),
            ));
        }
        Ok(AuthorityRotation { authorities })
    }

    pub fn authorities(&self) -> &[Address] {
        &self.authorities
    }
}

impl ProposerSelection for AuthorityRotation {
    fn kind(&self) -> &'static str {
        "poa"
    }

    fn select(&self, height: u64, _prev_hash: &str) -> Option<Address> {
        let slot = (height % self.authorities.len() as u64) as usize;
        self.authorities.get(slot).cloned()
    }
}
