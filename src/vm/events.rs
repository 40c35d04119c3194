use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::standard::TokenStandard;
use crate::blockchain::{Address, Amount};

/// Events a lagging subscriber may fall behind by before it starts losing them
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Something observable that a successful contract execution did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractEvent {
    Deployed {
        contract: Address,
        owner: Address,
        standard: TokenStandard,
        symbol: String,
    },
    Transfer {
        contract: Address,
        from: Address,
        to: Address,
        amount: Amount,
    },
    Approval {
        contract: Address,
        owner: Address,
        spender: Address,
        amount: Amount,
    },
    KycStatusChanged {
        contract: Address,
        user: Address,
        passed: bool,
    },
    SnapshotTaken {
        contract: Address,
        snapshot_id: u64,
    },
    DividendPoolSet {
        contract: Address,
        snapshot_id: u64,
        amount: Amount,
    },
    DividendPaid {
        contract: Address,
        snapshot_id: u64,
        holder: Address,
        amount: Amount,
    },
    CrossChainTransfer {
        contract: Address,
        from: Address,
        target_chain: String,
        to: String,
        amount: Amount,
    },
    ModuleRegistered {
        contract: Address,
        name: String,
        address: Address,
    },
}

impl ContractEvent {
    /// The contract that emitted the event
    pub fn contract(&self) -> &Address {
        match self {
            ContractEvent::Deployed { contract, .. }
            | ContractEvent::Transfer { contract, .. }
            | ContractEvent::Approval { contract, .. }
            | ContractEvent::KycStatusChanged { contract, .. }
            | ContractEvent::SnapshotTaken { contract, .. }
            | ContractEvent::DividendPoolSet { contract, .. }
            | ContractEvent::DividendPaid { contract, .. }
            | ContractEvent::CrossChainTransfer { contract, .. }
            | ContractEvent::ModuleRegistered { contract, .. } => contract,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContractEvent::Deployed { .. } => "deployed",
            ContractEvent::Transfer { .. } => "transfer",
            ContractEvent::Approval { .. } => "approval",
            ContractEvent::KycStatusChanged { .. } => "kyc_status_changed",
            ContractEvent::SnapshotTaken { .. } => "snapshot_taken",
            ContractEvent::DividendPoolSet { .. } => "dividend_pool_set",
            ContractEvent::DividendPaid { .. } => "dividend_paid",
            ContractEvent::CrossChainTransfer { .. } => "cross_chain_transfer",
            ContractEvent::ModuleRegistered { .. } => "module_registered",
        }
    }
}

/// In-process fan-out of contract events
///
/// Publishing never blocks. A subscriber that falls more than
/// [`EVENT_CHANNEL_CAPACITY`] events behind sees `RecvError::Lagged`.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ContractEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContractEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, events: &[ContractEvent]) {
        for event in events {
            // Fails only when nobody is subscribed
            if self.sender.send(event.clone()).is_err() {
                debug!("No subscribers for {} event on {}", event.name(), event.contract());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Wallet;

    fn transfer_event(amount: Amount) -> ContractEvent {
        ContractEvent::Transfer {
            contract: Address("GNDct00".to_string()),
            from: Wallet::generate().address().clone(),
            to: Wallet::generate().address().clone(),
            amount,
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(&[transfer_event(1)]);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let events = vec![transfer_event(1), transfer_event(2)];
        bus.publish(&events);

        for receiver in [&mut first, &mut second] {
            assert_eq!(receiver.recv().await.unwrap(), events[0]);
            assert_eq!(receiver.recv().await.unwrap(), events[1]);
        }
    }

    #[test]
    fn test_lagging_subscriber() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();
        bus.publish(&[transfer_event(1), transfer_event(2), transfer_event(3)]);

        assert!(matches!(
            receiver.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        assert!(matches!(
            receiver.try_recv(),
            Ok(ContractEvent::Transfer { amount: 2, .. })
        ));
    }
}
