use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

use super::transaction::Transaction;

/// Errors that can occur during mempool admission
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("Transaction already pending: {0}")]
    AlreadyExists(String),

    #[error("Mempool is full ({0} transactions)")]
    Full(usize),
}

/// Concurrent store of pending transactions, unique by hash and unordered
///
/// The capacity only bounds [`Mempool::insert_new`]; [`Mempool::add`] is an
/// unconditional upsert.
#[derive(Debug, Default)]
pub struct Mempool {
    pending: DashMap<String, Transaction>,
    capacity: Option<usize>,
    /// Serializes bounded admissions so the size check and the insert agree
    admission: Mutex<()>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mempool that refuses new admissions past `capacity`
    pub fn with_capacity(capacity: usize) -> Self {
        Mempool {
            pending: DashMap::with_capacity(capacity),
            capacity: Some(capacity),
            admission: Mutex::new(()),
        }
    }

    /// Inserts or replaces a transaction by hash
    pub fn add(&self, transaction: Transaction) {
        self.pending.insert(transaction.hash.clone(), transaction);
    }

    /// Admits a transaction only if its hash is not already pending
    pub fn insert_new(&self, transaction: Transaction) -> Result<(), MempoolError> {
        let _admission = self.capacity.map(|_| self.admission.lock());
        if let Some(capacity) = self.capacity {
            // `len` reads every shard, so it must not run under an entry guard
            if self.pending.len() >= capacity && !self.pending.contains_key(&transaction.hash) {
                return Err(MempoolError::Full(capacity));
            }
        }

        match self.pending.entry(transaction.hash.clone()) {
            Entry::Occupied(entry) => Err(MempoolError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(transaction);
                Ok(())
            }
        }
    }

    pub fn remove(&self, hash: &str) -> Option<Transaction> {
        self.pending.remove(hash).map(|(_, tx)| tx)
    }

    /// Removes a committed batch; returns how many were actually pending
    pub fn remove_many<'a, I>(&self, hashes: I) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        hashes
            .into_iter()
            .filter(|hash| self.pending.remove(hash.as_str()).is_some())
            .count()
    }

    pub fn get(&self, hash: &str) -> Option<Transaction> {
        self.pending.get(hash).map(|entry| entry.value().clone())
    }

    /// Snapshot copy of every pending transaction
    pub fn all(&self) -> Vec<Transaction> {
        self.pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.pending.len()
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.pending.contains_key(hash)
    }

    pub fn clear(&self) {
        self.pending.clear();
    }
}
