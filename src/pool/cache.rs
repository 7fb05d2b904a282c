use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use crate::hash::Address;
use crate::hash::TxHash;
use crate::tx::Transaction;

#[derive(Debug, Clone)]
pub(crate) struct CachedTx {
    pub tx: Transaction,
    pub hash: TxHash,
    pub added_at: Instant,
}

/// Transactions whose predecessor nonce is not pooled yet, per sender and
/// nonce.
#[derive(Debug, Default)]
pub(crate) struct NonceCollection {
    by_sender: HashMap<Address, BTreeMap<u64, CachedTx>>,
    hashes: HashMap<TxHash, (Address, u64)>,
}

impl NonceCollection {
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn contains(&self, sender: &Address, nonce: u64) -> bool {
        self.by_sender
            .get(sender)
            .is_some_and(|nonces| nonces.contains_key(&nonce))
    }

    pub fn contains_hash(&self, hash: &TxHash) -> bool {
        self.hashes.contains_key(hash)
    }

    pub fn get_by_hash(&self, hash: &TxHash) -> Option<&CachedTx> {
        let (sender, nonce) = self.hashes.get(hash)?;
        self.by_sender.get(sender)?.get(nonce)
    }

    pub fn count(&self, sender: &Address) -> usize {
        self.by_sender.get(sender).map_or(0, BTreeMap::len)
    }

    pub fn insert(&mut self, sender: Address, tx: Transaction, hash: TxHash) {
        let nonce = tx.nonce;
        self.hashes.insert(hash, (sender, nonce));
        self.by_sender.entry(sender).or_default().insert(
            nonce,
            CachedTx {
                tx,
                hash,
                added_at: Instant::now(),
            },
        );
    }

    pub fn take(&mut self, sender: &Address, nonce: u64) -> Option<CachedTx> {
        let nonces = self.by_sender.get_mut(sender)?;
        let cached = nonces.remove(&nonce)?;
        if nonces.is_empty() {
            self.by_sender.remove(sender);
        }
        self.hashes.remove(&cached.hash);
        Some(cached)
    }

    pub fn remove_hash(&mut self, hash: &TxHash) -> Option<CachedTx> {
        let (sender, nonce) = *self.hashes.get(hash)?;
        self.take(&sender, nonce)
    }

    pub fn senders(&self) -> Vec<Address> {
        self.by_sender.keys().copied().collect()
    }

    /// Lowest cached nonce of `sender`.
    pub fn first_nonce(&self, sender: &Address) -> Option<u64> {
        self.by_sender.get(sender)?.keys().next().copied()
    }

    pub fn remove_expired(&mut self, ttl: Duration) -> usize {
        let expired: Vec<TxHash> = self
            .by_sender
            .values()
            .flat_map(|nonces| nonces.values())
            .filter(|cached| cached.added_at.elapsed() >= ttl)
            .map(|cached| cached.hash)
            .collect();
        for hash in &expired {
            self.remove_hash(hash);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TxPayload;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn tx(key: &SigningKey, nonce: u64) -> Transaction {
        let payload = TxPayload::Transfer {
            to: Address([1; 20]),
            value: 1,
        };
        Transaction::new(key, nonce, 1, 0, payload)
    }

    #[test]
    fn take_keeps_indices_consistent() {
        let key = SigningKey::generate(&mut OsRng);
        let mut cache = NonceCollection::default();
        let a = tx(&key, 3);
        let b = tx(&key, 5);
        let sender = a.sender_address();
        cache.insert(sender, a.clone(), a.hash());
        cache.insert(sender, b.clone(), b.hash());
        assert_eq!(cache.count(&sender), 2);
        assert_eq!(cache.first_nonce(&sender), Some(3));

        let taken = cache.take(&sender, 3).unwrap();
        assert_eq!(taken.hash, a.hash());
        assert!(!cache.contains_hash(&a.hash()));
        assert_eq!(cache.len(), 1);

        cache.remove_hash(&b.hash()).unwrap();
        assert_eq!(cache.len(), 0);
        assert!(cache.senders().is_empty());
    }

    #[test]
    fn zero_ttl_expires_everything() {
        let key = SigningKey::generate(&mut OsRng);
        let mut cache = NonceCollection::default();
        let a = tx(&key, 3);
        cache.insert(a.sender_address(), a.clone(), a.hash());
        assert_eq!(cache.remove_expired(Duration::ZERO), 1);
        assert_eq!(cache.len(), 0);
    }
}
