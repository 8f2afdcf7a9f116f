//! Generation-checked slot arena backing every opaque handle.
//!
//! A [`Key`] is never a raw address. Lookups with a key whose slot was
//! removed, or with a key minted by a different registry, fail with
//! `InvalidHandle` instead of touching freed state.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{Result, ShardMemError};

const INDEX_SHIFT: u32 = 32;
const REGISTRY_SHIFT: u32 = 64;
const FIELD_MASK: u128 = (1u128 << 32) - 1;

static NEXT_REGISTRY_ID: AtomicU32 = AtomicU32::new(1);

/// Registry key encoded in a single `u128`.
///
/// Layout (MSB to LSB): `[unused: 32][registry_id: 32][index: 32][generation: 32]`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key(u128);

impl Key {
    fn new(registry_id: u32, index: u32, generation: u32) -> Self {
        Self(
            ((registry_id as u128) << REGISTRY_SHIFT)
                | ((index as u128) << INDEX_SHIFT)
                | generation as u128,
        )
    }

    pub fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u128 {
        self.0
    }

    pub fn registry_id(&self) -> u32 {
        ((self.0 >> REGISTRY_SHIFT) & FIELD_MASK) as u32
    }

    pub fn index(&self) -> u32 {
        ((self.0 >> INDEX_SHIFT) & FIELD_MASK) as u32
    }

    pub fn generation(&self) -> u32 {
        (self.0 & FIELD_MASK) as u32
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}",
            self.registry_id(),
            self.index(),
            self.generation()
        )
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Slot arena keyed by generation-checked [`Key`]s.
///
/// Safe for concurrent use; values are handed out as `Arc<T>` so a lookup
/// never holds the registry lock while the caller works with the value.
pub struct Registry<T> {
    id: u32,
    kind: &'static str,
    inner: RwLock<Slots<T>>,
}

impl<T> Registry<T> {
    /// Create an empty registry. `kind` names the handle type in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub fn insert(&self, value: T) -> Key {
        let mut inner = self.inner.write();
        inner.live += 1;

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.value = Some(Arc::new(value));
            return Key::new(self.id, index, slot.generation);
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            value: Some(Arc::new(value)),
        });
        Key::new(self.id, index, 0)
    }

    pub fn get(&self, key: Key) -> Result<Arc<T>> {
        let inner = self.inner.read();
        self.check(key)?;
        inner
            .slots
            .get(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.value.clone())
            .ok_or_else(|| self.stale(key))
    }

    /// Remove the value behind `key`, bumping the slot generation so every
    /// copy of `key` becomes stale.
    pub fn remove(&self, key: Key) -> Result<Arc<T>> {
        let mut inner = self.inner.write();
        self.check(key)?;

        let slot = inner
            .slots
            .get_mut(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
            .ok_or_else(|| self.stale(key))?;
        let value = slot.value.take().ok_or_else(|| self.stale(key))?;
        slot.generation = slot.generation.wrapping_add(1);

        inner.free.push(key.index());
        inner.live -= 1;
        Ok(value)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_ok()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, key: Key) -> Result<()> {
        if key.registry_id() != self.id {
            return Err(ShardMemError::InvalidHandle(format!(
                "{} {} belongs to another context",
                self.kind, key
            )));
        }
        Ok(())
    }

    fn stale(&self, key: Key) -> ShardMemError {
        ShardMemError::InvalidHandle(format!("{} {} is not live", self.kind, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn test_key_layout() {
        let key = Key::new(7, 42, 3);
        assert_eq!(key.registry_id(), 7);
        assert_eq!(key.index(), 42);
        assert_eq!(key.generation(), 3);
        assert_eq!(Key::from_raw(key.raw()), key);
        assert_eq!(key.to_string(), "7:42.3");
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = Registry::new("test");
        let key = registry.insert(String::from("shard"));

        assert_eq!(registry.get(key).unwrap().as_str(), "shard");
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(key).unwrap();
        assert_eq!(removed.as_str(), "shard");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_key_after_remove() {
        let registry = Registry::new("test");
        let key = registry.insert(1u32);
        registry.remove(key).unwrap();

        let err = registry.get(key).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidHandle);
        assert_eq!(registry.remove(key).unwrap_err().code(), ErrorCode::InvalidHandle);
    }

    #[test]
    fn test_reused_slot_rejects_old_generation() {
        let registry = Registry::new("test");
        let old = registry.insert(1u32);
        registry.remove(old).unwrap();

        let new = registry.insert(2u32);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert!(registry.get(old).is_err());
        assert_eq!(*registry.get(new).unwrap(), 2);
    }

    #[test]
    fn test_foreign_registry_key() {
        let a = Registry::new("test");
        let b: Registry<u32> = Registry::new("test");
        let key = a.insert(5u32);

        let err = b.get(key).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidHandle);
        assert!(err.to_string().contains("another context"));
    }
}
