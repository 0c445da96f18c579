use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};

/// A pointer into a process-wide [`Interner`]. Cloning, comparing and
/// hashing cost a pointer or a cached hash; the value itself is never freed.
pub struct Interned<T: 'static>(&'static Slot<T>);

struct Slot<T> {
  hash: u64,
  value: T,
}

const SHARD_COUNT: usize = 16;

/// Deduplicating storage for values that repeat heavily across a build:
/// environments, file paths, symbol names. Lookups shard by content hash;
/// each bucket holds the slots whose hashes collided and is scanned
/// linearly, which stays short in practice.
pub struct Interner<T: 'static> {
  shards: Vec<RwLock<FxHashMap<u64, Vec<&'static Slot<T>>>>>,
}

impl<T: Hash + Eq> Interner<T> {
  pub fn new() -> Interner<T> {
    Interner {
      shards: (0..SHARD_COUNT)
        .map(|_| RwLock::new(FxHashMap::default()))
        .collect(),
    }
  }

  pub fn intern(&self, value: T) -> Interned<T> {
    let hash = content_hash(&value);
    let shard = &self.shards[hash as usize % SHARD_COUNT];

    {
      let bucket = shard.read();
      if let Some(slots) = bucket.get(&hash) {
        if let Some(slot) = slots.iter().find(|slot| slot.value == value) {
          return Interned(slot);
        }
      }
    }

    let mut bucket = shard.write();
    let slots = bucket.entry(hash).or_default();
    // Re-check under the write lock; another thread may have interned the
    // same value between the two lock acquisitions.
    if let Some(slot) = slots.iter().find(|slot| slot.value == value) {
      return Interned(slot);
    }
    // Slots live for the rest of the process so the pointer stays valid.
    let slot: &'static Slot<T> = Box::leak(Box::new(Slot { hash, value }));
    slots.push(slot);
    Interned(slot)
  }

  /// Forgets all buckets. Outstanding [`Interned`] pointers stay valid;
  /// equal values interned afterwards get fresh slots.
  pub fn clear(&self) {
    for shard in &self.shards {
      shard.write().clear();
    }
  }
}

impl<T: Hash + Eq> Default for Interner<T> {
  fn default() -> Self {
    Interner::new()
  }
}

fn content_hash<T: Hash>(value: &T) -> u64 {
  let mut hasher = FxHasher::default();
  value.hash(&mut hasher);
  hasher.finish()
}

/// Types with a process-wide interner. Gives `value.into()` for
/// `Interned<T>` and drives deserialization back through the interner.
pub trait Intern: Hash + Eq + Sized + 'static {
  fn interner() -> &'static Interner<Self>;
}

impl<T: Intern> From<T> for Interned<T> {
  fn from(value: T) -> Interned<T> {
    T::interner().intern(value)
  }
}

impl Intern for String {
  fn interner() -> &'static Interner<String> {
    static INTERNER: OnceLock<Interner<String>> = OnceLock::new();
    INTERNER.get_or_init(Interner::new)
  }
}

impl Intern for PathBuf {
  fn interner() -> &'static Interner<PathBuf> {
    static INTERNER: OnceLock<Interner<PathBuf>> = OnceLock::new();
    INTERNER.get_or_init(Interner::new)
  }
}

impl From<&str> for Interned<String> {
  fn from(value: &str) -> Self {
    String::interner().intern(value.to_owned())
  }
}

impl From<&Path> for Interned<PathBuf> {
  fn from(value: &Path) -> Self {
    PathBuf::interner().intern(value.to_owned())
  }
}

impl From<&str> for Interned<PathBuf> {
  fn from(value: &str) -> Self {
    PathBuf::interner().intern(value.into())
  }
}

impl From<String> for Interned<PathBuf> {
  fn from(value: String) -> Self {
    PathBuf::interner().intern(value.into())
  }
}

impl<T> Clone for Interned<T> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<T> Copy for Interned<T> {}

impl<T> Deref for Interned<T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.0.value
  }
}

impl<T> AsRef<T> for Interned<T> {
  fn as_ref(&self) -> &T {
    &self.0.value
  }
}

impl<T> PartialEq for Interned<T> {
  fn eq(&self, other: &Self) -> bool {
    // One slot per distinct value, so identity is pointer identity.
    std::ptr::eq(self.0, other.0)
  }
}

impl<T> Eq for Interned<T> {}

impl PartialEq<&str> for Interned<String> {
  fn eq(&self, other: &&str) -> bool {
    self.0.value == *other
  }
}

impl<T: PartialOrd> PartialOrd for Interned<T> {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    self.0.value.partial_cmp(&other.0.value)
  }
}

impl<T: Ord> Ord for Interned<T> {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    self.0.value.cmp(&other.0.value)
  }
}

impl<T> Hash for Interned<T> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    // The cached content hash, not the pointer: ids derived from interned
    // values must be stable across processes and cache round-trips.
    state.write_u64(self.0.hash);
  }
}

impl<T: fmt::Debug> fmt::Debug for Interned<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.value.fmt(f)
  }
}

impl<T: fmt::Display> fmt::Display for Interned<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.value.fmt(f)
  }
}

// Serialization. Human-readable formats see the plain value. Binary formats
// deduplicate: within a `scoped_serialize` call, the first sighting of a
// slot writes the value inline and later sightings write the index of that
// first sighting. Without an active scope repeats are simply written inline.

#[derive(Serialize, Deserialize)]
enum Repr<T> {
  Inline(T),
  Seen(u32),
}

thread_local! {
  static WRITTEN: RefCell<Option<FxHashMap<usize, u32>>> = RefCell::new(None);
  static READ: RefCell<Option<Vec<usize>>> = RefCell::new(None);
}

/// Runs `f` with slot deduplication enabled for any `Interned` values it
/// serializes into a binary format.
pub fn scoped_serialize<R>(f: impl FnOnce() -> R) -> R {
  WRITTEN.with(|cell| *cell.borrow_mut() = Some(FxHashMap::default()));
  let result = f();
  WRITTEN.with(|cell| *cell.borrow_mut() = None);
  result
}

/// The deserialization counterpart of [`scoped_serialize`]; back-references
/// resolve against the values already seen inside `f`.
pub fn scoped_deserialize<R>(f: impl FnOnce() -> R) -> R {
  READ.with(|cell| *cell.borrow_mut() = Some(Vec::new()));
  let result = f();
  READ.with(|cell| *cell.borrow_mut() = None);
  result
}

impl<T: Serialize> Serialize for Interned<T> {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    if serializer.is_human_readable() {
      return self.0.value.serialize(serializer);
    }

    let addr = self.0 as *const Slot<T> as usize;
    let seen = WRITTEN.with(|cell| cell.borrow().as_ref().and_then(|map| map.get(&addr).copied()));
    match seen {
      Some(index) => Repr::<&T>::Seen(index).serialize(serializer),
      None => {
        let result = Repr::Inline(&self.0.value).serialize(serializer);
        // Recorded after the payload: interned values nested inside it take
        // earlier indices, matching the order deserialization sees them.
        WRITTEN.with(|cell| {
          if let Some(map) = cell.borrow_mut().as_mut() {
            let index = map.len() as u32;
            map.insert(addr, index);
          }
        });
        result
      }
    }
  }
}

impl<'de, T: Intern + Deserialize<'de>> Deserialize<'de> for Interned<T> {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    if deserializer.is_human_readable() {
      return T::deserialize(deserializer).map(Interned::from);
    }

    match Repr::<T>::deserialize(deserializer)? {
      Repr::Inline(value) => {
        let interned: Interned<T> = value.into();
        READ.with(|cell| {
          if let Some(list) = cell.borrow_mut().as_mut() {
            list.push(interned.0 as *const Slot<T> as usize);
          }
        });
        Ok(interned)
      }
      Repr::Seen(index) => {
        let addr = READ.with(|cell| {
          cell
            .borrow()
            .as_ref()
            .and_then(|list| list.get(index as usize).copied())
        });
        match addr {
          // The address came from a leaked slot recorded moments ago in
          // this same scope, so it is valid and of the right type.
          Some(addr) => Ok(Interned(unsafe { &*(addr as *const Slot<T>) })),
          None => Err(serde::de::Error::custom(
            "interned back-reference outside a deserialize scope",
          )),
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn equal_values_share_a_slot() {
    let a: Interned<String> = "env".into();
    let b: Interned<String> = String::from("env").into();
    assert_eq!(a, b);
    assert!(std::ptr::eq(a.as_ref(), b.as_ref()));

    let c: Interned<String> = "other".into();
    assert_ne!(a, c);
  }

  #[test]
  fn hashes_are_content_based() {
    let a: Interned<PathBuf> = "/app/src/index.js".into();
    let b: Interned<PathBuf> = "/app/src/index.js".into();
    assert_eq!(content_hash(&a), content_hash(&b));
  }

  #[derive(Serialize, Deserialize, Debug, PartialEq)]
  struct Pair {
    a: Interned<String>,
    b: Interned<String>,
  }

  #[test]
  fn binary_round_trip_dedupes_repeats() {
    let pair = Pair {
      a: "shared".into(),
      b: "shared".into(),
    };

    let bytes = scoped_serialize(|| bincode::serialize(&pair).unwrap());
    let restored: Pair = scoped_deserialize(|| bincode::deserialize(&bytes).unwrap());

    assert_eq!(restored, pair);
    // The second occurrence came back as a back-reference to the first.
    assert!(std::ptr::eq(restored.a.as_ref(), restored.b.as_ref()));
  }

  #[test]
  fn unscoped_binary_serialization_still_round_trips() {
    let value: Interned<String> = "plain".into();
    let bytes = bincode::serialize(&value).unwrap();
    let restored: Interned<String> =
      scoped_deserialize(|| bincode::deserialize(&bytes).unwrap());
    assert_eq!(restored, value);
  }
}
