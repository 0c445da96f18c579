use std::io::Read;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use xxhash_rust::xxh3::Xxh3;

use crate::file_system::FileSystemRef;
use crate::intern::{scoped_deserialize, scoped_serialize};
use crate::types::hex;

/// In-bundle placeholders of this shape are rewritten with final content
/// hashes after all bundles are packaged.
pub const HASH_REF_PREFIX: &str = "HASH_REF_";

/// Prefix plus a 16 character hex hash.
pub const HASH_REF_LEN: usize = HASH_REF_PREFIX.len() + 16;

/// Bytes carried across chunk boundaries while scanning streams, so a token
/// straddling two chunks is never missed.
const BOUNDARY_WINDOW: usize = 33;

pub fn hash_ref(bundle_id: u64) -> String {
  format!("{}{}", HASH_REF_PREFIX, hex(bundle_id))
}

/// A content-addressed store over an injected filesystem. Keys are lowercase
/// hex fingerprints; values round-trip through the registered serializer so
/// graph objects survive restarts.
pub struct Cache {
  fs: FileSystemRef,
  dir: PathBuf,
}

impl Cache {
  pub fn new(fs: FileSystemRef, dir: PathBuf) -> Cache {
    Cache { fs, dir }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn path(&self, key: &str) -> PathBuf {
    self.dir.join(key)
  }

  pub fn has(&self, key: &str) -> bool {
    self.fs.is_file(&self.path(key))
  }

  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let bytes = self.fs.read(&self.path(key)).ok()?;
    scoped_deserialize(|| bincode::deserialize(&bytes).ok())
  }

  pub fn set<T: Serialize>(&self, key: &str, value: &T) {
    let bytes = scoped_serialize(|| bincode::serialize(value));
    if let Ok(bytes) = bytes {
      let _ = self.fs.write(&self.path(key), &bytes);
    }
  }

  pub fn get_blob(&self, key: &str) -> std::io::Result<Vec<u8>> {
    self.fs.read(&self.path(key))
  }

  pub fn set_blob(&self, key: &str, bytes: &[u8]) -> std::io::Result<()> {
    self.fs.write(&self.path(key), bytes)
  }

  /// Streams a reader into the cache, hashing and scanning for hash
  /// references as the bytes flow.
  pub fn set_stream(&self, key: &str, reader: &mut dyn Read) -> std::io::Result<StreamStats> {
    let mut scanner = StreamingHasher::new();
    let mut contents = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
      let read = reader.read(&mut chunk)?;
      if read == 0 {
        break;
      }
      scanner.write(&chunk[..read]);
      contents.extend_from_slice(&chunk[..read]);
    }
    self.fs.write(&self.path(key), &contents)?;
    Ok(scanner.finish())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
  pub size: u64,
  pub hash: String,
  pub hash_references: Vec<String>,
}

/// Hashes a byte stream while counting its size and collecting hash-reference
/// tokens. Keeps a sliding window across chunk boundaries so tokens split
/// between chunks are still captured.
pub struct StreamingHasher {
  hasher: Xxh3,
  size: u64,
  window: Vec<u8>,
  references: IndexSet<String>,
}

impl StreamingHasher {
  pub fn new() -> StreamingHasher {
    StreamingHasher {
      hasher: Xxh3::new(),
      size: 0,
      window: Vec::with_capacity(BOUNDARY_WINDOW * 2),
      references: IndexSet::new(),
    }
  }

  pub fn write(&mut self, chunk: &[u8]) {
    self.hasher.update(chunk);
    self.size += chunk.len() as u64;

    // Scan the carried boundary bytes together with the new chunk.
    let mut buffer = std::mem::take(&mut self.window);
    buffer.extend_from_slice(chunk);
    scan_hash_refs(&buffer, &mut self.references);

    let keep = buffer.len().min(BOUNDARY_WINDOW);
    self.window = buffer.split_off(buffer.len() - keep);
  }

  pub fn finish(self) -> StreamStats {
    StreamStats {
      size: self.size,
      hash: hex(self.hasher.digest()),
      hash_references: self.references.into_iter().collect(),
    }
  }
}

impl Default for StreamingHasher {
  fn default() -> Self {
    StreamingHasher::new()
  }
}

fn scan_hash_refs(buffer: &[u8], references: &mut IndexSet<String>) {
  let prefix = HASH_REF_PREFIX.as_bytes();
  let mut offset = 0;
  while offset + HASH_REF_LEN <= buffer.len() {
    if buffer[offset..].starts_with(prefix) {
      let token = &buffer[offset..offset + HASH_REF_LEN];
      let hash = &token[HASH_REF_PREFIX.len()..];
      if hash.iter().all(|b| b.is_ascii_hexdigit()) {
        // Tokens are ascii by construction.
        references.insert(String::from_utf8_lossy(token).into_owned());
        offset += HASH_REF_LEN;
        continue;
      }
    }
    offset += 1;
  }
}

/// Replaces every hash-reference token in `contents` using the lookup,
/// leaving unknown tokens in place. Idempotent: replacement output contains
/// no tokens to rewrite again.
pub fn replace_hash_refs(
  contents: &[u8],
  mut lookup: impl FnMut(&str) -> Option<String>,
) -> Vec<u8> {
  let prefix = HASH_REF_PREFIX.as_bytes();
  let mut output = Vec::with_capacity(contents.len());
  let mut offset = 0;
  while offset < contents.len() {
    if offset + HASH_REF_LEN <= contents.len() && contents[offset..].starts_with(prefix) {
      let token = &contents[offset..offset + HASH_REF_LEN];
      let hash = &token[HASH_REF_PREFIX.len()..];
      if hash.iter().all(|b| b.is_ascii_hexdigit()) {
        let token_str = String::from_utf8_lossy(token).into_owned();
        if let Some(replacement) = lookup(&token_str) {
          output.extend_from_slice(replacement.as_bytes());
          offset += HASH_REF_LEN;
          continue;
        }
      }
    }
    output.push(contents[offset]);
    offset += 1;
  }
  output
}
