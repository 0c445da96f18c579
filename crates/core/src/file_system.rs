use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub type FileSystemRef = Arc<dyn FileSystem>;

/// A filesystem change observed between builds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
  pub kind: EventKind,
  pub path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
  Create,
  Update,
  Delete,
}

impl Event {
  pub fn create(path: impl Into<PathBuf>) -> Event {
    Event {
      kind: EventKind::Create,
      path: path.into(),
    }
  }

  pub fn update(path: impl Into<PathBuf>) -> Event {
    Event {
      kind: EventKind::Update,
      path: path.into(),
    }
  }

  pub fn delete(path: impl Into<PathBuf>) -> Event {
    Event {
      kind: EventKind::Delete,
      path: path.into(),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
  pub size: u64,
  pub is_file: bool,
  pub is_dir: bool,
}

/// The filesystem operations the build engine consumes. The production
/// watcher lives outside the core; only the snapshot/replay surface is
/// exercised here, so `watch` has a default unsupported implementation.
pub trait FileSystem: Send + Sync {
  fn cwd(&self) -> PathBuf;
  fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
  fn read_to_string(&self, path: &Path) -> io::Result<String>;
  fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
  fn stat(&self, path: &Path) -> io::Result<FileStat>;
  fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
  fn mkdirp(&self, path: &Path) -> io::Result<()>;
  fn unlink(&self, path: &Path) -> io::Result<()>;
  fn rimraf(&self, path: &Path) -> io::Result<()>;
  fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()>;
  fn realpath(&self, path: &Path) -> io::Result<PathBuf>;
  fn create_read_stream(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
  fn create_write_stream(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

  fn exists(&self, path: &Path) -> bool {
    self.stat(path).is_ok()
  }

  fn is_file(&self, path: &Path) -> bool {
    self.stat(path).map_or(false, |s| s.is_file)
  }

  fn is_dir(&self, path: &Path) -> bool {
    self.stat(path).map_or(false, |s| s.is_dir)
  }

  /// Events under `dir` since the snapshot was written. Supported by
  /// filesystems that journal changes; the OS watcher is an external
  /// collaborator.
  fn get_events_since(&self, dir: &Path, snapshot_path: &Path) -> io::Result<Vec<Event>>;

  fn write_snapshot(&self, dir: &Path, snapshot_path: &Path) -> io::Result<()>;

  /// Starts watching `dir`, delivering events to `callback`. Hosts with a
  /// native watcher implement this; the engine itself only consumes the
  /// snapshot/replay surface above.
  fn watch(
    &self,
    _dir: &Path,
    _callback: Box<dyn Fn(Vec<Event>) + Send + Sync>,
  ) -> io::Result<Subscription> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
  }
}

/// A handle to an active watcher; dropping it unsubscribes on filesystems
/// that support watching.
pub struct Subscription {
  pub id: u64,
}

/// Adapts the engine filesystem to the resolver crate's narrower contract.
pub struct ResolverFileSystem(pub FileSystemRef);

impl baler_resolver::FileSystem for ResolverFileSystem {
  fn read_to_string(&self, path: &Path) -> io::Result<String> {
    self.0.read_to_string(path)
  }

  fn is_file(&self, path: &Path) -> bool {
    self.0.is_file(path)
  }

  fn is_dir(&self, path: &Path) -> bool {
    self.0.is_dir(path)
  }

  fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
    Ok(
      self
        .0
        .read_dir(path)?
        .into_iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
        .collect(),
    )
  }
}

#[derive(Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
  fn cwd(&self) -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
  }

  fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
    std::fs::read(path)
  }

  fn read_to_string(&self, path: &Path) -> io::Result<String> {
    std::fs::read_to_string(path)
  }

  fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
  }

  fn stat(&self, path: &Path) -> io::Result<FileStat> {
    let meta = std::fs::metadata(path)?;
    Ok(FileStat {
      size: meta.len(),
      is_file: meta.is_file(),
      is_dir: meta.is_dir(),
    })
  }

  fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
    std::fs::read_dir(path)?
      .map(|entry| entry.map(|e| e.path()))
      .collect()
  }

  fn mkdirp(&self, path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
  }

  fn unlink(&self, path: &Path) -> io::Result<()> {
    std::fs::remove_file(path)
  }

  fn rimraf(&self, path: &Path) -> io::Result<()> {
    if path.is_dir() {
      std::fs::remove_dir_all(path)
    } else if path.exists() {
      std::fs::remove_file(path)
    } else {
      Ok(())
    }
  }

  fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(from, to).map(|_| ())
  }

  fn realpath(&self, path: &Path) -> io::Result<PathBuf> {
    std::fs::canonicalize(path)
  }

  fn create_read_stream(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
    Ok(Box::new(std::fs::File::open(path)?))
  }

  fn create_write_stream(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    Ok(Box::new(std::fs::File::create(path)?))
  }

  fn get_events_since(&self, _dir: &Path, _snapshot_path: &Path) -> io::Result<Vec<Event>> {
    // The OS watcher is an external collaborator; without it there is no
    // journal to replay, which callers treat as "no known changes".
    Ok(Vec::new())
  }

  fn write_snapshot(&self, _dir: &Path, snapshot_path: &Path) -> io::Result<()> {
    self.write(snapshot_path, b"0")
  }
}

/// An in-memory filesystem with a change journal, used by engine tests and
/// available to hosts that overlay virtual files.
#[derive(Default)]
pub struct MemoryFileSystem {
  state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
  files: BTreeMap<PathBuf, Vec<u8>>,
  events: Vec<Event>,
  snapshots: BTreeMap<PathBuf, usize>,
}

impl MemoryFileSystem {
  pub fn new() -> Self {
    Self::default()
  }

  /// Writes without recording a journal event, for seeding initial state.
  pub fn seed(&self, path: impl Into<PathBuf>, contents: &str) {
    self
      .state
      .lock()
      .files
      .insert(path.into(), contents.as_bytes().to_vec());
  }

  /// The journal of events recorded since construction.
  pub fn events(&self) -> Vec<Event> {
    self.state.lock().events.clone()
  }
}

impl FileSystem for MemoryFileSystem {
  fn cwd(&self) -> PathBuf {
    PathBuf::from("/")
  }

  fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
    self
      .state
      .lock()
      .files
      .get(path)
      .cloned()
      .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
  }

  fn read_to_string(&self, path: &Path) -> io::Result<String> {
    let bytes = self.read(path)?;
    String::from_utf8(bytes).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
  }

  fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut state = self.state.lock();
    let kind = if state.files.contains_key(path) {
      EventKind::Update
    } else {
      EventKind::Create
    };
    state.files.insert(path.to_path_buf(), contents.to_vec());
    state.events.push(Event {
      kind,
      path: path.to_path_buf(),
    });
    Ok(())
  }

  fn stat(&self, path: &Path) -> io::Result<FileStat> {
    let state = self.state.lock();
    if let Some(contents) = state.files.get(path) {
      return Ok(FileStat {
        size: contents.len() as u64,
        is_file: true,
        is_dir: false,
      });
    }
    let is_dir = state
      .files
      .keys()
      .any(|p| p.starts_with(path) && p != path);
    if is_dir {
      Ok(FileStat {
        size: 0,
        is_file: false,
        is_dir: true,
      })
    } else {
      Err(io::Error::from(io::ErrorKind::NotFound))
    }
  }

  fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
    let state = self.state.lock();
    let mut entries: Vec<PathBuf> = state
      .files
      .keys()
      .filter_map(|p| {
        let rest = p.strip_prefix(path).ok()?;
        let first = rest.components().next()?;
        Some(path.join(first.as_os_str()))
      })
      .collect();
    entries.dedup();
    Ok(entries)
  }

  fn mkdirp(&self, _path: &Path) -> io::Result<()> {
    // Directories exist implicitly.
    Ok(())
  }

  fn unlink(&self, path: &Path) -> io::Result<()> {
    let mut state = self.state.lock();
    if state.files.remove(path).is_none() {
      return Err(io::Error::from(io::ErrorKind::NotFound));
    }
    state.events.push(Event {
      kind: EventKind::Delete,
      path: path.to_path_buf(),
    });
    Ok(())
  }

  fn rimraf(&self, path: &Path) -> io::Result<()> {
    let mut state = self.state.lock();
    let removed: Vec<PathBuf> = state
      .files
      .keys()
      .filter(|p| p.starts_with(path))
      .cloned()
      .collect();
    for p in removed {
      state.files.remove(&p);
      state.events.push(Event {
        kind: EventKind::Delete,
        path: p,
      });
    }
    Ok(())
  }

  fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
    let contents = self.read(from)?;
    self.write(to, &contents)
  }

  fn realpath(&self, path: &Path) -> io::Result<PathBuf> {
    Ok(path.to_path_buf())
  }

  fn create_read_stream(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
    let contents = self.read(path)?;
    Ok(Box::new(io::Cursor::new(contents)))
  }

  fn create_write_stream(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
    Ok(Box::new(MemoryWriteStream {
      state: Arc::clone(&self.state),
      path: path.to_path_buf(),
      buffer: Vec::new(),
    }))
  }

  fn get_events_since(&self, dir: &Path, snapshot_path: &Path) -> io::Result<Vec<Event>> {
    let state = self.state.lock();
    let since = state.snapshots.get(snapshot_path).copied().unwrap_or(0);
    Ok(
      state
        .events
        .iter()
        .skip(since)
        .filter(|event| event.path.starts_with(dir))
        .cloned()
        .collect(),
    )
  }

  fn write_snapshot(&self, _dir: &Path, snapshot_path: &Path) -> io::Result<()> {
    let mut state = self.state.lock();
    let position = state.events.len();
    state.snapshots.insert(snapshot_path.to_path_buf(), position);
    Ok(())
  }
}

/// Buffers writes and commits them as a single file when dropped.
struct MemoryWriteStream {
  state: Arc<Mutex<MemoryState>>,
  path: PathBuf,
  buffer: Vec<u8>,
}

impl Write for MemoryWriteStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.buffer.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl Drop for MemoryWriteStream {
  fn drop(&mut self) {
    let mut state = self.state.lock();
    let kind = if state.files.contains_key(&self.path) {
      EventKind::Update
    } else {
      EventKind::Create
    };
    state
      .files
      .insert(self.path.clone(), std::mem::take(&mut self.buffer));
    state.events.push(Event {
      kind,
      path: self.path.clone(),
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn journal_and_snapshots() {
    let fs = MemoryFileSystem::new();
    fs.seed("/app/a.js", "a");
    fs.write(Path::new("/app/b.js"), b"b").unwrap();
    fs.write_snapshot(Path::new("/app"), Path::new("/cache/snapshot")).unwrap();

    fs.write(Path::new("/app/b.js"), b"b2").unwrap();
    fs.unlink(Path::new("/app/a.js")).unwrap();

    let events = fs
      .get_events_since(Path::new("/app"), Path::new("/cache/snapshot"))
      .unwrap();
    assert_eq!(
      events,
      vec![Event::update("/app/b.js"), Event::delete("/app/a.js")]
    );
  }

  #[test]
  fn stat_distinguishes_files_and_dirs() {
    let fs = MemoryFileSystem::new();
    fs.seed("/app/src/index.js", "x");
    assert!(fs.is_file(Path::new("/app/src/index.js")));
    assert!(fs.is_dir(Path::new("/app/src")));
    assert!(!fs.exists(Path::new("/app/missing")));
  }

  #[test]
  fn os_file_system_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let fs = OsFileSystem;
    let path = dir.path().join("nested").join("file.txt");

    fs.write(&path, b"contents").unwrap();
    assert_eq!(fs.read_to_string(&path).unwrap(), "contents");
    assert!(fs.is_file(&path));
    assert!(fs.is_dir(path.parent().unwrap()));

    let copy = dir.path().join("copy.txt");
    fs.copy_file(&path, &copy).unwrap();
    assert_eq!(fs.read(&copy).unwrap(), b"contents");

    fs.rimraf(dir.path().join("nested").as_path()).unwrap();
    assert!(!fs.exists(&path));
  }
}
