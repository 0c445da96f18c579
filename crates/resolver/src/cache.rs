use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::error::ResolverError;
use crate::package_json::PackageJson;
use crate::FileSystem;

/// Caches parsed package.json files by path for the lifetime of a resolver.
/// Entries are shared across threads; a build clears the cache by dropping it.
#[derive(Default)]
pub struct PackageJsonCache {
  packages: DashMap<PathBuf, Arc<Result<PackageJson, ResolverError>>, FxBuildHasher>,
}

impl PackageJsonCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn read_package(
    &self,
    fs: &dyn FileSystem,
    path: &Path,
  ) -> Arc<Result<PackageJson, ResolverError>> {
    if let Some(cached) = self.packages.get(path) {
      return Arc::clone(&cached);
    }

    let result = fs
      .read_to_string(path)
      .map_err(ResolverError::from)
      .and_then(|contents| PackageJson::parse(path.to_path_buf(), &contents));

    let entry = Arc::new(result);
    self.packages.insert(path.to_path_buf(), Arc::clone(&entry));
    entry
  }

  /// Finds and reads the nearest package.json at or above the given directory.
  pub fn find_package(
    &self,
    fs: &dyn FileSystem,
    dir: &Path,
  ) -> Option<(PathBuf, Arc<Result<PackageJson, ResolverError>>)> {
    for ancestor in dir.ancestors() {
      let candidate = ancestor.join("package.json");
      if fs.is_file(&candidate) {
        let pkg = self.read_package(fs, &candidate);
        return Some((candidate, pkg));
      }
    }
    None
  }

  pub fn clear(&self) {
    self.packages.clear();
  }
}
