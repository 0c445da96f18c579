pub mod builtins;
mod cache;
mod error;
mod fuzzy;
mod package_json;
mod specifier;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use cache::PackageJsonCache;
pub use error::ResolverError;
pub use fuzzy::{edit_distance, find_alternatives};
pub use package_json::{
  AliasValue, BrowserField, ExportsCondition, ExportsResolution, PackageJson, PackageJsonError,
  SideEffects,
};
pub use specifier::{parse_scheme, Specifier, SpecifierError, SpecifierType};

/// The filesystem operations the resolver needs. Implemented by the host so
/// resolution can run against an in-memory overlay as well as the OS.
pub trait FileSystem: Send + Sync {
  fn read_to_string(&self, path: &Path) -> io::Result<String>;
  fn is_file(&self, path: &Path) -> bool;
  fn is_dir(&self, path: &Path) -> bool;
  fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;
}

#[derive(Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
  fn read_to_string(&self, path: &Path) -> io::Result<String> {
    std::fs::read_to_string(path)
  }

  fn is_file(&self, path: &Path) -> bool {
    path.is_file()
  }

  fn is_dir(&self, path: &Path) -> bool {
    path.is_dir()
  }

  fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
    Ok(
      std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect(),
    )
  }
}

/// Which bare specifiers resolve into node_modules rather than staying external.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IncludeNodeModules {
  Bool(bool),
  Array(Vec<String>),
  Map(BTreeMap<String, bool>),
}

// Human-readable formats see the natural JSON shapes (bool | array | map);
// binary formats need a tag, so those go through a derived mirror enum.
#[derive(Serialize, Deserialize)]
enum TaggedIncludeNodeModules {
  Bool(bool),
  Array(Vec<String>),
  Map(BTreeMap<String, bool>),
}

impl Serialize for IncludeNodeModules {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    if serializer.is_human_readable() {
      match self {
        IncludeNodeModules::Bool(b) => b.serialize(serializer),
        IncludeNodeModules::Array(list) => list.serialize(serializer),
        IncludeNodeModules::Map(map) => map.serialize(serializer),
      }
    } else {
      let tagged = match self {
        IncludeNodeModules::Bool(b) => TaggedIncludeNodeModules::Bool(*b),
        IncludeNodeModules::Array(list) => TaggedIncludeNodeModules::Array(list.clone()),
        IncludeNodeModules::Map(map) => TaggedIncludeNodeModules::Map(map.clone()),
      };
      tagged.serialize(serializer)
    }
  }
}

impl<'de> Deserialize<'de> for IncludeNodeModules {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    if deserializer.is_human_readable() {
      let value = serde_json::Value::deserialize(deserializer)?;
      match value {
        serde_json::Value::Bool(b) => Ok(IncludeNodeModules::Bool(b)),
        serde_json::Value::Array(_) => serde_json::from_value(value)
          .map(IncludeNodeModules::Array)
          .map_err(serde::de::Error::custom),
        serde_json::Value::Object(_) => serde_json::from_value(value)
          .map(IncludeNodeModules::Map)
          .map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom(
          "includeNodeModules must be a bool, array, or map",
        )),
      }
    } else {
      Ok(match TaggedIncludeNodeModules::deserialize(deserializer)? {
        TaggedIncludeNodeModules::Bool(b) => IncludeNodeModules::Bool(b),
        TaggedIncludeNodeModules::Array(list) => IncludeNodeModules::Array(list),
        TaggedIncludeNodeModules::Map(map) => IncludeNodeModules::Map(map),
      })
    }
  }
}

impl Default for IncludeNodeModules {
  fn default() -> Self {
    IncludeNodeModules::Bool(true)
  }
}

impl IncludeNodeModules {
  pub fn includes(&self, name: &str) -> bool {
    match self {
      IncludeNodeModules::Bool(b) => *b,
      IncludeNodeModules::Array(names) => names.iter().any(|n| n == name),
      IncludeNodeModules::Map(map) => *map.get(name).unwrap_or(&false),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum Resolution {
  /// A file on disk.
  Path(PathBuf),
  /// A runtime builtin, left for the environment to provide.
  Builtin(String),
  /// Replaced with an empty module (excluded builtins, `false` aliases).
  Empty,
  /// Omitted from the build entirely (excluded node_modules, remote URLs).
  External,
}

/// The outcome of a resolution attempt. Invalidations are reported on both
/// the success and failure paths: a failed resolution is re-run when any of
/// the paths it probed is created later.
#[derive(Debug)]
pub struct ResolveResult {
  pub result: Result<(Resolution, Option<String>), ResolverError>,
  pub side_effects: bool,
  /// Paths that were probed but absent; creating any of them changes the result.
  pub invalidate_on_file_create: Vec<PathBuf>,
  /// Files whose contents influenced the result.
  pub invalidate_on_file_change: Vec<PathBuf>,
}

const KNOWN_SCHEMES: &[&str] = &[
  "blob", "data", "ftp", "http", "https", "mailto", "tel", "ws", "wss",
];

const MAX_ALIAS_DEPTH: u8 = 8;

pub struct Resolver {
  pub fs: Arc<dyn FileSystem>,
  pub project_root: PathBuf,
  /// Extensions tried when a path has no match, without the leading dot.
  pub extensions: Vec<String>,
  pub index_file: String,
  pub conditions: ExportsCondition,
  pub include_node_modules: IncludeNodeModules,
  pub packages: PackageJsonCache,
}

impl Resolver {
  pub fn new(project_root: PathBuf, fs: Arc<dyn FileSystem>) -> Self {
    Resolver {
      fs,
      project_root,
      extensions: vec!["js".into(), "jsx".into(), "ts".into(), "tsx".into(), "json".into()],
      index_file: "index".into(),
      conditions: ExportsCondition::empty(),
      include_node_modules: IncludeNodeModules::default(),
      packages: PackageJsonCache::new(),
    }
  }

  pub fn resolve(&self, specifier: &str, from: &Path, specifier_type: SpecifierType) -> ResolveResult {
    let mut ctx = ResolveContext {
      resolver: self,
      invalidate_on_file_create: Vec::new(),
      invalidate_on_file_change: Vec::new(),
      alias_depth: 0,
    };

    let result = Specifier::parse(specifier, specifier_type)
      .map_err(ResolverError::from)
      .and_then(|(parsed, query)| {
        ctx
          .resolve_specifier(parsed, from)
          .map(|resolution| (resolution, query.map(|q| q.to_string())))
      });

    let side_effects = match &result {
      Ok((Resolution::Path(path), _)) => ctx.side_effects(path),
      _ => true,
    };

    ResolveResult {
      result,
      side_effects,
      invalidate_on_file_create: ctx.invalidate_on_file_create,
      invalidate_on_file_change: ctx.invalidate_on_file_change,
    }
  }

  /// Whether importing the given resolved file may have side effects,
  /// according to the nearest package.json.
  pub fn side_effects(&self, path: &Path) -> bool {
    let dir = path.parent().unwrap_or(Path::new("/"));
    match self.packages.find_package(&*self.fs, dir) {
      Some((_, pkg)) => match &*pkg {
        Ok(pkg) => pkg.has_side_effects(path),
        Err(_) => true,
      },
      None => true,
    }
  }
}

struct ResolveContext<'r> {
  resolver: &'r Resolver,
  invalidate_on_file_create: Vec<PathBuf>,
  invalidate_on_file_change: Vec<PathBuf>,
  alias_depth: u8,
}

impl<'r> ResolveContext<'r> {
  fn file_exists(&mut self, path: &Path) -> bool {
    if self.resolver.fs.is_file(path) {
      true
    } else {
      self.invalidate_on_file_create.push(path.to_path_buf());
      false
    }
  }

  fn read_package(&mut self, path: &Path) -> Arc<Result<PackageJson, ResolverError>> {
    self.invalidate_on_file_change.push(path.to_path_buf());
    self.resolver.packages.read_package(&*self.resolver.fs, path)
  }

  fn side_effects(&self, path: &Path) -> bool {
    self.resolver.side_effects(path)
  }

  fn resolve_specifier(
    &mut self,
    specifier: Specifier,
    from: &Path,
  ) -> Result<Resolution, ResolverError> {
    match specifier {
      Specifier::Builtin(name) => {
        if self.resolver.conditions.contains(ExportsCondition::NODE) {
          Ok(Resolution::Builtin(name.into_owned()))
        } else {
          Ok(Resolution::Empty)
        }
      }
      Specifier::Url(url) => match parse_scheme(url) {
        Some((scheme, _)) if KNOWN_SCHEMES.contains(&scheme) => Ok(Resolution::External),
        Some((scheme, _)) => Err(ResolverError::UnknownScheme {
          scheme: scheme.to_string(),
        }),
        None => {
          // A bare URL specifier is a relative path in disguise.
          let resolved = from_dir(from).join(url);
          self.load_path(&resolved, from)
        }
      },
      Specifier::Relative(path) => {
        let resolved = from_dir(from).join(path);
        self.load_path(&resolved, from)
      }
      Specifier::Absolute(path) => self.load_path(&path, from),
      Specifier::Tilde(path) => {
        let resolved = self.resolver.project_root.join(path);
        self.load_path(&resolved, from)
      }
      Specifier::Hash(name) => self.resolve_hash(&name, from),
      Specifier::Package(name, subpath) => self.resolve_package(&name, &subpath, from),
    }
  }

  fn resolve_hash(&mut self, name: &str, from: &Path) -> Result<Resolution, ResolverError> {
    let Some((pkg_path, pkg)) = self
      .resolver
      .packages
      .find_package(&*self.resolver.fs, from_dir(from))
    else {
      return Err(ResolverError::PackageJsonNotFound {
        from: from.to_path_buf(),
      });
    };
    self.invalidate_on_file_change.push(pkg_path);
    let pkg = match &*pkg {
      Ok(pkg) => pkg,
      Err(err) => return Err(err.clone()),
    };

    match pkg.resolve_imports(name, self.resolver.conditions) {
      Ok(ExportsResolution::Path(path)) => self.load_path(&path, from),
      Ok(ExportsResolution::Package(specifier)) => {
        // Recursion is bounded: a package target cannot be another hash import.
        let (parsed, _) = Specifier::parse(&specifier, SpecifierType::Esm)?;
        self.resolve_specifier(parsed, from)
      }
      Ok(ExportsResolution::None) | Err(PackageJsonError::ImportNotDefined) => {
        Err(ResolverError::PackageExportsError {
          module: format!("#{}", name),
          package_path: pkg.path.clone(),
          error: PackageJsonError::ImportNotDefined,
        })
      }
      Err(error) => Err(ResolverError::PackageExportsError {
        module: format!("#{}", name),
        package_path: pkg.path.clone(),
        error,
      }),
    }
  }

  fn resolve_package(
    &mut self,
    name: &str,
    subpath: &str,
    from: &Path,
  ) -> Result<Resolution, ResolverError> {
    let full_specifier = if subpath.is_empty() {
      name.to_string()
    } else {
      format!("{}/{}", name, subpath)
    };

    // Aliases in the nearest package.json take precedence over node_modules.
    if let Some((pkg_path, pkg)) = self
      .resolver
      .packages
      .find_package(&*self.resolver.fs, from_dir(from))
    {
      if let Ok(pkg) = &*pkg {
        let alias = pkg
          .resolve_aliases(&full_specifier, self.resolver.conditions)
          .cloned();
        if let Some(alias) = alias {
          self.invalidate_on_file_change.push(pkg_path);
          let base = pkg.dir().to_path_buf();
          return self.apply_alias(&alias, &base, from);
        }
      }
    }

    if !self.resolver.include_node_modules.includes(name) {
      return Ok(Resolution::External);
    }

    for dir in from_dir(from).ancestors() {
      let pkg_dir = dir.join("node_modules").join(name);
      let pkg_json_path = pkg_dir.join("package.json");
      if self.file_exists(&pkg_json_path) {
        let pkg = self.read_package(&pkg_json_path);
        let pkg = match &*pkg {
          Ok(pkg) => pkg.clone(),
          Err(err) => return Err(err.clone()),
        };
        return self.resolve_in_package(&pkg, name, subpath, from);
      }
      if dir.file_name().map_or(false, |n| n == "node_modules") {
        break;
      }
    }

    Err(ResolverError::ModuleNotFound {
      module: name.to_string(),
    })
  }

  fn apply_alias(
    &mut self,
    alias: &AliasValue,
    base_dir: &Path,
    from: &Path,
  ) -> Result<Resolution, ResolverError> {
    let describe = || match alias {
      AliasValue::Specifier(target) => target.clone(),
      AliasValue::Bool(b) => b.to_string(),
    };
    self.alias_depth += 1;
    if self.alias_depth > MAX_ALIAS_DEPTH {
      return Err(ResolverError::InvalidAlias { alias: describe() });
    }
    match alias {
      AliasValue::Bool(false) => Ok(Resolution::Empty),
      AliasValue::Bool(true) => Err(ResolverError::InvalidAlias { alias: describe() }),
      AliasValue::Specifier(target) => {
        if target.starts_with('.') {
          let resolved = base_dir.join(target);
          self.load_path(&resolved, from)
        } else {
          let (parsed, _) = Specifier::parse(target, SpecifierType::Esm)?;
          self.resolve_specifier(parsed, from)
        }
      }
    }
  }

  fn resolve_in_package(
    &mut self,
    pkg: &PackageJson,
    module: &str,
    subpath: &str,
    from: &Path,
  ) -> Result<Resolution, ResolverError> {
    if pkg.has_exports() {
      return match pkg.resolve_exports(subpath, self.resolver.conditions) {
        Ok(ExportsResolution::Path(path)) => {
          if self.file_exists(&path) {
            Ok(Resolution::Path(path))
          } else {
            Err(ResolverError::PackageEntryNotFound {
              module: module.to_string(),
              missing: path,
              package_path: pkg.path.clone(),
              field: None,
            })
          }
        }
        Ok(ExportsResolution::Package(specifier)) => {
          let (parsed, _) = Specifier::parse(&specifier, SpecifierType::Esm)?;
          self.resolve_specifier(parsed, &pkg.path)
        }
        Ok(ExportsResolution::None) => unreachable!(),
        Err(error) => Err(ResolverError::PackageExportsError {
          module: module.to_string(),
          package_path: pkg.path.clone(),
          error,
        }),
      };
    }

    if subpath.is_empty() {
      let entries = pkg.entries(self.resolver.conditions);
      for (entry, _) in &entries {
        if let Some(resolution) = self.load_file_or_dir(entry)? {
          return Ok(resolution);
        }
      }
      if let Some(path) = self.load_index(pkg.dir()) {
        return Ok(Resolution::Path(path));
      }
      if let Some((entry, field)) = entries.into_iter().next() {
        return Err(ResolverError::PackageEntryNotFound {
          module: module.to_string(),
          missing: entry,
          package_path: pkg.path.clone(),
          field: Some(field),
        });
      }
      return Err(ResolverError::PackageEntryNotFound {
        module: module.to_string(),
        missing: pkg.dir().join(&self.resolver.index_file),
        package_path: pkg.path.clone(),
        field: Some("main"),
      });
    }

    let path = pkg.dir().join(subpath);
    match self.load_file_or_dir(&path)? {
      Some(resolution) => Ok(resolution),
      None => Err(ResolverError::PackageEntryNotFound {
        module: module.to_string(),
        missing: path,
        package_path: pkg.path.clone(),
        field: None,
      }),
    }
  }

  fn load_path(&mut self, path: &Path, from: &Path) -> Result<Resolution, ResolverError> {
    // The browser field of the owning package may remap project files.
    if let Some((pkg_path, pkg)) = self
      .resolver
      .packages
      .find_package(&*self.resolver.fs, path.parent().unwrap_or(path))
    {
      if let Ok(pkg) = &*pkg {
        if let Ok(relative) = path.strip_prefix(pkg.dir()) {
          let key = format!("./{}", relative.to_string_lossy().replace('\\', "/"));
          let alias = pkg.resolve_aliases(&key, self.resolver.conditions).cloned();
          if let Some(alias) = alias {
            self.invalidate_on_file_change.push(pkg_path);
            let base = pkg.dir().to_path_buf();
            return self.apply_alias(&alias, &base, from);
          }
        }
      }
    }

    if let Some(resolution) = self.load_file_or_dir(path)? {
      return Ok(resolution);
    }

    Err(ResolverError::FileNotFound {
      missing: path.to_path_buf(),
      from: from.to_path_buf(),
      alternatives: find_alternatives(&*self.resolver.fs, path),
    })
  }

  fn load_file_or_dir(&mut self, path: &Path) -> Result<Option<Resolution>, ResolverError> {
    if let Some(found) = self.load_file(path) {
      return Ok(Some(Resolution::Path(found)));
    }
    if self.resolver.fs.is_dir(path) {
      return self.load_directory(path);
    }
    Ok(None)
  }

  fn load_file(&mut self, path: &Path) -> Option<PathBuf> {
    if self.file_exists(path) {
      return Some(path.to_path_buf());
    }
    for ext in &self.resolver.extensions.clone() {
      let mut candidate = path.as_os_str().to_os_string();
      candidate.push(".");
      candidate.push(ext);
      let candidate = PathBuf::from(candidate);
      if self.file_exists(&candidate) {
        return Some(candidate);
      }
    }
    None
  }

  fn load_directory(&mut self, dir: &Path) -> Result<Option<Resolution>, ResolverError> {
    let pkg_json_path = dir.join("package.json");
    if self.file_exists(&pkg_json_path) {
      let pkg = self.read_package(&pkg_json_path);
      if let Ok(pkg) = &*pkg {
        if pkg.has_exports() {
          if let Ok(ExportsResolution::Path(path)) =
            pkg.resolve_exports("", self.resolver.conditions)
          {
            if self.file_exists(&path) {
              return Ok(Some(Resolution::Path(path)));
            }
          }
        }
        for (entry, _) in pkg.entries(self.resolver.conditions) {
          if let Some(found) = self.load_file(&entry) {
            return Ok(Some(Resolution::Path(found)));
          }
        }
      }
    }
    Ok(self.load_index(dir).map(Resolution::Path))
  }

  fn load_index(&mut self, dir: &Path) -> Option<PathBuf> {
    self.load_file(&dir.join(&self.resolver.index_file))
  }
}

fn from_dir(from: &Path) -> &Path {
  from.parent().unwrap_or(Path::new("/"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;
  use std::collections::HashMap;

  #[derive(Default)]
  struct TestFs {
    files: Mutex<HashMap<PathBuf, String>>,
  }

  impl TestFs {
    fn with(files: &[(&str, &str)]) -> Arc<TestFs> {
      let fs = TestFs::default();
      {
        let mut map = fs.files.lock();
        for (path, contents) in files {
          map.insert(PathBuf::from(path), contents.to_string());
        }
      }
      Arc::new(fs)
    }
  }

  impl FileSystem for TestFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
      self
        .files
        .lock()
        .get(path)
        .cloned()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn is_file(&self, path: &Path) -> bool {
      self.files.lock().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
      let files = self.files.lock();
      files.keys().any(|p| p.starts_with(path) && p != path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
      let files = self.files.lock();
      Ok(
        files
          .keys()
          .filter_map(|p| p.strip_prefix(path).ok())
          .filter_map(|p| p.components().next())
          .filter_map(|c| c.as_os_str().to_str().map(|s| s.to_string()))
          .collect(),
      )
    }
  }

  fn resolver(fs: Arc<TestFs>) -> Resolver {
    Resolver::new("/app".into(), fs)
  }

  fn resolution(result: &ResolveResult) -> &Resolution {
    &result.result.as_ref().unwrap().0
  }

  #[test]
  fn resolves_relative_with_extensions() {
    let fs = TestFs::with(&[("/app/src/index.js", ""), ("/app/src/nested/test.js", "")]);
    let resolver = resolver(fs);
    let result =
      resolver.resolve("./nested/test", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert_eq!(
      *resolution(&result),
      Resolution::Path("/app/src/nested/test.js".into())
    );
  }

  #[test]
  fn records_probed_paths() {
    let fs = TestFs::with(&[("/app/src/index.js", ""), ("/app/src/foo.ts", "")]);
    let resolver = resolver(fs);
    let result = resolver.resolve("./foo", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert!(result.result.is_ok());
    // Paths probed before the match must be recorded for create-invalidation.
    assert!(result
      .invalidate_on_file_create
      .contains(&PathBuf::from("/app/src/foo")));
    assert!(result
      .invalidate_on_file_create
      .contains(&PathBuf::from("/app/src/foo.js")));
  }

  #[test]
  fn file_not_found_has_alternatives() {
    let fs = TestFs::with(&[("/app/src/index.js", ""), ("/app/src/test.js", "")]);
    let resolver = resolver(fs);
    let err = resolver
      .resolve("./tets.js", Path::new("/app/src/index.js"), SpecifierType::Esm)
      .result
      .unwrap_err();
    match err {
      ResolverError::FileNotFound { alternatives, .. } => {
        assert_eq!(alternatives, vec!["test.js".to_string()]);
      }
      other => panic!("unexpected error: {:?}", other),
    }
  }

  #[test]
  fn resolves_node_modules_main() {
    let fs = TestFs::with(&[
      ("/app/src/index.js", ""),
      (
        "/app/node_modules/dep/package.json",
        r#"{"name": "dep", "main": "lib/entry.js"}"#,
      ),
      ("/app/node_modules/dep/lib/entry.js", ""),
    ]);
    let resolver = resolver(fs);
    let result = resolver.resolve("dep", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert_eq!(
      *resolution(&result),
      Resolution::Path("/app/node_modules/dep/lib/entry.js".into())
    );
  }

  #[test]
  fn resolves_exports_with_conditions() {
    let fs = TestFs::with(&[
      ("/app/src/index.js", ""),
      (
        "/app/node_modules/dep/package.json",
        r#"{"name": "dep", "exports": {"browser": "./browser.js", "default": "./node.js"}}"#,
      ),
      ("/app/node_modules/dep/browser.js", ""),
      ("/app/node_modules/dep/node.js", ""),
    ]);
    let mut resolver = resolver(fs);
    resolver.conditions = ExportsCondition::BROWSER;
    let result = resolver.resolve("dep", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert_eq!(
      *resolution(&result),
      Resolution::Path("/app/node_modules/dep/browser.js".into())
    );
  }

  #[test]
  fn module_not_found() {
    let fs = TestFs::with(&[("/app/src/index.js", "")]);
    let resolver = resolver(fs);
    let err = resolver
      .resolve("missing", Path::new("/app/src/index.js"), SpecifierType::Esm)
      .result
      .unwrap_err();
    assert_eq!(
      err,
      ResolverError::ModuleNotFound {
        module: "missing".into()
      }
    );
  }

  #[test]
  fn builtins_by_environment() {
    let fs = TestFs::with(&[("/app/src/index.js", "")]);
    let mut resolver = resolver(fs);
    let result = resolver.resolve("fs", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert_eq!(*resolution(&result), Resolution::Empty);

    resolver.conditions = ExportsCondition::NODE;
    let result = resolver.resolve("fs", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert_eq!(*resolution(&result), Resolution::Builtin("fs".into()));
  }

  #[test]
  fn excluded_node_modules_are_external() {
    let fs = TestFs::with(&[("/app/src/index.js", "")]);
    let mut resolver = resolver(fs);
    resolver.include_node_modules = IncludeNodeModules::Bool(false);
    let result = resolver.resolve("react", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert_eq!(*resolution(&result), Resolution::External);
  }

  #[test]
  fn side_effects_false_from_package() {
    let fs = TestFs::with(&[
      ("/app/src/index.js", ""),
      (
        "/app/node_modules/pure/package.json",
        r#"{"name": "pure", "main": "index.js", "sideEffects": false}"#,
      ),
      ("/app/node_modules/pure/index.js", ""),
    ]);
    let resolver = resolver(fs);
    let result = resolver.resolve("pure", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert!(!result.side_effects);
  }

  #[test]
  fn alias_to_empty() {
    let fs = TestFs::with(&[
      ("/app/package.json", r#"{"name": "app", "alias": {"fs-extra": false}}"#),
      ("/app/src/index.js", ""),
    ]);
    let resolver = resolver(fs);
    let result =
      resolver.resolve("fs-extra", Path::new("/app/src/index.js"), SpecifierType::Esm);
    assert_eq!(*resolution(&result), Resolution::Empty);
  }
}
