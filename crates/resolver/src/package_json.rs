use std::path::{Component, Path, PathBuf};

use bitflags::bitflags;
use glob_match::glob_match;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ResolverError;

bitflags! {
  /// Conditions used to filter package.json `exports` and `imports` targets.
  #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
  pub struct ExportsCondition: u16 {
    const IMPORT = 1 << 0;
    const REQUIRE = 1 << 1;
    const MODULE = 1 << 2;
    const NODE = 1 << 3;
    const BROWSER = 1 << 4;
    const WORKER = 1 << 5;
    const WORKLET = 1 << 6;
    const ELECTRON = 1 << 7;
    const DEVELOPMENT = 1 << 8;
    const PRODUCTION = 1 << 9;
    const DEFAULT = 1 << 10;
    const STYLE = 1 << 11;
    const SASS = 1 << 12;
  }
}

impl serde::Serialize for ExportsCondition {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    self.bits().serialize(serializer)
  }
}

impl<'de> serde::Deserialize<'de> for ExportsCondition {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let bits = u16::deserialize(deserializer)?;
    Ok(ExportsCondition::from_bits_truncate(bits))
  }
}

impl TryFrom<&str> for ExportsCondition {
  type Error = ();

  fn try_from(value: &str) -> Result<Self, Self::Error> {
    Ok(match value {
      "import" => ExportsCondition::IMPORT,
      "require" => ExportsCondition::REQUIRE,
      "module" => ExportsCondition::MODULE,
      "node" => ExportsCondition::NODE,
      "browser" => ExportsCondition::BROWSER,
      "worker" => ExportsCondition::WORKER,
      "worklet" => ExportsCondition::WORKLET,
      "electron" => ExportsCondition::ELECTRON,
      "development" => ExportsCondition::DEVELOPMENT,
      "production" => ExportsCondition::PRODUCTION,
      "default" => ExportsCondition::DEFAULT,
      "style" => ExportsCondition::STYLE,
      "sass" => ExportsCondition::SASS,
      _ => return Err(()),
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PackageJsonError {
  PackagePathNotExported,
  ImportNotDefined,
  InvalidPackageTarget,
  InvalidSpecifier,
}

/// The subset of package.json fields the resolver consumes.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PackageJson {
  #[serde(skip)]
  pub path: PathBuf,
  pub name: String,
  pub version: Option<String>,
  pub main: Option<String>,
  pub module: Option<String>,
  pub browser: BrowserField,
  pub alias: IndexMap<String, AliasValue>,
  pub exports: serde_json::Value,
  pub imports: IndexMap<String, serde_json::Value>,
  pub side_effects: SideEffects,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum BrowserField {
  #[default]
  None,
  EntryPoint(String),
  Map(IndexMap<String, AliasValue>),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AliasValue {
  Specifier(String),
  Bool(bool),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SideEffects {
  Bool(bool),
  Glob(String),
  Array(Vec<String>),
}

impl Default for SideEffects {
  fn default() -> Self {
    SideEffects::Bool(true)
  }
}

/// The result of resolving an `exports`/`imports` target.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportsResolution {
  None,
  Path(PathBuf),
  Package(String),
}

impl PackageJson {
  pub fn parse(path: PathBuf, contents: &str) -> Result<PackageJson, ResolverError> {
    let mut parsed: PackageJson = serde_json::from_str(contents)
      .map_err(|err| ResolverError::json(path.clone(), &err))?;
    parsed.path = path;
    Ok(parsed)
  }

  pub fn dir(&self) -> &Path {
    self.path.parent().unwrap_or(Path::new("/"))
  }

  pub fn has_exports(&self) -> bool {
    !self.exports.is_null()
  }

  /// Entry point candidates in priority order, as (path, source field) pairs.
  pub fn entries(&self, conditions: ExportsCondition) -> Vec<(PathBuf, &'static str)> {
    let mut entries = Vec::new();
    if conditions.contains(ExportsCondition::BROWSER) {
      if let BrowserField::EntryPoint(browser) = &self.browser {
        entries.push((self.dir().join(browser), "browser"));
      }
    }
    if conditions.contains(ExportsCondition::MODULE) {
      if let Some(module) = &self.module {
        entries.push((self.dir().join(module), "module"));
      }
    }
    if let Some(main) = &self.main {
      entries.push((self.dir().join(main), "main"));
    }
    entries
  }

  /// Resolves a package subpath through the `exports` field.
  pub fn resolve_exports(
    &self,
    subpath: &str,
    conditions: ExportsCondition,
  ) -> Result<ExportsResolution, PackageJsonError> {
    let exports = &self.exports;
    if subpath.is_empty() {
      // Bare "." export. The exports value may be a string, an array, a
      // conditions object, or a subpath map containing ".".
      let target = match exports {
        serde_json::Value::Object(map) if map.keys().any(|k| k.starts_with('.')) => {
          map.get(".").ok_or(PackageJsonError::PackagePathNotExported)?
        }
        other => other,
      };
      return match self.resolve_target(target, "", conditions)? {
        ExportsResolution::None => Err(PackageJsonError::PackagePathNotExported),
        res => Ok(res),
      };
    }

    let serde_json::Value::Object(map) = exports else {
      return Err(PackageJsonError::PackagePathNotExported);
    };

    let key = format!("./{}", subpath);
    if let Some(target) = map.get(&key) {
      return match self.resolve_target(target, "", conditions)? {
        ExportsResolution::None => Err(PackageJsonError::PackagePathNotExported),
        res => Ok(res),
      };
    }

    // Wildcard patterns. The best match is the one with the longest prefix.
    let mut best: Option<(&str, &serde_json::Value, String)> = None;
    for (pattern, target) in map {
      let Some(star) = pattern.find('*') else {
        continue;
      };
      let (prefix, suffix) = (&pattern[..star], &pattern[star + 1..]);
      if key.starts_with(prefix)
        && key.ends_with(suffix)
        && key.len() >= prefix.len() + suffix.len()
      {
        let matched = key[prefix.len()..key.len() - suffix.len()].to_string();
        if best.as_ref().map_or(true, |(p, _, _)| prefix.len() > p.len()) {
          best = Some((&pattern[..star], target, matched));
        }
      }
    }

    if let Some((_, target, matched)) = best {
      return match self.resolve_target(target, &matched, conditions)? {
        ExportsResolution::None => Err(PackageJsonError::PackagePathNotExported),
        res => Ok(res),
      };
    }

    Err(PackageJsonError::PackagePathNotExported)
  }

  /// Resolves a `#`-prefixed import specifier through the `imports` field.
  pub fn resolve_imports(
    &self,
    specifier: &str,
    conditions: ExportsCondition,
  ) -> Result<ExportsResolution, PackageJsonError> {
    let key = format!("#{}", specifier);
    let target = self
      .imports
      .get(&key)
      .ok_or(PackageJsonError::ImportNotDefined)?;
    match self.resolve_target(target, "", conditions)? {
      ExportsResolution::None => Err(PackageJsonError::ImportNotDefined),
      res => Ok(res),
    }
  }

  fn resolve_target(
    &self,
    target: &serde_json::Value,
    pattern_match: &str,
    conditions: ExportsCondition,
  ) -> Result<ExportsResolution, PackageJsonError> {
    match target {
      serde_json::Value::String(target) => {
        let target = target.replace('*', pattern_match);
        if let Some(rel) = target.strip_prefix("./") {
          // Targets may not escape the package directory.
          let path = Path::new(rel);
          if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
            || rel.contains("node_modules")
          {
            return Err(PackageJsonError::InvalidPackageTarget);
          }
          Ok(ExportsResolution::Path(self.dir().join(rel)))
        } else if target.starts_with('/') || target.starts_with("../") {
          Err(PackageJsonError::InvalidPackageTarget)
        } else {
          // A bare specifier: re-export of another package.
          Ok(ExportsResolution::Package(target))
        }
      }
      serde_json::Value::Object(map) => {
        for (condition, value) in map {
          let matches = match condition.as_str() {
            "default" => true,
            c => ExportsCondition::try_from(c)
              .map(|c| conditions.contains(c))
              .unwrap_or(false),
          };
          if matches {
            match self.resolve_target(value, pattern_match, conditions)? {
              ExportsResolution::None => continue,
              res => return Ok(res),
            }
          }
        }
        Ok(ExportsResolution::None)
      }
      serde_json::Value::Array(targets) => {
        for target in targets {
          match self.resolve_target(target, pattern_match, conditions) {
            Ok(ExportsResolution::None) | Err(_) => continue,
            res => return res,
          }
        }
        Err(PackageJsonError::InvalidPackageTarget)
      }
      serde_json::Value::Null => Ok(ExportsResolution::None),
      _ => Err(PackageJsonError::InvalidPackageTarget),
    }
  }

  /// Looks up `alias` and the `browser` map for a specifier or resolved path.
  pub fn resolve_aliases(&self, specifier: &str, conditions: ExportsCondition) -> Option<&AliasValue> {
    if let Some(alias) = lookup_alias(&self.alias, specifier) {
      return Some(alias);
    }
    if conditions.contains(ExportsCondition::BROWSER) {
      if let BrowserField::Map(map) = &self.browser {
        return lookup_alias(map, specifier);
      }
    }
    None
  }

  /// Whether importing the given file may have side effects.
  pub fn has_side_effects(&self, path: &Path) -> bool {
    let relative = match path.strip_prefix(self.dir()) {
      Ok(relative) => relative,
      Err(_) => return true,
    };
    let relative = relative.to_string_lossy().replace('\\', "/");

    let matches = |glob: &str| {
      if glob.contains('/') {
        glob_match(glob, &relative)
      } else {
        // A glob without a separator matches against the basename alone.
        relative
          .rsplit('/')
          .next()
          .map_or(false, |base| glob_match(glob, base))
      }
    };

    match &self.side_effects {
      SideEffects::Bool(b) => *b,
      SideEffects::Glob(glob) => matches(glob),
      SideEffects::Array(globs) => globs.iter().any(|glob| matches(glob)),
    }
  }
}

fn lookup_alias<'a>(map: &'a IndexMap<String, AliasValue>, specifier: &str) -> Option<&'a AliasValue> {
  if let Some(alias) = map.get(specifier) {
    return Some(alias);
  }
  map
    .iter()
    .find(|(key, _)| key.contains('*') && glob_match(key, specifier))
    .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pkg(json: &str) -> PackageJson {
    PackageJson::parse("/app/node_modules/pkg/package.json".into(), json).unwrap()
  }

  #[test]
  fn resolves_string_exports() {
    let pkg = pkg(r#"{"name": "pkg", "exports": "./index.mjs"}"#);
    assert_eq!(
      pkg.resolve_exports("", ExportsCondition::IMPORT).unwrap(),
      ExportsResolution::Path("/app/node_modules/pkg/index.mjs".into())
    );
  }

  #[test]
  fn resolves_conditional_exports() {
    let pkg = pkg(
      r#"{
        "name": "pkg",
        "exports": {
          ".": {"import": "./index.mjs", "require": "./index.cjs", "default": "./index.js"},
          "./feature": {"node": "./feature-node.js", "default": "./feature.js"}
        }
      }"#,
    );
    assert_eq!(
      pkg.resolve_exports("", ExportsCondition::IMPORT).unwrap(),
      ExportsResolution::Path("/app/node_modules/pkg/index.mjs".into())
    );
    assert_eq!(
      pkg
        .resolve_exports("feature", ExportsCondition::NODE)
        .unwrap(),
      ExportsResolution::Path("/app/node_modules/pkg/feature-node.js".into())
    );
    assert_eq!(
      pkg
        .resolve_exports("feature", ExportsCondition::empty())
        .unwrap(),
      ExportsResolution::Path("/app/node_modules/pkg/feature.js".into())
    );
  }

  #[test]
  fn resolves_wildcard_exports() {
    let pkg = pkg(r#"{"name": "pkg", "exports": {"./lib/*": "./src/*.js"}}"#);
    assert_eq!(
      pkg
        .resolve_exports("lib/foo", ExportsCondition::empty())
        .unwrap(),
      ExportsResolution::Path("/app/node_modules/pkg/src/foo.js".into())
    );
  }

  #[test]
  fn not_exported() {
    let pkg = pkg(r#"{"name": "pkg", "exports": {"./a": "./a.js"}}"#);
    assert_eq!(
      pkg.resolve_exports("b", ExportsCondition::empty()),
      Err(PackageJsonError::PackagePathNotExported)
    );
  }

  #[test]
  fn invalid_target() {
    let pkg = pkg(r#"{"name": "pkg", "exports": {"./a": "../outside.js"}}"#);
    assert_eq!(
      pkg.resolve_exports("a", ExportsCondition::empty()),
      Err(PackageJsonError::InvalidPackageTarget)
    );
  }

  #[test]
  fn imports_field() {
    let pkg =
      pkg(r##"{"name": "pkg", "imports": {"#dep": {"node": "dep-node", "default": "./dep.js"}}}"##);
    assert_eq!(
      pkg.resolve_imports("dep", ExportsCondition::NODE).unwrap(),
      ExportsResolution::Package("dep-node".into())
    );
    assert_eq!(
      pkg.resolve_imports("other", ExportsCondition::empty()),
      Err(PackageJsonError::ImportNotDefined)
    );
  }

  #[test]
  fn side_effects_globs() {
    let pkg1 = pkg(r#"{"name": "pkg", "sideEffects": ["*.css"]}"#);
    assert!(pkg1.has_side_effects(Path::new("/app/node_modules/pkg/src/styles.css")));
    assert!(!pkg1.has_side_effects(Path::new("/app/node_modules/pkg/src/index.js")));

    let pkg2 = pkg(r#"{"name": "pkg", "sideEffects": false}"#);
    assert!(!pkg2.has_side_effects(Path::new("/app/node_modules/pkg/index.js")));
  }

  #[test]
  fn browser_map_aliases() {
    let pkg = pkg(r#"{"name": "pkg", "browser": {"./server.js": "./client.js", "fs": false}}"#);
    assert_eq!(
      pkg.resolve_aliases("fs", ExportsCondition::BROWSER),
      Some(&AliasValue::Bool(false))
    );
    assert_eq!(pkg.resolve_aliases("fs", ExportsCondition::NODE), None);
  }
}
