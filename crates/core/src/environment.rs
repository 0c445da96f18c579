use std::{num::NonZeroU16, str::FromStr, sync::OnceLock};

use baler_resolver::{ExportsCondition, IncludeNodeModules};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{
  intern::{Intern, Interner},
  types::{impl_bitflags_serde, stable_hash, BuildMode, SourceLocation},
};

#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
  pub context: EnvironmentContext,
  pub output_format: OutputFormat,
  pub source_type: SourceType,
  pub flags: EnvironmentFlags,
  pub source_map: Option<TargetSourceMapOptions>,
  pub loc: Option<SourceLocation>,
  pub include_node_modules: IncludeNodeModules,
  pub engines: Engines,
}

impl std::hash::Hash for Environment {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    // Doesn't include loc.
    self.context.hash(state);
    self.output_format.hash(state);
    self.source_type.hash(state);
    self.flags.hash(state);
    self.source_map.hash(state);
    self.include_node_modules.hash(state);
    self.engines.hash(state);
  }
}

impl PartialEq for Environment {
  fn eq(&self, other: &Self) -> bool {
    // Doesn't include loc.
    self.context == other.context
      && self.output_format == other.output_format
      && self.source_type == other.source_type
      && self.flags == other.flags
      && self.source_map == other.source_map
      && self.include_node_modules == other.include_node_modules
      && self.engines == other.engines
  }
}

impl Default for Environment {
  fn default() -> Self {
    Environment {
      context: EnvironmentContext::Browser,
      output_format: OutputFormat::Global,
      source_type: SourceType::Module,
      flags: EnvironmentFlags::empty(),
      source_map: None,
      loc: None,
      include_node_modules: IncludeNodeModules::default(),
      engines: Engines::default(),
    }
  }
}

impl Environment {
  /// Structural identity, excluding loc. Interchangeable environments share it.
  pub fn id(&self) -> u64 {
    stable_hash(self)
  }

  /// The package.json exports conditions implied by this environment and the
  /// current build mode. Used to filter entry fields and `exports` targets.
  pub fn exports_conditions(&self, mode: BuildMode) -> ExportsCondition {
    let mut conditions = ExportsCondition::IMPORT | ExportsCondition::MODULE;
    if self.context.is_node() {
      conditions |= ExportsCondition::NODE;
    }
    if self.context.is_browser() {
      conditions |= ExportsCondition::BROWSER;
    }
    if self.context.is_worker() {
      conditions |= ExportsCondition::WORKER;
    }
    if self.context.is_electron() {
      conditions |= ExportsCondition::ELECTRON;
    }
    conditions |= match mode {
      BuildMode::Development => ExportsCondition::DEVELOPMENT,
      BuildMode::Production => ExportsCondition::PRODUCTION,
    };
    conditions
  }
}

#[derive(PartialEq, Eq, Clone, Debug, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSourceMapOptions {
  pub source_root: Option<String>,
  pub inline: Option<bool>,
  pub inline_sources: Option<bool>,
}

#[derive(PartialEq, Eq, Clone, Debug, Hash, Default, Serialize, Deserialize)]
pub struct Engines {
  #[serde(default)]
  pub browsers: Browsers,
  pub electron: Option<Version>,
  pub node: Option<Version>,
}

#[derive(PartialEq, Clone, Copy, PartialOrd, Ord, Eq, Hash)]
pub struct Version(NonZeroU16);

impl Version {
  pub fn new(major: NonZeroU16, minor: u16) -> Self {
    Version(NonZeroU16::new((major.get() & 0xff) << 8 | (minor & 0xff)).unwrap())
  }

  pub fn major(&self) -> u16 {
    self.0.get() >> 8
  }

  pub fn minor(&self) -> u16 {
    self.0.get() & 0xff
  }
}

impl FromStr for Version {
  type Err = ();

  fn from_str(version: &str) -> Result<Self, Self::Err> {
    let version = version
      .trim_start_matches(">=")
      .trim_start_matches('^')
      .trim();
    let version = version.split('-').next().ok_or(())?;

    let mut parts = version.split('.');
    let major = parts.next().and_then(|v| v.parse::<NonZeroU16>().ok());
    if let Some(major) = major {
      let minor = parts.next().and_then(|v| v.parse::<u16>().ok()).unwrap_or(0);
      return Ok(Version::new(major, minor));
    }

    Err(())
  }
}

impl std::fmt::Display for Version {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, ">= {}", self.major())?;
    if self.minor() > 0 {
      write!(f, ".{}", self.minor())?;
    }
    Ok(())
  }
}

impl std::fmt::Debug for Version {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.major())?;
    if self.minor() > 0 {
      write!(f, ".{}", self.minor())?;
    }
    Ok(())
  }
}

impl serde::Serialize for Version {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    format!("{}", self).serialize(serializer)
  }
}

impl<'de> serde::Deserialize<'de> for Version {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let v: String = serde::Deserialize::deserialize(deserializer)?;
    Version::from_str(&v).map_err(|_| serde::de::Error::custom("invalid version range"))
  }
}

#[derive(Default, PartialEq, Eq, Clone, Debug, Hash, Serialize, Deserialize)]
pub struct Browsers {
  pub android: Option<Version>,
  pub chrome: Option<Version>,
  pub edge: Option<Version>,
  pub firefox: Option<Version>,
  pub ie: Option<Version>,
  pub ios_saf: Option<Version>,
  pub opera: Option<Version>,
  pub safari: Option<Version>,
  pub samsung: Option<Version>,
}

impl Browsers {
  /// Parses entries of the form "chrome 61" or "firefox >= 60", keeping the
  /// lowest version seen per browser.
  pub fn parse(entries: &[String]) -> Browsers {
    let mut browsers = Browsers::default();
    for entry in entries {
      let mut parts = entry.split_whitespace();
      let (Some(name), Some(version)) = (parts.next(), parts.last()) else {
        continue;
      };
      let Ok(version) = version.parse::<Version>() else {
        continue;
      };

      macro_rules! browser {
        ($browser: ident) => {{
          if browsers.$browser.map_or(true, |v| version < v) {
            browsers.$browser = Some(version);
          }
        }};
      }

      match name {
        "android" => browser!(android),
        "chrome" | "and_chr" => browser!(chrome),
        "edge" => browser!(edge),
        "firefox" | "and_ff" => browser!(firefox),
        "ie" => browser!(ie),
        "ios_saf" => browser!(ios_saf),
        "opera" | "op_mob" => browser!(opera),
        "safari" => browser!(safari),
        "samsung" => browser!(samsung),
        _ => {}
      }
    }
    browsers
  }

  pub fn is_empty(&self) -> bool {
    *self == Browsers::default()
  }
}

pub enum EnvironmentFeature {
  Esmodules,
  DynamicImport,
  WorkerModule,
  GlobalThis,
}

impl EnvironmentFeature {
  pub fn engines(&self) -> Engines {
    macro_rules! version {
      ($major: expr, $minor: expr) => {
        Some(Version::new(NonZeroU16::new($major).unwrap(), $minor))
      };
    }

    match self {
      EnvironmentFeature::Esmodules => Engines {
        browsers: Browsers {
          edge: version!(16, 0),
          firefox: version!(60, 0),
          chrome: version!(61, 0),
          safari: version!(11, 0),
          opera: version!(48, 0),
          ios_saf: version!(11, 0),
          android: version!(76, 0),
          samsung: version!(8, 2),
          ..Default::default()
        },
        ..Default::default()
      },
      EnvironmentFeature::DynamicImport => Engines {
        browsers: Browsers {
          edge: version!(76, 0),
          firefox: version!(67, 0),
          chrome: version!(63, 0),
          safari: version!(11, 1),
          opera: version!(50, 0),
          ios_saf: version!(11, 3),
          android: version!(63, 0),
          samsung: version!(8, 0),
          ..Default::default()
        },
        ..Default::default()
      },
      EnvironmentFeature::WorkerModule => Engines {
        browsers: Browsers {
          edge: version!(80, 0),
          chrome: version!(80, 0),
          opera: version!(67, 0),
          android: version!(81, 0),
          ..Default::default()
        },
        ..Default::default()
      },
      EnvironmentFeature::GlobalThis => Engines {
        browsers: Browsers {
          edge: version!(79, 0),
          firefox: version!(65, 0),
          chrome: version!(71, 0),
          safari: version!(12, 1),
          opera: version!(58, 0),
          ios_saf: version!(12, 2),
          android: version!(71, 0),
          samsung: version!(10, 1),
          ..Default::default()
        },
        ..Default::default()
      },
    }
  }
}

impl Engines {
  pub fn supports(&self, feature: EnvironmentFeature) -> bool {
    let min = feature.engines();
    macro_rules! check {
      ($p: ident$(. $x: ident)*) => {{
        if let Some(v) = self.$p$(.$x)* {
          match min.$p$(.$x)* {
            None => return false,
            Some(v2) if v < v2 => return false,
            _ => {}
          }
        }
      }};
    }

    check!(browsers.android);
    check!(browsers.chrome);
    check!(browsers.edge);
    check!(browsers.firefox);
    check!(browsers.ie);
    check!(browsers.ios_saf);
    check!(browsers.opera);
    check!(browsers.safari);
    check!(browsers.samsung);
    true
  }
}

bitflags! {
  #[derive(Clone, Copy, Hash, Debug, PartialEq, Eq)]
  pub struct EnvironmentFlags: u8 {
    const IS_LIBRARY = 1 << 0;
    const SHOULD_OPTIMIZE = 1 << 1;
    const SHOULD_SCOPE_HOIST = 1 << 2;
  }
}

impl_bitflags_serde!(EnvironmentFlags);

#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Serialize_repr, Deserialize_repr, Default)]
#[repr(u8)]
pub enum EnvironmentContext {
  #[default]
  Browser = 0,
  WebWorker = 1,
  ServiceWorker = 2,
  Worklet = 3,
  Node = 4,
  ElectronMain = 5,
  ElectronRenderer = 6,
}

impl EnvironmentContext {
  pub fn as_str(&self) -> &'static str {
    match self {
      EnvironmentContext::Browser => "browser",
      EnvironmentContext::WebWorker => "web-worker",
      EnvironmentContext::ServiceWorker => "service-worker",
      EnvironmentContext::Worklet => "worklet",
      EnvironmentContext::Node => "node",
      EnvironmentContext::ElectronMain => "electron-main",
      EnvironmentContext::ElectronRenderer => "electron-renderer",
    }
  }

  pub fn is_node(&self) -> bool {
    use EnvironmentContext::*;
    matches!(self, Node | ElectronMain | ElectronRenderer)
  }

  pub fn is_browser(&self) -> bool {
    use EnvironmentContext::*;
    matches!(
      self,
      Browser | WebWorker | ServiceWorker | Worklet | ElectronRenderer
    )
  }

  pub fn is_worker(&self) -> bool {
    use EnvironmentContext::*;
    matches!(self, WebWorker | ServiceWorker)
  }

  pub fn is_electron(&self) -> bool {
    use EnvironmentContext::*;
    matches!(self, ElectronMain | ElectronRenderer)
  }
}

impl FromStr for EnvironmentContext {
  type Err = ();

  fn from_str(context: &str) -> Result<Self, Self::Err> {
    match context {
      "browser" => Ok(EnvironmentContext::Browser),
      "web-worker" => Ok(EnvironmentContext::WebWorker),
      "service-worker" => Ok(EnvironmentContext::ServiceWorker),
      "worklet" => Ok(EnvironmentContext::Worklet),
      "node" => Ok(EnvironmentContext::Node),
      "electron-main" => Ok(EnvironmentContext::ElectronMain),
      "electron-renderer" => Ok(EnvironmentContext::ElectronRenderer),
      _ => Err(()),
    }
  }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Serialize_repr, Deserialize_repr, Default)]
#[repr(u8)]
pub enum SourceType {
  #[default]
  Module = 0,
  Script = 1,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Serialize_repr, Deserialize_repr, Default)]
#[repr(u8)]
pub enum OutputFormat {
  #[default]
  Global = 0,
  Commonjs = 1,
  Esmodule = 2,
}

impl FromStr for OutputFormat {
  type Err = ();

  fn from_str(format: &str) -> Result<Self, Self::Err> {
    match format {
      "global" => Ok(OutputFormat::Global),
      "commonjs" => Ok(OutputFormat::Commonjs),
      "esmodule" => Ok(OutputFormat::Esmodule),
      _ => Err(()),
    }
  }
}

impl Intern for Environment {
  fn interner() -> &'static Interner<Environment> {
    static INTERNER: OnceLock<Interner<Environment>> = OnceLock::new();
    INTERNER.get_or_init(Interner::new)
  }
}

pub fn reset_env_interner() {
  Environment::interner().clear();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn version_parsing() {
    let v: Version = "14.2".parse().unwrap();
    assert_eq!((v.major(), v.minor()), (14, 2));
    let v: Version = ">=61".parse().unwrap();
    assert_eq!((v.major(), v.minor()), (61, 0));
    assert!("garbage".parse::<Version>().is_err());
  }

  #[test]
  fn id_excludes_loc() {
    let a = Environment::default();
    let mut b = Environment::default();
    b.loc = Some(SourceLocation {
      file_path: "/app/package.json".into(),
      start: crate::types::Location { line: 1, column: 1 },
      end: crate::types::Location { line: 1, column: 2 },
    });
    assert_eq!(a.id(), b.id());
    assert_eq!(a, b);
  }

  #[test]
  fn engines_feature_support() {
    let engines = Engines {
      browsers: Browsers::parse(&["chrome 80".into()]),
      ..Default::default()
    };
    assert!(engines.supports(EnvironmentFeature::Esmodules));
    assert!(engines.supports(EnvironmentFeature::WorkerModule));

    let engines = Engines {
      browsers: Browsers::parse(&["chrome 70".into()]),
      ..Default::default()
    };
    assert!(!engines.supports(EnvironmentFeature::WorkerModule));
  }
}
