use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::{impl_bitflags_serde, SourceLocation};
use crate::intern::Interned;

/// A module-level binding. On an asset, `exported` is the public name and
/// `local` the binding behind it. On a dependency, `exported` is the name as
/// imported from the target module and `local` the binding it lands in.
/// `"*"` denotes the namespace object on either side.
#[derive(PartialEq, Clone, Debug, Serialize, Deserialize, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
  pub exported: Interned<String>,
  pub local: Interned<String>,
  #[serde(default)]
  pub loc: Option<SourceLocation>,
  pub flags: SymbolFlags,
}

impl Symbol {
  pub fn new(exported: &str, local: &str) -> Symbol {
    Symbol {
      exported: exported.into(),
      local: local.into(),
      loc: None,
      flags: SymbolFlags::empty(),
    }
  }

  pub fn weak(mut self) -> Symbol {
    self.flags |= SymbolFlags::IS_WEAK;
    self
  }

  pub fn is_weak(&self) -> bool {
    self.flags.contains(SymbolFlags::IS_WEAK)
  }
}

bitflags! {
  #[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
  pub struct SymbolFlags: u8 {
    /// The symbol only re-exports from another module and may be elided.
    const IS_WEAK = 1 << 0;
    const IS_ESM = 1 << 1;
  }
}

impl_bitflags_serde!(SymbolFlags);
