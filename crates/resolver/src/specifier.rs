use std::borrow::Cow;
use std::path::Path;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::builtins::is_builtin;

/// How a specifier string should be interpreted.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpecifierType {
  /// An ES module specifier. Parsed as a URL, but bare specifiers are treated as node_modules.
  #[default]
  Esm,
  /// A CommonJS specifier. Not parsed as a URL.
  CommonJS,
  /// A URL that works as in a browser. Bare specifiers are treated as relative URLs.
  Url,
  /// A custom specifier that must be handled by a custom resolver plugin.
  Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum SpecifierError {
  EmptySpecifier,
  InvalidPath,
  UrlError(String),
}

/// A parsed import specifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Specifier<'a> {
  Relative(Cow<'a, Path>),
  Absolute(Cow<'a, Path>),
  Tilde(Cow<'a, Path>),
  Hash(Cow<'a, str>),
  Package(Cow<'a, str>, Cow<'a, str>),
  Builtin(Cow<'a, str>),
  Url(&'a str),
}

impl<'a> Specifier<'a> {
  /// Parses a specifier, returning the parsed value and an optional query string.
  pub fn parse(
    specifier: &'a str,
    specifier_type: SpecifierType,
  ) -> Result<(Specifier<'a>, Option<&'a str>), SpecifierError> {
    if specifier.is_empty() {
      return Err(SpecifierError::EmptySpecifier);
    }

    Ok(match specifier.as_bytes()[0] {
      b'.' => {
        let specifier = specifier.strip_prefix("./").unwrap_or(specifier);
        let (path, query) = decode_path(specifier, specifier_type);
        (Specifier::Relative(path), query)
      }
      b'~' => {
        let mut specifier = &specifier[1..];
        if specifier.starts_with('/') {
          specifier = &specifier[1..];
        }
        let (path, query) = decode_path(specifier, specifier_type);
        (Specifier::Tilde(path), query)
      }
      b'/' => {
        if specifier.starts_with("//") && specifier_type == SpecifierType::Url {
          // A protocol-relative URL, e.g `url('//example.com/foo.png')`.
          (Specifier::Url(specifier), None)
        } else {
          let (path, query) = decode_path(specifier, specifier_type);
          (Specifier::Absolute(path), query)
        }
      }
      b'#' => (Specifier::Hash(Cow::Borrowed(&specifier[1..])), None),
      _ => {
        // Bare specifier, or a URL with a scheme.
        match parse_scheme(specifier) {
          Some((scheme, rest)) => match scheme {
            "node" => (Specifier::Builtin(Cow::Borrowed(rest)), None),
            "file" => {
              let (path, query) = decode_path(rest, specifier_type);
              (Specifier::Absolute(path), query)
            }
            _ => (Specifier::Url(specifier), None),
          },
          None => match specifier_type {
            SpecifierType::Url => (Specifier::Url(specifier), None),
            SpecifierType::Esm | SpecifierType::CommonJS | SpecifierType::Custom => {
              let (module, subpath) = parse_package(specifier)?;
              if subpath.is_empty() && is_builtin(module) {
                (Specifier::Builtin(Cow::Borrowed(module)), None)
              } else {
                (
                  Specifier::Package(Cow::Borrowed(module), Cow::Borrowed(subpath)),
                  None,
                )
              }
            }
          },
        }
      }
    })
  }
}

/// Splits a specifier into a scheme and the remainder, if it has one.
/// Single-character schemes are rejected so Windows drive letters parse as paths.
pub fn parse_scheme(specifier: &str) -> Option<(&str, &str)> {
  let colon = specifier.find(':')?;
  if colon < 2 {
    return None;
  }
  let scheme = &specifier[..colon];
  if !scheme
    .bytes()
    .enumerate()
    .all(|(i, b)| b.is_ascii_alphabetic() || (i > 0 && (b.is_ascii_digit() || b == b'+' || b == b'-' || b == b'.')))
  {
    return None;
  }
  let mut rest = &specifier[colon + 1..];
  if let Some(stripped) = rest.strip_prefix("//") {
    rest = stripped;
  }
  Some((scheme, rest))
}

fn parse_package(specifier: &str) -> Result<(&str, &str), SpecifierError> {
  let idx = if let Some(rest) = specifier.strip_prefix('@') {
    // Scoped package: the name spans two path segments.
    rest
      .find('/')
      .and_then(|scope_end| {
        rest[scope_end + 1..]
          .find('/')
          .map(|i| 1 + scope_end + 1 + i)
      })
      .unwrap_or(specifier.len())
  } else {
    specifier.find('/').unwrap_or(specifier.len())
  };

  let name = &specifier[..idx];
  if name.is_empty() {
    return Err(SpecifierError::InvalidPath);
  }

  let subpath = if idx < specifier.len() {
    &specifier[idx + 1..]
  } else {
    ""
  };
  Ok((name, subpath))
}

/// Percent-decodes URL-flavoured specifiers and splits off the query string.
fn decode_path(specifier: &str, specifier_type: SpecifierType) -> (Cow<'_, Path>, Option<&str>) {
  match specifier_type {
    SpecifierType::Url | SpecifierType::Esm => {
      let (path, query) = match specifier.find(['?', '#']) {
        Some(idx) if specifier.as_bytes()[idx] == b'?' => {
          (&specifier[..idx], Some(&specifier[idx..]))
        }
        Some(idx) => (&specifier[..idx], None),
        None => (specifier, None),
      };
      match percent_decode_str(path).decode_utf8() {
        Ok(Cow::Borrowed(decoded)) => (Cow::Borrowed(Path::new(decoded)), query),
        Ok(Cow::Owned(decoded)) => (Cow::Owned(decoded.into()), query),
        Err(_) => (Cow::Borrowed(Path::new(path)), query),
      }
    }
    _ => (Cow::Borrowed(Path::new(specifier)), None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_relative() {
    let (spec, query) = Specifier::parse("./foo/bar.js", SpecifierType::Esm).unwrap();
    assert_eq!(spec, Specifier::Relative(Cow::Borrowed(Path::new("foo/bar.js"))));
    assert_eq!(query, None);
  }

  #[test]
  fn parses_query() {
    let (spec, query) = Specifier::parse("./foo.png?width=100", SpecifierType::Url).unwrap();
    assert_eq!(spec, Specifier::Relative(Cow::Borrowed(Path::new("foo.png"))));
    assert_eq!(query, Some("?width=100"));
  }

  #[test]
  fn parses_scoped_package() {
    let (spec, _) = Specifier::parse("@scope/pkg/sub/path", SpecifierType::Esm).unwrap();
    assert_eq!(
      spec,
      Specifier::Package(Cow::Borrowed("@scope/pkg"), Cow::Borrowed("sub/path"))
    );
  }

  #[test]
  fn parses_builtin() {
    let (spec, _) = Specifier::parse("node:path", SpecifierType::Esm).unwrap();
    assert_eq!(spec, Specifier::Builtin(Cow::Borrowed("path")));
    let (spec, _) = Specifier::parse("fs", SpecifierType::Esm).unwrap();
    assert_eq!(spec, Specifier::Builtin(Cow::Borrowed("fs")));
  }

  #[test]
  fn rejects_empty() {
    assert_eq!(
      Specifier::parse("", SpecifierType::Esm).unwrap_err(),
      SpecifierError::EmptySpecifier
    );
  }

  #[test]
  fn url_scheme_passthrough() {
    let (spec, _) = Specifier::parse("https://example.com/foo.js", SpecifierType::Esm).unwrap();
    assert_eq!(spec, Specifier::Url("https://example.com/foo.js"));
  }
}
