use std::path::Path;

use itertools::Itertools;

use crate::FileSystem;

const MAX_DISTANCE: usize = 2;

/// Damerau-Levenshtein edit distance (optimal string alignment variant).
pub fn edit_distance(a: &str, b: &str) -> usize {
  let a: Vec<char> = a.chars().collect();
  let b: Vec<char> = b.chars().collect();
  let (m, n) = (a.len(), b.len());
  if m == 0 {
    return n;
  }
  if n == 0 {
    return m;
  }

  let mut rows: Vec<Vec<usize>> = vec![vec![0; n + 1]; m + 1];
  for (i, row) in rows.iter_mut().enumerate() {
    row[0] = i;
  }
  for j in 0..=n {
    rows[0][j] = j;
  }

  for i in 1..=m {
    for j in 1..=n {
      let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
      let mut d = (rows[i - 1][j] + 1)
        .min(rows[i][j - 1] + 1)
        .min(rows[i - 1][j - 1] + cost);
      if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
        d = d.min(rows[i - 2][j - 2] + cost);
      }
      rows[i][j] = d;
    }
  }

  rows[m][n]
}

/// Names in the parent directory of a missing path within a small edit
/// distance of the requested name, best match first.
pub fn find_alternatives(fs: &dyn FileSystem, missing: &Path) -> Vec<String> {
  let Some(parent) = missing.parent() else {
    return Vec::new();
  };
  let Some(wanted) = missing.file_name().and_then(|n| n.to_str()) else {
    return Vec::new();
  };
  let Ok(names) = fs.read_dir(parent) else {
    return Vec::new();
  };

  names
    .into_iter()
    .filter_map(|name| {
      let distance = edit_distance(&name, wanted);
      (distance > 0 && distance <= MAX_DISTANCE).then_some((distance, name))
    })
    .sorted()
    .map(|(_, name)| name)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn distances() {
    assert_eq!(edit_distance("test.js", "test.js"), 0);
    assert_eq!(edit_distance("test.js", "tets.js"), 1);
    assert_eq!(edit_distance("test.js", "tast.js"), 1);
    assert_eq!(edit_distance("test.js", "index.js"), 4);
  }
}
