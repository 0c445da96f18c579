/// Node.js builtin module names, sorted so membership checks can binary search.
pub const BUILTINS: &[&str] = &[
  "assert",
  "async_hooks",
  "buffer",
  "child_process",
  "cluster",
  "console",
  "constants",
  "crypto",
  "dgram",
  "diagnostics_channel",
  "dns",
  "domain",
  "events",
  "fs",
  "http",
  "http2",
  "https",
  "inspector",
  "module",
  "net",
  "os",
  "path",
  "perf_hooks",
  "process",
  "punycode",
  "querystring",
  "readline",
  "repl",
  "stream",
  "string_decoder",
  "sys",
  "timers",
  "tls",
  "trace_events",
  "tty",
  "url",
  "util",
  "v8",
  "vm",
  "wasi",
  "worker_threads",
  "zlib",
];

pub fn is_builtin(name: &str) -> bool {
  BUILTINS.binary_search(&name).is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sorted() {
    let mut sorted = BUILTINS.to_vec();
    sorted.sort_unstable();
    assert_eq!(sorted, BUILTINS);
  }

  #[test]
  fn membership() {
    assert!(is_builtin("fs"));
    assert!(is_builtin("worker_threads"));
    assert!(!is_builtin("lodash"));
  }
}
