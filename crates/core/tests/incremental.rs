//! End-to-end builds against the in-memory filesystem: full pipeline from
//! entries through packaging, plus incremental rebuild behavior.

mod common;

use std::path::Path;
use std::sync::Arc;

use baler_core::diagnostic::DiagnosticKind;
use baler_core::file_system::FileSystem;
use baler_core::Baler;
use common::{evaluate, options_for, registry, setup, Value};

#[test]
fn basic_build_and_rebuild() {
  let mut build = setup(
    &[
      (
        "/app/src/index.js",
        "import x from './nested/test.js';\nmodule.exports = 2 + x;\n",
      ),
      ("/app/src/nested/test.js", "export default 2;\n"),
    ],
    &["src/index.js"],
  );

  let result = build.build().unwrap();
  assert_eq!(result.bundles.len(), 1);
  assert_eq!(evaluate(&build.output("/app/dist/index.js")), Value::Int(4));
  assert_eq!(build.transform_count("index.js"), 1);
  assert_eq!(build.transform_count("test.js"), 1);

  // Editing the dependency re-runs only its own transform.
  build.write("/app/src/nested/test.js", "export default 4;\n");
  build.build().unwrap();
  assert_eq!(evaluate(&build.output("/app/dist/index.js")), Value::Int(6));
  assert_eq!(build.transform_count("test.js"), 2);
  assert_eq!(build.transform_count("index.js"), 1);
}

#[test]
fn adding_a_dependency_rebuilds_only_affected_requests() {
  let mut build = setup(
    &[
      (
        "/app/src/index.js",
        "import x from './nested/test.js';\nmodule.exports = 2 + x;\n",
      ),
      ("/app/src/nested/test.js", "export default 2;\n"),
    ],
    &["src/index.js"],
  );
  build.build().unwrap();

  build.write("/app/src/nested/foo.js", "export default 6;\n");
  build.write(
    "/app/src/nested/test.js",
    "export {default} from './foo';\n",
  );
  build.build().unwrap();

  assert_eq!(evaluate(&build.output("/app/dist/index.js")), Value::Int(8));
  // Only requests transitively touching test.js and foo.js re-ran.
  assert_eq!(build.transform_count("index.js"), 1);
  assert_eq!(build.transform_count("test.js"), 2);
  assert_eq!(build.transform_count("foo.js"), 1);
}

#[test]
fn resolver_failure_and_recovery() {
  let mut build = setup(
    &[
      (
        "/app/src/index.js",
        "import x from './nested/test.js';\nmodule.exports = 2 + x;\n",
      ),
      ("/app/src/nested/test.js", "export default 2;\n"),
    ],
    &["src/index.js"],
  );
  build.build().unwrap();

  build.delete("/app/src/nested/test.js");
  let err = build.build().unwrap_err();
  assert!(err.iter().any(|d| matches!(
    d.kind,
    DiagnosticKind::FileNotFound | DiagnosticKind::ModuleNotFound
  )));
  assert!(err.iter().any(|d| d.message.contains("index.js")));

  // Restoring the file makes the next build succeed.
  build.write("/app/src/nested/test.js", "module.exports = 4;\n");
  build.build().unwrap();
  assert_eq!(evaluate(&build.output("/app/dist/index.js")), Value::Int(6));
}

#[test]
fn weak_reexports_defer_until_consumed() {
  let mut build = setup(
    &[
      (
        "/app/src/index.js",
        "import {a} from './lib/m.js';\nmodule.exports = a;\n",
      ),
      ("/app/src/lib/package.json", r#"{"name": "lib", "sideEffects": false}"#),
      (
        "/app/src/lib/m.js",
        "export {a} from './a_mod.js';\nexport {b} from './b_mod.js';\n",
      ),
      ("/app/src/lib/a_mod.js", "export const a = 1;\n"),
      ("/app/src/lib/b_mod.js", "export const b = 2;\n"),
    ],
    &["src/index.js"],
  );

  build.build().unwrap();
  // Nothing imports b, so its side-effect-free subgraph never transforms.
  assert_eq!(build.transform_count("a_mod.js"), 1);
  assert_eq!(build.transform_count("b_mod.js"), 0);
  assert_eq!(evaluate(&build.output("/app/dist/index.js")), Value::Int(1));

  // Importing b re-activates the deferred re-export.
  build.write(
    "/app/src/index.js",
    "import {a, b} from './lib/m.js';\nmodule.exports = a + b;\n",
  );
  build.build().unwrap();
  assert_eq!(build.transform_count("b_mod.js"), 1);
  assert_eq!(evaluate(&build.output("/app/dist/index.js")), Value::Int(3));
}

#[test]
fn env_file_invalidation_is_content_aware() {
  let mut build = setup(
    &[
      ("/app/src/index.js", "module.exports = process.env.TEST;\n"),
      ("/app/.env", "TEST=hi\n"),
    ],
    &["src/index.js"],
  );

  build.build().unwrap();
  assert_eq!(
    evaluate(&build.output("/app/dist/index.js")),
    Value::Str("hi".into())
  );
  assert_eq!(build.transform_count("index.js"), 1);

  // Emptying the env file changes the config fingerprint and re-transforms.
  build.write("/app/.env", "");
  build.build().unwrap();
  assert_eq!(
    evaluate(&build.output("/app/dist/index.js")),
    Value::Undefined
  );
  assert_eq!(build.transform_count("index.js"), 2);

  // Rewriting identical content re-runs the config request, whose unchanged
  // fingerprint keeps the pipeline cache warm: no transformer re-runs.
  build.write("/app/.env", "");
  build.build().unwrap();
  assert_eq!(build.transform_count("index.js"), 2);
}

#[test]
fn glob_entries_add_bundles_without_repackaging_untouched_ones() {
  let mut build = setup(
    &[
      ("/app/src/entries/a.js", "module.exports = 1;\n"),
      ("/app/src/entries/b.js", "module.exports = 2;\n"),
    ],
    &["src/entries/*.js"],
  );

  let result = build.build().unwrap();
  assert_eq!(result.bundles.len(), 2);
  assert_eq!(evaluate(&build.output("/app/dist/a.js")), Value::Int(1));
  assert_eq!(evaluate(&build.output("/app/dist/b.js")), Value::Int(2));
  let packaged_before = build.packaged.lock().len();
  assert_eq!(packaged_before, 2);

  build.write("/app/src/entries/c.js", "module.exports = 3;\n");
  let result = build.build().unwrap();
  assert_eq!(result.bundles.len(), 3);
  assert_eq!(evaluate(&build.output("/app/dist/c.js")), Value::Int(3));

  // a and b hit the packaging cache; only c was packaged.
  let packaged: Vec<String> = build.packaged.lock()[packaged_before..].to_vec();
  assert_eq!(packaged, vec!["c.js".to_string()]);
}

#[test]
fn double_build_is_byte_identical() {
  let mut build = setup(
    &[
      (
        "/app/src/index.js",
        "import x from './nested/test.js';\nmodule.exports = 2 + x;\n",
      ),
      ("/app/src/nested/test.js", "export default 2;\n"),
    ],
    &["src/index.js"],
  );

  let first = build.build().unwrap();
  let first_output = build.output("/app/dist/index.js");
  let first_hashes: Vec<String> = first
    .bundles
    .iter()
    .flat_map(|b| b.artifacts.iter().map(|a| a.hash.clone()))
    .collect();

  let second = build.build().unwrap();
  let second_output = build.output("/app/dist/index.js");
  let second_hashes: Vec<String> = second
    .bundles
    .iter()
    .flat_map(|b| b.artifacts.iter().map(|a| a.hash.clone()))
    .collect();

  assert_eq!(first_output, second_output);
  assert_eq!(first_hashes, second_hashes);
  // And no transformer ran twice.
  assert_eq!(build.transform_count("index.js"), 1);
}

#[test]
fn abort_produces_no_partial_writes() {
  let mut build = setup(
    &[("/app/src/index.js", "module.exports = 1;\n")],
    &["src/index.js"],
  );

  build.baler.abort_signal().abort();
  let err = build.build().unwrap_err();
  assert!(err.iter().any(|d| d.kind == DiagnosticKind::BuildAbort));
  assert!(!build.fs.exists(Path::new("/app/dist/index.js")));
}

#[test]
fn persisted_state_survives_a_restart() {
  let mut build = setup(
    &[
      (
        "/app/src/index.js",
        "import x from './nested/test.js';\nmodule.exports = 2 + x;\n",
      ),
      ("/app/src/nested/test.js", "export default 2;\n"),
    ],
    &["src/index.js"],
  );
  build.build().unwrap();
  let fs = Arc::clone(&build.fs);
  drop(build);

  // A fresh engine over the same cache restores the graphs and replays the
  // (empty) journal: nothing re-transforms.
  let (plugins, transforms, _) = registry();
  let mut restarted = Baler::new(
    vec!["src/index.js".to_string()],
    options_for(&fs),
    plugins,
  );
  restarted.build(Vec::new()).unwrap();
  assert_eq!(transforms.lock().len(), 0);
  assert_eq!(
    evaluate(&fs.read_to_string(Path::new("/app/dist/index.js")).unwrap()),
    Value::Int(4)
  );
}

#[test]
fn missing_module_fails_with_hints() {
  let mut build = setup(
    &[
      ("/app/src/index.js", "import x from './tets.js';\nmodule.exports = x;\n"),
      ("/app/src/test.js", "export default 1;\n"),
    ],
    &["src/index.js"],
  );

  let err = build.build().unwrap_err();
  let not_found = err
    .iter()
    .find(|d| d.kind == DiagnosticKind::FileNotFound)
    .expect("expected a file-not-found diagnostic");
  assert!(not_found.hints.iter().any(|h| h.contains("test.js")));
}
