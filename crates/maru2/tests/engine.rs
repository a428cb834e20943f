//! End-to-end engine scenarios: real workflows, real `sh` children.

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use maru2::fetch::FetchPolicy;
use maru2::inputs::With;
use maru2::uses::Uses;
use maru2::{Engine, Service, Store, StepOutputs, TraceError};
use maru2_models::Workflow;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn test_engine(dir: &tempfile::TempDir) -> Engine {
    let store = Store::open(
        Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap(),
    )
    .unwrap();
    let svc = Service::new(FetchPolicy::IfNotPresent, store, IndexMap::new()).unwrap();
    Engine::new(svc)
}

fn workflow(yaml: &str) -> Workflow {
    let wf = maru2_models::from_slice(yaml.as_bytes()).unwrap();
    maru2_models::validate(&wf).unwrap();
    wf
}

fn origin() -> Uses {
    Uses::parse("file:tasks.yaml", &IndexMap::new()).unwrap()
}

fn cwd_of(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

async fn run(
    engine: &Engine,
    wf: &Workflow,
    task: &str,
    with: &With,
    cwd: &Utf8Path,
) -> Result<Option<StepOutputs>, TraceError> {
    engine
        .run(&CancellationToken::new(), wf, task, with, &origin(), cwd)
        .await
}

#[tokio::test]
async fn happy_path_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        "schema-version: v1\ntasks:\n  default:\n    steps:\n      - run: echo hello\n        mute: true\n",
    );

    let outputs = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap();
    assert_eq!(outputs, None);
}

#[tokio::test]
async fn missing_task_is_traced() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow("schema-version: v1\ntasks:\n  default:\n    steps: []\n");

    let err = run(&engine, &wf, "nope", &With::new(), &cwd_of(&dir))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("task `nope` not found"));
    assert_eq!(err.frames(), &["at (file:tasks.yaml)".to_string()]);
}

#[tokio::test]
async fn outputs_are_captured() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - id: s1
        mute: true
        run: echo "k=v" >> $MARU2_OUTPUT
"#,
    );

    let outputs = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap()
        .expect("the last step wrote outputs");
    assert_eq!(outputs["k"], json!("v"));
}

#[tokio::test]
async fn outputs_flow_between_steps() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - id: s1
        mute: true
        run: echo "v=7" >> $MARU2_OUTPUT
      - mute: true
        run: echo "got=${{ from("s1", "v") }}" >> $MARU2_OUTPUT
"#,
    );

    let outputs = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap()
        .expect("the last step wrote outputs");
    assert_eq!(outputs["got"], json!("7"));
}

#[tokio::test]
async fn failure_skips_but_cleanup_runs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - mute: true
        run: exit 1
      - mute: true
        run: touch never-ran
      - if: failure()
        mute: true
        run: echo "x=y" >> $MARU2_OUTPUT
"#,
    );

    let err = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap_err();

    // The first error is returned, with the cleanup step's outputs.
    assert!(format!("{:#}", err.cause()).contains("exit status"), "got: {err:?}");
    assert_eq!(err.outputs().unwrap()["x"], json!("y"));
    assert_eq!(
        err.frames(),
        &["at default[0] (file:tasks.yaml)".to_string()]
    );

    // The unguarded middle step was skipped.
    assert!(!dir.path().join("never-ran").exists());
}

#[tokio::test]
async fn timeout_triggers_always_but_not_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - mute: true
        timeout: 50ms
        run: sleep 5
      - if: cancelled()
        mute: true
        run: touch cancelled-ran
      - if: always()
        mute: true
        run: echo "ok=1" >> $MARU2_OUTPUT
"#,
    );

    let start = std::time::Instant::now();
    let err = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap_err();
    assert!(start.elapsed() < std::time::Duration::from_secs(4));

    assert!(
        format!("{:#}", err.cause()).contains("timed out"),
        "got: {err:?}"
    );
    // always() cleanup ran and its outputs are the task's result...
    assert_eq!(err.outputs().unwrap()["ok"], json!("1"));
    // ...while the cancelled() guard stayed false: timeouts aren't cancels.
    assert!(!dir.path().join("cancelled-ran").exists());
}

#[tokio::test]
async fn nested_task_timeout_still_runs_its_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - uses: slow
        timeout: 150ms
  slow:
    steps:
      - mute: true
        run: sleep 5
      - if: cancelled()
        mute: true
        run: touch cancelled-ran
      - if: always()
        mute: true
        run: echo "cleaned=1" >> $MARU2_OUTPUT
"#,
    );

    let start = std::time::Instant::now();
    let err = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap_err();
    assert!(start.elapsed() < std::time::Duration::from_secs(4));

    assert!(
        format!("{:#}", err.cause()).contains("timed out"),
        "got: {err:?}"
    );
    // The nested task observed the expired deadline itself: its killed
    // step is the error, its cancelled() guard stayed false, and its own
    // always() cleanup still ran and reported outputs.
    assert_eq!(err.outputs().unwrap()["cleaned"], json!("1"));
    assert!(!dir.path().join("cancelled-ran").exists());
    assert_eq!(
        err.frames(),
        &[
            "at slow[0] (file:tasks.yaml)".to_string(),
            "at default[0] (file:tasks.yaml)".to_string(),
        ]
    );
}

#[tokio::test]
async fn cancellation_runs_guarded_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - mute: true
        run: sleep 5
      - mute: true
        run: touch never-ran
      - if: cancelled()
        mute: true
        run: echo "cleanup=1" >> $MARU2_OUTPUT
"#,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let start = std::time::Instant::now();
    let err = engine
        .run(&cancel, &wf, "default", &With::new(), &origin(), &cwd_of(&dir))
        .await
        .unwrap_err();
    assert!(start.elapsed() < std::time::Duration::from_secs(4));

    assert!(
        format!("{:#}", err.cause()).contains("cancelled"),
        "got: {err:?}"
    );
    // The cancelled() cleanup step ran on a rebound context and its
    // outputs were captured; the unguarded step stayed skipped.
    assert_eq!(err.outputs().unwrap()["cleanup"], json!("1"));
    assert!(!dir.path().join("never-ran").exists());
}

#[tokio::test]
async fn inputs_coerce_and_validate() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let yaml = r#"
schema-version: v1
tasks:
  default:
    inputs:
      count:
        default: 5
        validate: "^[0-9]+$"
    steps:
      - mute: true
        run: echo "got=${{ input("count") }}" >> $MARU2_OUTPUT
"#;
    let wf = workflow(yaml);

    // "10" coerces to the default's integer type.
    let mut with = With::new();
    with.insert("count".into(), serde_yaml::Value::String("10".into()));
    let outputs = run(&engine, &wf, "default", &with, &cwd_of(&dir))
        .await
        .unwrap()
        .expect("step wrote outputs");
    assert_eq!(outputs["got"], json!("10"));

    // "x" doesn't coerce at all.
    let mut with = With::new();
    with.insert("count".into(), serde_yaml::Value::String("x".into()));
    let err = run(&engine, &wf, "default", &with, &cwd_of(&dir))
        .await
        .unwrap_err();
    assert!(
        format!("{:#}", err.cause()).contains("cannot coerce"),
        "got: {err:?}"
    );

    // "-3" coerces but fails the validation pattern.
    let mut with = With::new();
    with.insert("count".into(), serde_yaml::Value::String("-3".into()));
    let err = run(&engine, &wf, "default", &with, &cwd_of(&dir))
        .await
        .unwrap_err();
    assert!(
        format!("{:#}", err.cause()).contains("does not match"),
        "got: {err:?}"
    );
}

#[tokio::test]
async fn inputs_become_env_vars() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    inputs:
      my_input:
        default: from-default
    steps:
      - mute: true
        env:
          EXTRA: ${{ input("my_input") }}
        run: echo "env=$INPUT_MY_INPUT extra=$EXTRA" >> $MARU2_OUTPUT
"#,
    );

    let outputs = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap()
        .expect("step wrote outputs");
    assert_eq!(outputs["env"], json!("from-default extra=from-default"));
}

#[tokio::test]
async fn local_task_recursion_passes_with() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - uses: greet
        with:
          who: maru
  greet:
    inputs:
      who: {}
    steps:
      - mute: true
        run: echo "said=hello ${{ input("who") }}" >> $MARU2_OUTPUT
"#,
    );

    let outputs = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap()
        .expect("sub-task outputs bubble up");
    assert_eq!(outputs["said"], json!("hello maru"));
}

#[tokio::test]
async fn sub_task_failures_carry_both_frames() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - uses: boom
  boom:
    steps:
      - mute: true
        run: exit 7
"#,
    );

    let err = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap_err();
    assert_eq!(
        err.frames(),
        &[
            "at boom[0] (file:tasks.yaml)".to_string(),
            "at default[0] (file:tasks.yaml)".to_string(),
        ]
    );
}

#[tokio::test]
async fn in_file_cycles_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  a:
    steps:
      - uses: b
  b:
    steps:
      - uses: a
"#,
    );

    let err = run(&engine, &wf, "a", &With::new(), &cwd_of(&dir))
        .await
        .unwrap_err();
    assert!(
        format!("{:#}", err.cause()).contains("cycle"),
        "got: {err:?}"
    );
}

#[tokio::test]
async fn file_references_resolve_against_the_origin() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);

    std::fs::write(
        dir.path().join("dep.yaml"),
        "schema-version: v1\ntasks:\n  dep:\n    steps:\n      - mute: true\n        run: echo \"from=dep\" >> $MARU2_OUTPUT\n",
    )
    .unwrap();

    let entry_path = dir.path().join("tasks.yaml");
    std::fs::write(
        &entry_path,
        "schema-version: v1\ntasks:\n  default:\n    steps:\n      - uses: \"dep.yaml?task=dep\"\n",
    )
    .unwrap();

    let wf = workflow(&std::fs::read_to_string(&entry_path).unwrap());
    let entry_origin = Uses::parse(
        &format!("file:{}", entry_path.display()),
        &IndexMap::new(),
    )
    .unwrap();

    let outputs = engine
        .run(
            &CancellationToken::new(),
            &wf,
            "default",
            &With::new(),
            &entry_origin,
            &cwd_of(&dir),
        )
        .await
        .unwrap()
        .expect("dep task outputs bubble up");
    assert_eq!(outputs["from"], json!("dep"));
}

#[tokio::test]
async fn builtin_steps_run_and_export_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - id: said
        uses: builtin:echo
        with:
          text: hello ${{ os }}
      - mute: true
        run: echo "relay=${{ from("said", "text") }}" >> $MARU2_OUTPUT
"#,
    );

    let outputs = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap()
        .expect("step wrote outputs");
    assert_eq!(
        outputs["relay"],
        json!(format!("hello {}", std::env::consts::OS))
    );
}

#[tokio::test]
async fn unknown_builtins_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        "schema-version: v1\ntasks:\n  default:\n    steps:\n      - uses: builtin:nope\n",
    );

    let err = engine.validate_workflow(&wf).unwrap_err();
    assert!(err.to_string().contains("unknown builtin"), "got: {err:#}");
}

#[tokio::test]
async fn dry_run_schedules_everything_but_executes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).dry_run(true);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - mute: true
        run: touch dry-ran ${{ input("ghost") }}
      - if: "false"
        mute: true
        run: touch guarded
      - uses: builtin:echo
        with:
          text: preview only
"#,
    );

    let outputs = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap();
    assert_eq!(outputs, None);
    assert!(!dir.path().join("dry-ran").exists());
    assert!(!dir.path().join("guarded").exists());
}

#[tokio::test]
async fn bash_gets_pipefail() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        "schema-version: v1\ntasks:\n  default:\n    steps:\n      - shell: bash\n        mute: true\n        run: false | true\n",
    );

    let err = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap_err();
    assert!(
        format!("{:#}", err.cause()).contains("script failed"),
        "got: {err:?}"
    );
}

#[tokio::test]
async fn steps_respect_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    let engine = test_engine(&dir);
    let wf = workflow(
        r#"
schema-version: v1
tasks:
  default:
    steps:
      - dir: nested
        mute: true
        run: echo "where=$(basename "$(pwd)")" >> $MARU2_OUTPUT
"#,
    );

    let outputs = run(&engine, &wf, "default", &With::new(), &cwd_of(&dir))
        .await
        .unwrap()
        .expect("step wrote outputs");
    assert_eq!(outputs["where"], json!("nested"));
}
