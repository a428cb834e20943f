use std::time::Duration;

use maru2_models::{AliasType, Scalar, Shell, StepBody, from_slice, ordered_task_names, validate};
use pretty_assertions::assert_eq;

#[test]
fn full_document() {
    let wf = from_slice(
        br#"
schema-version: v1

inputs:
  verbose:
    description: global verbosity toggle
    default: false
    required: false

aliases:
  uds:
    type: github
    token-from-env: UDS_TOKEN
  internal:
    type: gitlab
    base-url: https://gitlab.example.com

tasks:
  default:
    description: build and test
    steps:
      - uses: build
      - uses: test

  build:
    inputs:
      target:
        description: make target
        default: all
        validate: "^[a-z-]+$"
    steps:
      - name: compile
        run: make ${{ input("target") }}
        shell: bash
        timeout: 5m
        env:
          CGO_ENABLED: 0
      - id: version
        run: echo "version=$(git describe)" >> $MARU2_OUTPUT

  test:
    steps:
      - run: make test
        dir: ./src
        mute: true
      - if: failure()
        uses: builtin:echo
        with:
          text: tests failed

  release:
    steps:
      - uses: "pkg:github/defenseunicorns/uds-common@v1#tasks/publish.yaml?task=all"
"#,
    )
    .unwrap();

    assert_eq!(wf.schema_version, "v1");
    assert_eq!(wf.tasks.len(), 4);
    assert!(!wf.inputs["verbose"].is_required());

    assert_eq!(wf.aliases["uds"].r#type, AliasType::Github);
    assert_eq!(wf.aliases["uds"].token_from_env.as_deref(), Some("UDS_TOKEN"));
    assert_eq!(
        wf.aliases["internal"].base_url.as_deref(),
        Some("https://gitlab.example.com")
    );

    let build = &wf.tasks["build"];
    assert_eq!(build.inputs["target"].default, Some(Scalar::String("all".into())));
    assert_eq!(build.steps[0].shell, Shell::Bash);
    assert_eq!(build.steps[0].timeout, Some(Duration::from_secs(300)));
    assert_eq!(build.steps[0].env["CGO_ENABLED"], Scalar::Int(0));
    assert_eq!(build.steps[1].id.as_deref(), Some("version"));

    let test = &wf.tasks["test"];
    assert!(test.steps[0].mute);
    assert_eq!(test.steps[0].dir.as_deref(), Some("./src"));
    assert_eq!(test.steps[1].r#if.as_deref(), Some("failure()"));
    assert_eq!(
        test.steps[1].body(),
        Some(StepBody::Uses("builtin:echo"))
    );

    assert_eq!(validate(&wf), Ok(()));
    assert_eq!(
        ordered_task_names(&wf),
        vec!["default", "build", "release", "test"]
    );
}

#[test]
fn unknown_shell_is_a_parse_error() {
    let err = from_slice(
        b"schema-version: v1\ntasks:\n  t:\n    steps:\n      - run: ls\n        shell: zsh\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("invalid workflow syntax"));
}

#[test]
fn tasks_preserve_declaration_order() {
    let wf = from_slice(
        b"schema-version: v1\ntasks:\n  charlie:\n    steps: []\n  alpha:\n    steps: []\n  bravo:\n    steps: []\n",
    )
    .unwrap();
    let declared: Vec<&str> = wf.tasks.keys().map(String::as_str).collect();
    assert_eq!(declared, vec!["charlie", "alpha", "bravo"]);
}
