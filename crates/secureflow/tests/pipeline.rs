use insta::assert_snapshot;
use pretty_assertions::assert_eq;
use secureflow::{
    pin::{Exemptions, PinOutcome, UnchangedReason},
    pipeline::PipelineOptions,
};

mod common;

use common::{HARDEN_SHA, Harness, PREFIX_SHA, workflow};

fn only(configure: impl FnOnce(&mut PipelineOptions)) -> PipelineOptions {
    let mut options = PipelineOptions {
        add_permissions: false,
        pin_actions: false,
        add_harden_runner: false,
        ..Default::default()
    };
    configure(&mut options);
    options
}

#[tokio::test]
async fn hardens_every_stage() {
    let harness = Harness::new();
    let report = harness
        .run(&workflow("build.yml"), &PipelineOptions::default())
        .await;

    assert!(!report.has_errors);
    assert!(report.added_permissions);
    assert!(report.pinned_actions);
    assert!(report.added_harden_runner);
    assert!(!report.added_maintained_actions);

    // checkout's `contents: read` is subsumed by `git push`.
    assert_snapshot!(report.final_output, @r"
    on: push

    permissions:
      contents: read

    jobs:
      build:
        permissions:
          contents: write
        runs-on: ubuntu-latest
        steps:
          - name: Harden the runner (Audit all outbound calls)
            uses: step-security/harden-runner@0d381219ddf674d61a7572ddd19d7941e271515c # v2.9.1
            with:
              egress-policy: audit

          - uses: actions/checkout@ee0669bd1cc54295c223e0bb666b733df41de1c5 # v2.7.0
          - uses: actions/setup-node@f1f314fca9dfce2769ece7d933488f076716723e # v1.4.6
            with:
              node-version: 20
          - uses: docker://ghcr.io/x/y:latest@sha256:1e0e0bbd0f2ab1a2b3f1f2c5d9b1d6d4e2f0b6c1a3e5d7f9b1c3e5a7d9f1b3c5
          - run: git push
    ");

    assert_eq!(
        report.pin_outcomes.outcomes.keys().collect::<Vec<_>>(),
        [
            "actions/checkout@v2",
            "actions/setup-node@v1",
            "docker://ghcr.io/x/y:latest"
        ]
    );
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let harness = Harness::new();
    let options = PipelineOptions::default();

    let first = harness.run(&workflow("build.yml"), &options).await;
    let second = harness.run(&first.final_output, &options).await;

    assert!(!second.changed());
    assert_eq!(second.final_output, first.final_output);
    assert!(second.already_has_permissions);
    assert!(!second.pinned_actions);
    assert!(!second.added_harden_runner);
    assert!(
        second
            .pin_outcomes
            .outcomes
            .values()
            .all(|outcome| matches!(outcome, PinOutcome::Unchanged { .. }))
    );
}

#[tokio::test]
async fn disabled_stages_round_trip_byte_for_byte() {
    let harness = Harness::new();
    let input = workflow("mixed.yml");

    let report = harness.run(&input, &only(|_| {})).await;

    assert_eq!(report.final_output, input);
    assert!(!report.has_errors);
}

#[tokio::test]
async fn failed_jobs_are_reported_and_left_alone() {
    let harness = Harness::new();
    let report = harness
        .run(&workflow("mixed.yml"), &only(|o| o.add_permissions = true))
        .await;

    assert!(report.has_errors);
    assert!(!report.added_permissions);

    let failed: Vec<_> = report
        .job_errors
        .iter()
        .map(|job| (job.job_name.as_str(), &job.errors[0][..12]))
        .collect();
    assert_eq!(failed, [("configured", "KnownIssue-5"), ("lint", "KnownIssue-4")]);

    // The job that could be handled still is, but the workflow as a
    // whole isn't restricted.
    assert!(report.final_output.contains(
        "  test:
    permissions:
      contents: read # for actions/checkout to fetch code (actions/checkout)
    runs-on: ubuntu-latest
"
    ));
    assert!(!report.final_output.contains("\npermissions:"));
    assert!(report.final_output.contains(
        "  configured:
    permissions:
      pull-requests: write
    runs-on: ubuntu-latest
"
    ));

    assert_eq!(report.missing_actions, ["unknown/linter@v3"]);
    assert_eq!(harness.sink.recorded(), ["unknown/linter"]);
}

#[tokio::test]
async fn missing_actions_can_be_ignored() {
    let harness = Harness::new();
    let report = harness
        .run(
            &workflow("mixed.yml"),
            &only(|o| {
                o.add_permissions = true;
                o.ignore_missing_kbs = true;
            }),
        )
        .await;

    assert_eq!(report.missing_actions, ["unknown/linter@v3"]);
    assert!(harness.sink.recorded().is_empty());
}

#[tokio::test]
async fn unresolvable_references_fail_without_stopping_the_run() {
    let harness = Harness::new();
    let report = harness
        .run(
            &workflow("mixed.yml"),
            &only(|o| {
                o.pin_actions = true;
                o.add_harden_runner = true;
            }),
        )
        .await;

    assert!(matches!(
        report.pin_outcomes.outcomes["unknown/linter@v3"],
        PinOutcome::Failed { .. }
    ));
    assert!(report.final_output.contains("- uses: unknown/linter@v3\n"));
    assert!(report.stage_errors.is_empty());
    assert!(report.added_harden_runner);

    let pinned_wrapper = format!("uses: step-security/harden-runner@{HARDEN_SHA} # v2.9.1");
    assert_eq!(report.final_output.matches(&pinned_wrapper).count(), 3);
}

#[tokio::test]
async fn exemptions_are_respected() {
    let harness = Harness::new();
    let report = harness
        .run(
            &workflow("build.yml"),
            &only(|o| {
                o.pin_actions = true;
                o.add_harden_runner = true;
                o.exemptions = Exemptions::new(&["actions/*", "step-security/harden-runner"]);
            }),
        )
        .await;

    assert_eq!(
        report.pin_outcomes.outcomes["actions/checkout@v2"],
        PinOutcome::Unchanged {
            reason: UnchangedReason::Exempt
        }
    );
    assert!(report.final_output.contains("- uses: actions/checkout@v2\n"));
    assert!(report.final_output.contains("- uses: actions/setup-node@v1\n"));
    assert!(
        report
            .final_output
            .contains("  uses: step-security/harden-runner@v2\n")
    );
    // Images aren't subject to exemptions.
    assert!(report.final_output.contains("docker://ghcr.io/x/y:latest@sha256:"));
}

#[tokio::test]
async fn pinning_is_prefix_safe() {
    let input = "jobs:
  a:
    runs-on: ubuntu-latest
    steps:
      - uses: a/b@v1
      - uses: a/b@v1.2.3
";

    let harness = Harness::new();
    let report = harness.run(input, &only(|o| o.pin_actions = true)).await;

    let pinned = format!("      - uses: a/b@{PREFIX_SHA} # v1.2.3\n");
    assert_eq!(report.final_output.matches(&pinned).count(), 2);
}

#[tokio::test]
async fn jobs_needing_nothing_get_a_closed_block() {
    let input = "on: push
jobs:
  hello:
    runs-on: ubuntu-latest
    steps:
      - run: echo hello
";

    let harness = Harness::new();
    let report = harness.run(input, &only(|o| o.add_permissions = true)).await;

    assert_snapshot!(report.final_output, @r"
    on: push
    permissions:
      contents: read

    jobs:
      hello:
        permissions:
          contents: none
        runs-on: ubuntu-latest
        steps:
          - run: echo hello
    ");
}

#[tokio::test]
async fn maintained_actions_are_substituted() {
    let input = "jobs:
  title:
    runs-on: ubuntu-latest
    steps:
      - uses: amannn/action-semantic-pull-request@v4
";

    let harness = Harness::new();
    let report = harness
        .run(
            input,
            &only(|o| {
                o.maintained_actions = [(
                    "amannn/action-semantic-pull-request".to_string(),
                    "step-security/action-semantic-pull-request".to_string(),
                )]
                .into_iter()
                .collect();
            }),
        )
        .await;

    assert!(report.added_maintained_actions);
    assert!(
        report
            .final_output
            .contains("- uses: step-security/action-semantic-pull-request@v5\n")
    );
}

#[tokio::test]
async fn flow_style_steps_are_edited_in_place() {
    let input = "on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - { uses: actions/checkout@v2, with: { fetch-depth: 0 } }
      - { run: git push }
  flow: { runs-on: ubuntu-latest, steps: [{ run: make }] }
";

    let harness = Harness::new();
    let report = harness
        .run(
            input,
            &only(|o| {
                o.add_permissions = true;
                o.pin_actions = true;
            }),
        )
        .await;

    assert_snapshot!(report.final_output, @r"
    on: push
    jobs:
      build:
        permissions:
          contents: write
        runs-on: ubuntu-latest
        steps:
          - { uses: actions/checkout@ee0669bd1cc54295c223e0bb666b733df41de1c5, with: { fetch-depth: 0 } }
          - { run: git push }
      flow: { runs-on: ubuntu-latest, steps: [{ run: make }] }
    ");
    assert!(report.pinned_actions);
    assert!(report.stage_errors.is_empty());
    assert_eq!(report.job_errors[0].job_name, "flow");
    assert!(report.job_errors[0].errors[0].starts_with("KnownIssue-8"));
}
