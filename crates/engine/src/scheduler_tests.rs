//! End-to-end tests for the orchestration engine.
//!
//! These tests drive real submissions through a `ScenarioManager` backed by
//! mock and closure computations, with no external services involved. They mirror
//! the canonical usage: configure data nodes, tasks and scenarios, write
//! inputs, submit, read outputs, compare sibling instances.

use std::sync::Arc;
use std::time::Duration;

use computations::mock::MockComputation;
use computations::{Computation, FnComputation};
use serde_json::{json, Value};

use crate::config::{
    ConfigBuilder, DataNodeConfig, EngineConfig, PipelineConfig, ScenarioConfig, TaskConfig,
};
use crate::scenario::ScenarioManager;
use crate::scheduler::{JobExecutionConfig, JobState, SubmissionStatus, WorkerPool};
use crate::EngineError;

fn manager(config: Arc<EngineConfig>, workers: usize) -> ScenarioManager {
    let pool = Arc::new(WorkerPool::new(JobExecutionConfig::standalone(workers)));
    ScenarioManager::new(config, pool)
}

/// `b - a` over exactly two instances, applied positionally.
fn difference() -> crate::config::Comparator {
    Arc::new(|values: &[Value]| {
        json!(values[1].as_i64().unwrap() - values[0].as_i64().unwrap())
    })
}

/// The canonical pipeline: input --double--> intermediate --add(+10)--> output,
/// grouped in a pipeline, with difference comparators on input and
/// intermediate.
fn double_add_config() -> Arc<EngineConfig> {
    let mut builder = ConfigBuilder::new();
    builder
        .data_node(DataNodeConfig::new("input").with_default(json!(21)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("intermediate")).unwrap();
    builder.data_node(DataNodeConfig::new("output")).unwrap();

    builder
        .computation(
            "double",
            Arc::new(FnComputation::unary(|v| json!(v.as_i64().unwrap() * 2))),
        )
        .unwrap();
    builder
        .computation(
            "add",
            Arc::new(FnComputation::unary(|v| json!(v.as_i64().unwrap() + 10))),
        )
        .unwrap();

    builder
        .task(TaskConfig::new("double", "double", ["input"], ["intermediate"]))
        .unwrap();
    builder
        .task(TaskConfig::new("add", "add", ["intermediate"], ["output"]))
        .unwrap();
    builder
        .pipeline(PipelineConfig::new("my_pipeline", ["double", "add"]))
        .unwrap();
    builder
        .scenario(
            ScenarioConfig::new("my_scenario")
                .with_pipeline("my_pipeline")
                .with_comparator("input", difference())
                .with_comparator("intermediate", difference()),
        )
        .unwrap();
    builder.build()
}

// ============================================================
// Happy path
// ============================================================

#[tokio::test]
async fn default_input_runs_through_double_to_42() {
    let mut builder = ConfigBuilder::new();
    builder
        .data_node(DataNodeConfig::new("input").with_default(json!(21)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("output")).unwrap();
    builder
        .computation(
            "double",
            Arc::new(FnComputation::unary(|v| json!(v.as_i64().unwrap() * 2))),
        )
        .unwrap();
    builder
        .task(TaskConfig::new("double", "double", ["input"], ["output"]))
        .unwrap();
    builder
        .scenario(ScenarioConfig::new("my_scenario").with_tasks(["double"]))
        .unwrap();

    let manager = manager(builder.build(), 2);
    let instance = manager.create_scenario("my_scenario").unwrap();

    // No input overwrite: the default flows through.
    let submission = manager.submit(instance).await.unwrap();

    assert_eq!(submission.status(), SubmissionStatus::Completed);
    assert_eq!(manager.read(instance, "output").unwrap(), json!(42));

    let jobs = submission.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Completed);
    assert!(jobs[0].started_at.is_some());
    assert!(jobs[0].finished_at.is_some());
}

#[tokio::test]
async fn two_instances_flow_through_the_pipeline_independently() {
    let manager = manager(double_add_config(), 2);
    let first = manager.create_scenario("my_scenario").unwrap();
    let second = manager.create_scenario("my_scenario").unwrap();

    manager.write_input(first, "input", json!(10)).unwrap();
    manager.write_input(second, "input", json!(8)).unwrap();

    let sub_first = manager.submit(first).await.unwrap();
    let sub_second = manager.submit(second).await.unwrap();
    assert_eq!(sub_first.status(), SubmissionStatus::Completed);
    assert_eq!(sub_second.status(), SubmissionStatus::Completed);

    assert_eq!(manager.read(first, "intermediate").unwrap(), json!(20));
    assert_eq!(manager.read(second, "intermediate").unwrap(), json!(16));
    assert_eq!(manager.read(first, "output").unwrap(), json!(30));
    assert_eq!(manager.read(second, "output").unwrap(), json!(26));
}

#[tokio::test]
async fn multi_output_task_commits_every_declared_output() {
    let mut builder = ConfigBuilder::new();
    for id in ["src", "plus_one", "plus_two"] {
        builder.data_node(DataNodeConfig::new(id)).unwrap();
    }
    builder
        .computation(
            "fan_out",
            Arc::new(FnComputation::new(1, 2, |inputs| {
                let v = inputs[0].as_i64().unwrap();
                Ok(vec![json!(v + 1), json!(v + 2)])
            })),
        )
        .unwrap();
    builder
        .task(TaskConfig::new("fan_out", "fan_out", ["src"], ["plus_one", "plus_two"]))
        .unwrap();
    builder
        .scenario(ScenarioConfig::new("s").with_tasks(["fan_out"]))
        .unwrap();

    let manager = manager(builder.build(), 2);
    let instance = manager.create_scenario("s").unwrap();
    manager.write_input(instance, "src", json!(40)).unwrap();

    let submission = manager.submit(instance).await.unwrap();
    assert_eq!(submission.status(), SubmissionStatus::Completed);
    assert_eq!(manager.read(instance, "plus_one").unwrap(), json!(41));
    assert_eq!(manager.read(instance, "plus_two").unwrap(), json!(42));
}

// ============================================================
// Inputs and data-node access
// ============================================================

#[tokio::test]
async fn write_then_read_round_trips_unchanged() {
    let manager = manager(double_add_config(), 2);
    let instance = manager.create_scenario("my_scenario").unwrap();

    let payload = json!({ "nested": { "values": [1, 2, 3] }, "label": "raw" });
    manager.write_input(instance, "input", payload.clone()).unwrap();

    assert_eq!(manager.read(instance, "input").unwrap(), payload);
    // Default (version 1) then our write (version 2).
    assert_eq!(manager.data_node(instance, "input").unwrap().version, 2);
}

#[tokio::test]
async fn writing_a_produced_node_is_rejected() {
    let manager = manager(double_add_config(), 2);
    let instance = manager.create_scenario("my_scenario").unwrap();

    let result = manager.write_input(instance, "intermediate", json!(0));
    assert!(matches!(
        result,
        Err(EngineError::ReadOnlyDataNode { data_node, producer })
            if data_node == "intermediate" && producer == "double"
    ));
}

#[tokio::test]
async fn submission_requires_external_inputs_to_be_written() {
    let mut builder = ConfigBuilder::new();
    builder.data_node(DataNodeConfig::new("raw")).unwrap(); // no default
    builder.data_node(DataNodeConfig::new("result")).unwrap();
    builder
        .computation("copy", Arc::new(FnComputation::unary(|v| v)))
        .unwrap();
    builder
        .task(TaskConfig::new("copy", "copy", ["raw"], ["result"]))
        .unwrap();
    builder
        .scenario(ScenarioConfig::new("s").with_tasks(["copy"]))
        .unwrap();

    let manager = manager(builder.build(), 2);
    let instance = manager.create_scenario("s").unwrap();

    // Never written: the submission could never drain, so it fails up front.
    let result = manager.submit_async(instance);
    assert!(matches!(
        result,
        Err(EngineError::NotWritten { data_node, .. }) if data_node == "raw"
    ));

    manager.write_input(instance, "raw", json!("ok")).unwrap();
    let submission = manager.submit(instance).await.unwrap();
    assert_eq!(submission.status(), SubmissionStatus::Completed);
    assert_eq!(manager.read(instance, "result").unwrap(), json!("ok"));
}

// ============================================================
// Failure policy
// ============================================================

#[tokio::test]
async fn failed_job_skips_downstream_but_independent_branch_completes() {
    let mut builder = ConfigBuilder::new();
    builder
        .data_node(DataNodeConfig::new("a").with_default(json!(1)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("b")).unwrap();
    builder.data_node(DataNodeConfig::new("c")).unwrap();
    builder
        .data_node(DataNodeConfig::new("d").with_default(json!(2)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("e")).unwrap();

    let never = Arc::new(MockComputation::returning("never", 1, vec![json!(0)]));
    builder
        .computation("boom", Arc::new(MockComputation::failing("boom", 1, "exploded")))
        .unwrap();
    builder
        .computation("never", Arc::clone(&never) as Arc<dyn Computation>)
        .unwrap();
    builder
        .computation(
            "ok",
            Arc::new(FnComputation::unary(|v| json!(v.as_i64().unwrap() + 5))),
        )
        .unwrap();

    builder.task(TaskConfig::new("t_boom", "boom", ["a"], ["b"])).unwrap();
    builder.task(TaskConfig::new("t_after", "never", ["b"], ["c"])).unwrap();
    builder.task(TaskConfig::new("t_ok", "ok", ["d"], ["e"])).unwrap();
    builder
        .scenario(ScenarioConfig::new("s").with_tasks(["t_boom", "t_after", "t_ok"]))
        .unwrap();

    let manager = manager(builder.build(), 2);
    let instance = manager.create_scenario("s").unwrap();
    let submission = manager.submit(instance).await.unwrap();

    // The submission as a whole is Failed, but submit did not error.
    assert_eq!(submission.status(), SubmissionStatus::Failed);

    let boom = submission.job("t_boom").unwrap();
    assert_eq!(boom.state, JobState::Failed);
    assert!(boom.error.as_deref().unwrap().contains("exploded"));

    // Downstream of the failure: skipped, computation never invoked.
    assert_eq!(submission.job("t_after").unwrap().state, JobState::Skipped);
    assert_eq!(never.call_count(), 0);

    // The independent branch still completed.
    assert_eq!(submission.job("t_ok").unwrap().state, JobState::Completed);
    assert_eq!(manager.read(instance, "e").unwrap(), json!(7));

    // Nothing was written by the failed job.
    assert!(matches!(
        manager.read(instance, "b"),
        Err(EngineError::NotWritten { .. })
    ));
}

#[tokio::test]
async fn consumer_waits_for_its_producer_even_when_the_node_has_a_default() {
    let mut builder = ConfigBuilder::new();
    builder
        .data_node(DataNodeConfig::new("src").with_default(json!(1)))
        .unwrap();
    // Written from creation, but produced by a task: the consumer must wait
    // for the producer, not run against the default.
    builder
        .data_node(DataNodeConfig::new("mid").with_default(json!(99)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("out")).unwrap();

    let consumer = Arc::new(MockComputation::returning("consumer", 1, vec![json!(0)]));
    builder
        .computation(
            "slow_producer",
            Arc::new(MockComputation::sleeping(
                "slow_producer",
                1,
                Duration::from_millis(50),
                vec![json!(5)],
            )),
        )
        .unwrap();
    builder
        .computation("consumer", Arc::clone(&consumer) as Arc<dyn Computation>)
        .unwrap();
    builder
        .task(TaskConfig::new("t_produce", "slow_producer", ["src"], ["mid"]))
        .unwrap();
    builder
        .task(TaskConfig::new("t_consume", "consumer", ["mid"], ["out"]))
        .unwrap();
    builder
        .scenario(ScenarioConfig::new("s").with_tasks(["t_produce", "t_consume"]))
        .unwrap();

    let manager = manager(builder.build(), 2);
    let instance = manager.create_scenario("s").unwrap();
    let submission = manager.submit(instance).await.unwrap();

    assert_eq!(submission.status(), SubmissionStatus::Completed);
    // The consumer saw the producer's output, never the stale default.
    assert_eq!(*consumer.calls_handle().lock().unwrap(), vec![vec![json!(5)]]);
    assert_eq!(manager.read(instance, "mid").unwrap(), json!(5));
    assert_eq!(manager.read(instance, "out").unwrap(), json!(0));
}

#[tokio::test]
async fn failed_producer_skips_its_consumer_despite_a_defaulted_node() {
    let mut builder = ConfigBuilder::new();
    builder
        .data_node(DataNodeConfig::new("src").with_default(json!(1)))
        .unwrap();
    builder
        .data_node(DataNodeConfig::new("mid").with_default(json!(99)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("out")).unwrap();

    let consumer = Arc::new(MockComputation::returning("consumer", 1, vec![json!(0)]));
    builder
        .computation("boom", Arc::new(MockComputation::failing("boom", 1, "exploded")))
        .unwrap();
    builder
        .computation("consumer", Arc::clone(&consumer) as Arc<dyn Computation>)
        .unwrap();
    builder
        .task(TaskConfig::new("t_produce", "boom", ["src"], ["mid"]))
        .unwrap();
    builder
        .task(TaskConfig::new("t_consume", "consumer", ["mid"], ["out"]))
        .unwrap();
    builder
        .scenario(ScenarioConfig::new("s").with_tasks(["t_produce", "t_consume"]))
        .unwrap();

    let manager = manager(builder.build(), 2);
    let instance = manager.create_scenario("s").unwrap();
    let submission = manager.submit(instance).await.unwrap();

    // The default on "mid" does not make the consumer runnable: it depends on
    // the failed producer, so it is skipped and never invoked.
    assert_eq!(submission.status(), SubmissionStatus::Failed);
    assert_eq!(submission.job("t_produce").unwrap().state, JobState::Failed);
    assert_eq!(submission.job("t_consume").unwrap().state, JobState::Skipped);
    assert_eq!(consumer.call_count(), 0);

    // The default is still in place and nothing was written downstream.
    assert_eq!(manager.read(instance, "mid").unwrap(), json!(99));
    assert!(matches!(
        manager.read(instance, "out"),
        Err(EngineError::NotWritten { .. })
    ));
}

#[tokio::test]
async fn wrong_output_count_fails_the_job() {
    let mut builder = ConfigBuilder::new();
    builder
        .data_node(DataNodeConfig::new("in").with_default(json!(1)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("out")).unwrap();
    // Declares one output, returns two.
    builder
        .computation(
            "liar",
            Arc::new(FnComputation::new(1, 1, |_| Ok(vec![json!(1), json!(2)]))),
        )
        .unwrap();
    builder.task(TaskConfig::new("t", "liar", ["in"], ["out"])).unwrap();
    builder.scenario(ScenarioConfig::new("s").with_tasks(["t"])).unwrap();

    let manager = manager(builder.build(), 2);
    let instance = manager.create_scenario("s").unwrap();
    let submission = manager.submit(instance).await.unwrap();

    assert_eq!(submission.status(), SubmissionStatus::Failed);
    let job = submission.job("t").unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.as_deref().unwrap().contains("declared 1 output(s)"));
    assert!(matches!(
        manager.read(instance, "out"),
        Err(EngineError::NotWritten { .. })
    ));
}

// ============================================================
// Comparators
// ============================================================

#[tokio::test]
async fn compare_applies_the_comparator_positionally() {
    let manager = manager(double_add_config(), 2);
    let x = manager.create_scenario("my_scenario").unwrap();
    let y = manager.create_scenario("my_scenario").unwrap();

    manager.write_input(x, "input", json!(10)).unwrap();
    manager.write_input(y, "input", json!(8)).unwrap();

    // f(a, b) = b - a over raw inputs, both orders.
    assert_eq!(manager.compare("input", &[x, y]).unwrap(), json!(-2));
    assert_eq!(manager.compare("input", &[y, x]).unwrap(), json!(2));

    manager.submit(x).await.unwrap();
    manager.submit(y).await.unwrap();

    // Intermediate values are 20 and 16: differences match direct subtraction.
    assert_eq!(manager.compare("intermediate", &[x, y]).unwrap(), json!(-4));
    assert_eq!(manager.compare("intermediate", &[y, x]).unwrap(), json!(4));
}

#[tokio::test]
async fn compare_without_a_registered_comparator_fails() {
    let manager = manager(double_add_config(), 2);
    let x = manager.create_scenario("my_scenario").unwrap();
    let y = manager.create_scenario("my_scenario").unwrap();
    manager.submit(x).await.unwrap();
    manager.submit(y).await.unwrap();

    let result = manager.compare("output", &[x, y]);
    assert!(matches!(
        result,
        Err(EngineError::NoComparatorRegistered { data_node, .. }) if data_node == "output"
    ));
}

#[tokio::test]
async fn compare_with_no_instances_is_rejected() {
    let manager = manager(double_add_config(), 2);
    assert!(matches!(
        manager.compare("input", &[]),
        Err(EngineError::EmptyComparison)
    ));
}

#[tokio::test]
async fn compare_rejects_instances_of_different_scenarios() {
    let mut builder = ConfigBuilder::new();
    builder
        .data_node(DataNodeConfig::new("n").with_default(json!(0)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("m")).unwrap();
    builder
        .computation("copy", Arc::new(FnComputation::unary(|v| v)))
        .unwrap();
    builder.task(TaskConfig::new("t", "copy", ["n"], ["m"])).unwrap();
    builder
        .scenario(
            ScenarioConfig::new("first")
                .with_tasks(["t"])
                .with_comparator("n", difference()),
        )
        .unwrap();
    builder
        .scenario(ScenarioConfig::new("second").with_tasks(["t"]))
        .unwrap();

    let manager = manager(builder.build(), 2);
    let a = manager.create_scenario("first").unwrap();
    let b = manager.create_scenario("second").unwrap();

    assert!(matches!(
        manager.compare("n", &[a, b]),
        Err(EngineError::ScenarioConfigMismatch { .. })
    ));
}

// ============================================================
// Determinism under concurrency
// ============================================================

#[tokio::test]
async fn serial_and_parallel_execution_agree() {
    //      src
    //     /   \
    //  left   right
    //     \   /
    //      sum
    let build = || {
        let mut builder = ConfigBuilder::new();
        builder
            .data_node(DataNodeConfig::new("src").with_default(json!(3)))
            .unwrap();
        for id in ["left", "right", "sum"] {
            builder.data_node(DataNodeConfig::new(id)).unwrap();
        }
        builder
            .computation(
                "split",
                Arc::new(FnComputation::new(1, 2, |inputs| {
                    let v = inputs[0].as_i64().unwrap();
                    Ok(vec![json!(v * 10), json!(v * 100)])
                })),
            )
            .unwrap();
        builder
            .computation(
                "join",
                Arc::new(FnComputation::new(2, 1, |inputs| {
                    let a = inputs[0].as_i64().unwrap();
                    let b = inputs[1].as_i64().unwrap();
                    Ok(vec![json!(a + b)])
                })),
            )
            .unwrap();
        builder
            .task(TaskConfig::new("t_split", "split", ["src"], ["left", "right"]))
            .unwrap();
        builder
            .task(TaskConfig::new("t_join", "join", ["left", "right"], ["sum"]))
            .unwrap();
        builder
            .scenario(ScenarioConfig::new("s").with_tasks(["t_split", "t_join"]))
            .unwrap();
        builder.build()
    };

    let mut outputs = Vec::new();
    for workers in [1usize, 4] {
        let manager = manager(build(), workers);
        let instance = manager.create_scenario("s").unwrap();
        let submission = manager.submit(instance).await.unwrap();
        assert_eq!(submission.status(), SubmissionStatus::Completed);
        outputs.push((
            manager.read(instance, "left").unwrap(),
            manager.read(instance, "right").unwrap(),
            manager.read(instance, "sum").unwrap(),
        ));
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].2, json!(330));
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn cancelling_after_first_job_keeps_its_output_and_never_completes_the_second() {
    let mut builder = ConfigBuilder::new();
    builder
        .data_node(DataNodeConfig::new("src").with_default(json!(1)))
        .unwrap();
    builder.data_node(DataNodeConfig::new("mid")).unwrap();
    builder.data_node(DataNodeConfig::new("out")).unwrap();
    builder
        .computation("fast", Arc::new(FnComputation::unary(|v| v)))
        .unwrap();
    builder
        .computation(
            "slow",
            Arc::new(MockComputation::sleeping(
                "slow",
                1,
                Duration::from_millis(500),
                vec![json!(9)],
            )),
        )
        .unwrap();
    builder.task(TaskConfig::new("t_fast", "fast", ["src"], ["mid"])).unwrap();
    builder.task(TaskConfig::new("t_slow", "slow", ["mid"], ["out"])).unwrap();
    builder
        .scenario(ScenarioConfig::new("s").with_tasks(["t_fast", "t_slow"]))
        .unwrap();

    let manager = manager(builder.build(), 2);
    let instance = manager.create_scenario("s").unwrap();
    let submission = manager.submit_async(instance).unwrap();

    // Wait for the first job to finish, then cancel before the slow one can.
    for _ in 0..500 {
        if submission.job("t_fast").unwrap().state == JobState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(submission.job("t_fast").unwrap().state, JobState::Completed);
    submission.cancel();

    let status = submission.wait().await;
    assert_eq!(status, SubmissionStatus::Cancelled);

    // The second job must never complete; skipped or cancelled are both fine.
    let slow = submission.job("t_slow").unwrap();
    assert!(
        matches!(slow.state, JobState::Skipped | JobState::Cancelled),
        "unexpected state {:?}",
        slow.state
    );

    // The first job's output stays committed; the cancelled job's output was
    // discarded.
    assert_eq!(manager.read(instance, "mid").unwrap(), json!(1));
    assert!(matches!(
        manager.read(instance, "out"),
        Err(EngineError::NotWritten { .. })
    ));
}

// ============================================================
// Manager bookkeeping
// ============================================================

#[tokio::test]
async fn submissions_are_queryable_from_the_manager() {
    let manager = manager(double_add_config(), 2);
    let instance = manager.create_scenario("my_scenario").unwrap();
    let submission = manager.submit(instance).await.unwrap();

    let looked_up = manager.submission(submission.id()).unwrap();
    assert_eq!(looked_up.status(), SubmissionStatus::Completed);
    assert_eq!(manager.submissions_for(instance).len(), 1);

    // Jobs come back in topological order.
    let job_ids: Vec<String> = looked_up.jobs().into_iter().map(|j| j.task_id).collect();
    assert_eq!(job_ids, vec!["double", "add"]);
}

#[tokio::test]
async fn unknown_instance_is_reported() {
    let manager = manager(double_add_config(), 2);
    let ghost = uuid::Uuid::new_v4();
    assert!(matches!(
        manager.read(ghost, "input"),
        Err(EngineError::UnknownInstance(id)) if id == ghost
    ));
}
