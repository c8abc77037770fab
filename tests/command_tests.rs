//! # Command Task Tests
//!
//! External-process bodies end to end: argv materialization, captured
//! outputs, working directories, and the subprocess backend's contract.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spindle::{
    task_fn, BackendKind, CommandTemplate, ExecState, SplitSpec, SpindleError, Submitter,
    TaskInputs, TaskSpec, ValueKind, Workflow,
};

fn inputs(pairs: &[(&str, serde_json::Value)]) -> TaskInputs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn echo_task(name: &str) -> Arc<TaskSpec> {
    TaskSpec::builder(name)
        .input("msg", ValueKind::Str)
        .command(CommandTemplate::new("echo").arg_slot("msg"))
}

#[tokio::test]
async fn command_task_captures_stdout_and_status() {
    let submitter = Submitter::new(BackendKind::Subprocess);
    let report = submitter
        .submit_task(&echo_task("echo"), inputs(&[("msg", json!("hello"))]))
        .await
        .unwrap();

    assert_eq!(report.result("stdout").unwrap(), &json!("hello"));
    assert_eq!(report.result("status").unwrap(), &json!(0));
    assert!(report.result("cwd").unwrap().is_string());
}

#[tokio::test]
async fn command_task_reports_its_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let pwd = TaskSpec::builder("pwd")
        .command(CommandTemplate::new("pwd").cwd(dir.path()));

    let submitter = Submitter::new(BackendKind::Subprocess);
    let report = submitter.submit_task(&pwd, TaskInputs::new()).await.unwrap();
    assert_eq!(
        report.result("cwd").unwrap(),
        &json!(dir.path().display().to_string())
    );
}

#[tokio::test]
async fn failing_command_surfaces_stderr() {
    let fail = TaskSpec::builder("fail")
        .command(CommandTemplate::new("sh").arg("-c").arg("echo broken >&2; exit 2"));

    let submitter = Submitter::new(BackendKind::Subprocess);
    let report = submitter.submit_task(&fail, TaskInputs::new()).await.unwrap();

    assert_eq!(report.state("fail"), Some(ExecState::Errored));
    let err = report.result("stdout").unwrap_err();
    match err {
        SpindleError::TaskRuntime { message, .. } => assert!(message.contains("broken")),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn command_timeout_fails_the_task() {
    let slow = TaskSpec::builder("slow").command(
        CommandTemplate::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100)),
    );

    let submitter = Submitter::new(BackendKind::Subprocess);
    let report = submitter.submit_task(&slow, TaskInputs::new()).await.unwrap();

    let err = report.result("stdout").unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn subprocess_backend_rejects_function_bodies_as_dispatch_failure() {
    let func = task_fn("func", &[], ("out", ValueKind::Int), |_| Ok(json!(1)));
    let submitter = Submitter::new(BackendKind::Subprocess);
    let report = submitter.submit_task(&func, TaskInputs::new()).await.unwrap();

    let err = report.result("out").unwrap_err();
    match err {
        SpindleError::BackendDispatch { backend, .. } => assert_eq!(backend, "subprocess"),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn split_command_task_combines_stdout_in_order() {
    let mut wf = Workflow::new("echoes");
    let echo = wf.register(echo_task("echo")).unwrap();
    wf.bind_literal(&echo, "msg", json!(["a", "b", "c"])).unwrap();
    wf.split(&echo, SplitSpec::outer(&["msg"])).unwrap();
    wf.declare_output("lines", echo.output("stdout").unwrap())
        .unwrap();

    let submitter = Submitter::new(BackendKind::Subprocess);
    let report = submitter.submit(&wf, TaskInputs::new()).await.unwrap();
    assert_eq!(report.result("lines").unwrap(), &json!(["a", "b", "c"]));
}

#[tokio::test]
async fn command_output_feeds_a_function_task() {
    let parse = task_fn(
        "parse",
        &[("text", ValueKind::Str)],
        ("out", ValueKind::Int),
        |inputs| {
            inputs["text"]
                .as_str()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(|n| json!(n * 2))
                .ok_or_else(|| "stdout was not a number".to_string())
        },
    );

    let mut wf = Workflow::new("mixed");
    let emit = wf
        .register(
            TaskSpec::builder("emit").command(CommandTemplate::new("echo").arg("21")),
        )
        .unwrap();
    let parse = wf.register(parse).unwrap();
    wf.bind(&parse, "text", emit.output("stdout").unwrap().into())
        .unwrap();
    wf.declare_output("answer", parse.output("out").unwrap())
        .unwrap();

    // The pool backend runs both body kinds
    let submitter = Submitter::new(BackendKind::ConcurrentPool);
    let report = submitter.submit(&wf, TaskInputs::new()).await.unwrap();
    assert_eq!(report.result("answer").unwrap(), &json!(42));
}
