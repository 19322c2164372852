//! The cell execution loop: poll the remote kernel until the run finishes.

use anyhow::Result;
use serde_json::{json, Value};

use crate::api::{ApiError, ConsoleItem, ExecutionResult, RunMode, RunStatus};

pub const INPUT_NOT_ALLOWED: &str = "(user input not allowed)";

/// The remote side of a cell run.
pub trait CodeRunner {
    async fn execute(
        &self,
        run_id: Option<&str>,
        code: &str,
        mode: RunMode,
    ) -> Result<ExecutionResult, ApiError>;
}

/// Where a cell's output goes.
pub trait CellOutput {
    async fn stream(&mut self, name: &str, text: &str) -> Result<()>;
    async fn display(&mut self, data: Value) -> Result<()>;
    async fn input(&mut self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy)]
pub struct RunFlags {
    pub silent: bool,
    pub allow_stdin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOutcome {
    Finished,
    /// The service rejected a call; the lines were already sent to stderr.
    Failed { ename: String, evalue: String },
}

/// Notebook-facing wording for a failed remote call.
pub fn error_lines(err: &ApiError) -> Vec<String> {
    if err.is_not_found() {
        return vec![
            "[Backend.AI] The kernel is not found (maybe terminated due to idle/exec timeouts).".into(),
            "[Backend.AI] Please restart the kernel to run again.".into(),
        ];
    }
    match err {
        ApiError::Server { status, reason, title } => vec![format!(
            "[Backend.AI] The server returned an error: {status} {reason} ({title})"
        )],
        other => vec![format!("[Backend.AI] {other}")],
    }
}

async fn forward<O: CellOutput>(out: &mut O, item: ConsoleItem) -> Result<()> {
    match item {
        ConsoleItem::Stdout(text) => out.stream("stdout", &text).await,
        ConsoleItem::Stderr(text) => out.stream("stderr", &text).await,
        ConsoleItem::Media { mime, data } => {
            let mut bundle = serde_json::Map::new();
            bundle.insert(mime, data);
            out.display(Value::Object(bundle)).await
        }
        ConsoleItem::Html(html) => out.display(json!({ "text/html": html })).await,
        ConsoleItem::Other(kind) => {
            tracing::debug!(%kind, "ignoring console item");
            Ok(())
        }
    }
}

pub async fn run_cell<R: CodeRunner, O: CellOutput>(
    runner: &R,
    out: &mut O,
    code: &str,
    flags: RunFlags,
) -> Result<CellOutcome> {
    let mut mode = RunMode::Query;
    let mut code = code.to_string();
    let mut run_id: Option<String> = None;

    loop {
        let result = match runner.execute(run_id.as_deref(), &code, mode).await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(error = %err, "execute failed");
                for line in error_lines(&err) {
                    out.stream("stderr", &format!("{line}\n")).await?;
                }
                return Ok(CellOutcome::Failed {
                    ename: "BackendAPIError".into(),
                    evalue: err.to_string(),
                });
            }
        };
        if result.run_id.is_some() {
            run_id = result.run_id;
        }

        let exit_code = result.exit_code;
        if !flags.silent {
            for item in result.console {
                forward(out, item).await?;
            }
        }

        match result.status {
            RunStatus::Finished => {
                tracing::debug!(?exit_code, "run finished");
                return Ok(CellOutcome::Finished);
            }
            RunStatus::WaitingInput => {
                mode = RunMode::Input;
                code = if flags.allow_stdin {
                    out.input("").await?
                } else {
                    INPUT_NOT_ALLOWED.to_string()
                };
            }
            RunStatus::Continued | RunStatus::BuildFinished => {
                mode = RunMode::Continue;
                code.clear();
            }
            RunStatus::Other(status) => {
                tracing::debug!(%status, "unrecognized run status, continuing");
                mode = RunMode::Continue;
                code.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, sync::Mutex};

    type Call = (Option<String>, String, RunMode);

    struct Scripted {
        replies: Mutex<VecDeque<Result<ExecutionResult, ApiError>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<ExecutionResult, ApiError>>) -> Self {
            Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()) }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CodeRunner for Scripted {
        async fn execute(
            &self,
            run_id: Option<&str>,
            code: &str,
            mode: RunMode,
        ) -> Result<ExecutionResult, ApiError> {
            self.calls
                .lock()
                .unwrap()
                .push((run_id.map(str::to_string), code.to_string(), mode));
            self.replies.lock().unwrap().pop_front().expect("unexpected execute call")
        }
    }

    #[derive(Default)]
    struct Recorder {
        streams: Vec<(String, String)>,
        displays: Vec<Value>,
        prompts: usize,
    }

    impl CellOutput for Recorder {
        async fn stream(&mut self, name: &str, text: &str) -> Result<()> {
            self.streams.push((name.into(), text.into()));
            Ok(())
        }
        async fn display(&mut self, data: Value) -> Result<()> {
            self.displays.push(data);
            Ok(())
        }
        async fn input(&mut self, _prompt: &str) -> Result<String> {
            self.prompts += 1;
            Ok("42".into())
        }
    }

    fn result(status: &str, console: Value) -> Result<ExecutionResult, ApiError> {
        Ok(serde_json::from_value(json!({ "runId": "run-1", "status": status, "console": console })).unwrap())
    }

    const LOUD: RunFlags = RunFlags { silent: false, allow_stdin: true };

    #[tokio::test]
    async fn console_items_map_to_streams_and_displays() {
        let runner = Scripted::new(vec![result(
            "finished",
            json!([
                ["stdout", "hello\n"],
                ["stderr", "warn\n"],
                ["media", ["image/svg+xml", "<svg/>"]],
                ["html", "<p>x</p>"],
                ["log", "ignored"]
            ]),
        )]);
        let mut out = Recorder::default();
        let outcome = run_cell(&runner, &mut out, "print('hello')", LOUD).await.unwrap();

        assert_eq!(outcome, CellOutcome::Finished);
        assert_eq!(
            out.streams,
            vec![("stdout".into(), "hello\n".into()), ("stderr".into(), "warn\n".into())]
        );
        assert_eq!(out.displays, vec![json!({ "image/svg+xml": "<svg/>" }), json!({ "text/html": "<p>x</p>" })]);
        assert_eq!(runner.calls(), vec![(None, "print('hello')".into(), RunMode::Query)]);
    }

    #[tokio::test]
    async fn silent_runs_suppress_output() {
        let runner = Scripted::new(vec![result("finished", json!([["stdout", "x"]]))]);
        let mut out = Recorder::default();
        run_cell(&runner, &mut out, "x", RunFlags { silent: true, allow_stdin: true })
            .await
            .unwrap();
        assert!(out.streams.is_empty());
    }

    #[tokio::test]
    async fn continued_and_input_states_drive_next_call() {
        let runner = Scripted::new(vec![
            result("build-finished", json!([])),
            result("continued", json!([])),
            result("waiting-input", json!([["stdout", "n? "]])),
            result("finished", json!([])),
        ]);
        let mut out = Recorder::default();
        run_cell(&runner, &mut out, "main()", LOUD).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0], (None, "main()".into(), RunMode::Query));
        assert_eq!(calls[1], (Some("run-1".into()), String::new(), RunMode::Continue));
        assert_eq!(calls[2], (Some("run-1".into()), String::new(), RunMode::Continue));
        assert_eq!(calls[3], (Some("run-1".into()), "42".into(), RunMode::Input));
        assert_eq!(out.prompts, 1);
    }

    #[tokio::test]
    async fn stdin_disallowed_sends_placeholder() {
        let runner = Scripted::new(vec![result("waiting-input", json!([])), result("finished", json!([]))]);
        let mut out = Recorder::default();
        run_cell(&runner, &mut out, "input()", RunFlags { silent: false, allow_stdin: false })
            .await
            .unwrap();
        assert_eq!(runner.calls()[1].1, INPUT_NOT_ALLOWED);
        assert_eq!(out.prompts, 0);
    }

    #[tokio::test]
    async fn missing_kernel_reports_restart_hint() {
        let runner = Scripted::new(vec![Err(ApiError::Server {
            status: 404,
            reason: "Not Found".into(),
            title: "No such kernel.".into(),
        })]);
        let mut out = Recorder::default();
        let outcome = run_cell(&runner, &mut out, "1", LOUD).await.unwrap();

        assert!(matches!(outcome, CellOutcome::Failed { .. }));
        assert_eq!(out.streams.len(), 2);
        assert!(out.streams[0].1.contains("The kernel is not found"));
        assert!(out.streams[1].1.contains("Please restart the kernel"));
    }

    #[test]
    fn server_errors_include_status_and_title() {
        let err = ApiError::Server { status: 500, reason: "Internal Server Error".into(), title: "boom".into() };
        assert_eq!(
            error_lines(&err),
            vec!["[Backend.AI] The server returned an error: 500 Internal Server Error (boom)".to_string()]
        );
    }
}
