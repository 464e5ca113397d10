use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use crate::config::JudgeSettings;
use crate::constants::{DRIVER_FILE, WORKDIR, WORKSPACE_PREFIX};
use crate::core::compare::outputs_equal;
use crate::core::domain::{
    CaseResult, ExecuteRequest, ExecuteResult, FailedCase, JudgeRequest, JudgeResult,
    JudgeTestCase, RunMode, RunResult, Status,
};
use crate::core::errors::JudgeError;
use crate::core::languages::{LanguageRegistry, LanguageSpec};
use crate::core::pool::{Lease, PoolManager};
use crate::core::protocol::{
    BatchOutput, CaseRecord, DriverScript, ExitClass, classify_invocation, classify_record,
    driver_invocation, input_file_name, parse_batch_output, shell_quote,
};
use crate::core::traits::backend::{Backend, BackendError, Invocation, RawOutput};

const COMPILE_ERROR_MARKERS: [&str; 5] = [
    "error:",
    "syntax error",
    "compilation failed",
    "cannot find symbol",
    "undeclared identifier",
];

#[derive(Debug)]
pub struct JudgeEngine {
    backend: Arc<dyn Backend>,
    pools: Arc<PoolManager>,
    languages: Arc<LanguageRegistry>,
    settings: JudgeSettings,
}

impl JudgeEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        pools: Arc<PoolManager>,
        languages: Arc<LanguageRegistry>,
        settings: JudgeSettings,
    ) -> Self {
        Self {
            backend,
            pools,
            languages,
            settings,
        }
    }

    /// Compiles once and runs every test case in a single leased slot.
    ///
    /// Only an unknown language or a host-side workspace failure is returned
    /// as an error. Everything that goes wrong after that is a verdict.
    #[tracing::instrument(
        skip(self, request),
        fields(
            run_id = %Uuid::new_v4(),
            language = %request.language,
            cases = request.test_cases.len(),
        )
    )]
    pub async fn judge(&self, request: &JudgeRequest) -> Result<JudgeResult, JudgeError> {
        let language = self.languages.resolve(&request.language)?;
        let time_limit_ms = self.time_limit(language, request.time_limit_ms);
        let memory_mb = self.memory_limit(request.memory_limit_mb);
        let total = request.test_cases.len();

        let driver = DriverScript {
            compile_command: language.compile_command.clone(),
            run_command: language.run_command.clone(),
            case_count: total,
            time_limit_ms,
        };
        let workspace = self.create_workspace()?;
        let dir = workspace.path();
        self.write_source(dir, language, &request.code).await?;
        for (index, case) in request.test_cases.iter().enumerate() {
            tokio::fs::write(dir.join(input_file_name(index)), &case.input).await?;
        }
        tokio::fs::write(dir.join(DRIVER_FILE), driver.render()).await?;

        let lease = match self
            .pools
            .acquire(&language.image, slot_memory(language, memory_mb))
            .await
        {
            Ok(lease) => lease,
            Err(err) => {
                tracing::error!("Could not lease a slot: {}", err);
                return Ok(JudgeResult::system_error(total, err.to_string()));
            }
        };

        let invocation = Invocation {
            command: driver_invocation(),
            privileged: true,
            timeout_ms: time_limit_ms
                .saturating_mul(total as u64)
                .saturating_add(self.settings.batch_grace_ms),
            stdin: None,
        };
        let outcome = self.invoke(&lease, dir, &invocation).await;
        lease.release();

        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!("Batch invocation failed: {}", err);
                return Ok(JudgeResult::system_error(total, err.to_string()));
            }
        };
        if raw.deadline_exceeded {
            tracing::warn!("Batch hit the outer deadline after {} ms", raw.elapsed_ms);
        }

        let result = match parse_batch_output(&raw.stdout, total) {
            BatchOutput::CompileError(diagnostic) => {
                let diagnostic = if diagnostic.is_empty() {
                    String::from_utf8_lossy(&raw.stderr).trim().to_string()
                } else {
                    diagnostic
                };
                JudgeResult::compile_error(total, diagnostic)
            }
            BatchOutput::Cases(records) => evaluate(
                &request.test_cases,
                &records,
                &Evaluation {
                    auto_wrap: language.auto_wrap,
                    time_limit_ms,
                    slack_ms: self.settings.oom_slack_ms,
                    mode: request.mode,
                    deadline_exceeded: raw.deadline_exceeded,
                    missing_reason: missing_reason(&raw),
                },
            ),
        };

        tracing::info!(
            "Verdict {:?}: {}/{} passed in {} ms",
            result.status,
            result.passed,
            result.total,
            result.runtime_ms
        );
        Ok(result)
    }

    /// Single-shot run of `code` on one stdin, compile step included.
    #[tracing::instrument(
        skip(self, request),
        fields(run_id = %Uuid::new_v4(), language = %request.language)
    )]
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ExecuteResult, JudgeError> {
        let language = self.languages.resolve(&request.language)?;
        let time_limit_ms = self.time_limit(language, request.time_limit_ms);
        let memory_mb = self.memory_limit(request.memory_limit_mb);

        let workspace = self.create_workspace()?;
        let dir = workspace.path();
        self.write_source(dir, language, &request.code).await?;

        let lease = self
            .pools
            .acquire(&language.image, slot_memory(language, memory_mb))
            .await?;

        let prepare = Invocation {
            command: format!("chmod -R 755 {WORKDIR}"),
            privileged: true,
            timeout_ms: self.settings.batch_grace_ms,
            stdin: None,
        };
        let invocation = Invocation {
            command: single_shot_command(language),
            privileged: false,
            timeout_ms: time_limit_ms,
            stdin: Some(request.input.clone()),
        };

        let outcome = match self.invoke(&lease, dir, &prepare).await {
            Ok(_) => {
                let outcome = self.backend.exec(lease.name(), &invocation).await;
                if outcome.is_err() {
                    self.pools.health_repair(&lease).await;
                }
                outcome
            }
            Err(err) => Err(err),
        };
        lease.release();

        let result = classify_invocation(outcome?, time_limit_ms, self.settings.oom_slack_ms);
        tracing::debug!("Execution result: {:?}", result);
        Ok(result)
    }

    /// Debug run mapped to a status. Infrastructure failures become
    /// [`Status::SystemError`].
    pub async fn run(&self, request: &ExecuteRequest) -> Result<RunResult, JudgeError> {
        let language = self.languages.resolve(&request.language)?;
        let has_compile_step = language.compile_command.is_some();

        match self.execute(request).await {
            Ok(result) => Ok(RunResult {
                status: run_status(&result, has_compile_step),
                stdout: result.stdout,
                stderr: result.stderr,
                runtime_ms: result.runtime_ms,
            }),
            Err(err @ (JudgeError::Pool(_) | JudgeError::Sandbox(_))) => {
                tracing::error!("Debug run failed: {}", err);
                Ok(RunResult {
                    status: Status::SystemError,
                    stdout: String::new(),
                    stderr: err.to_string(),
                    runtime_ms: 0,
                })
            }
            Err(err) => Err(err),
        }
    }

    fn time_limit(&self, language: &LanguageSpec, requested_ms: Option<u64>) -> u64 {
        match requested_ms {
            Some(limit) if limit > 0 => limit.saturating_mul(language.time_multiplier.max(1)),
            _ => self.settings.default_time_limit_ms,
        }
    }

    fn memory_limit(&self, requested_mb: Option<u64>) -> u64 {
        requested_mb
            .filter(|mb| *mb > 0)
            .unwrap_or(self.settings.default_memory_limit_mb)
    }

    fn create_workspace(&self) -> std::io::Result<TempDir> {
        tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.settings.workspace_root)
    }

    async fn write_source(
        &self,
        dir: &Path,
        language: &LanguageSpec,
        code: &str,
    ) -> std::io::Result<()> {
        let source = self.languages.wrap(language, code);
        tokio::fs::write(dir.join(&language.source_file), source).await
    }

    /// Copies the workspace in and runs `invocation`. A failure in either
    /// step gets the slot checked and repaired before the lease is returned.
    async fn invoke(
        &self,
        lease: &Lease,
        workspace: &Path,
        invocation: &Invocation,
    ) -> Result<RawOutput, BackendError> {
        let outcome = match self.backend.copy_in(lease.name(), workspace).await {
            Ok(()) => self.backend.exec(lease.name(), invocation).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &outcome {
            tracing::warn!("Slot {} ({}) failed: {}", lease.name(), lease.image(), err);
            self.pools.health_repair(lease).await;
        }
        outcome
    }
}

fn slot_memory(language: &LanguageSpec, memory_mb: u64) -> u64 {
    language
        .compile_memory_mb
        .map_or(memory_mb, |compile_mb| compile_mb.max(memory_mb))
}

fn single_shot_command(language: &LanguageSpec) -> String {
    let command = match &language.compile_command {
        Some(compile) => format!("{compile} && {}", language.run_command),
        None => language.run_command.clone(),
    };
    format!("sh -c {}", shell_quote(&command))
}

fn missing_reason(raw: &RawOutput) -> String {
    let stderr = String::from_utf8_lossy(&raw.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("no result recorded (driver exited with {})", raw.exit_code)
    } else {
        format!("no result recorded: {stderr}")
    }
}

pub fn looks_like_compile_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    COMPILE_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

pub fn run_status(result: &ExecuteResult, has_compile_step: bool) -> Status {
    if result.timed_out {
        Status::TimeLimitExceeded
    } else if result.oom_killed {
        Status::MemoryLimitExceeded
    } else if result.exit_code != 0 {
        if has_compile_step && looks_like_compile_error(&result.stderr) {
            Status::CompileError
        } else {
            Status::RuntimeError
        }
    } else {
        Status::Accepted
    }
}

/// Everything about a run that case evaluation depends on.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub auto_wrap: bool,
    pub time_limit_ms: u64,
    pub slack_ms: u64,
    pub mode: RunMode,
    /// The outer deadline tore the batch down.
    pub deadline_exceeded: bool,
    pub missing_reason: String,
}

struct CaseVerdict {
    status: Status,
    actual: String,
    runtime_ms: u64,
}

fn judge_case(
    case: &JudgeTestCase,
    record: Option<&CaseRecord>,
    evaluation: &Evaluation,
) -> CaseVerdict {
    let Some(record) = record else {
        return if evaluation.deadline_exceeded {
            CaseVerdict {
                status: Status::TimeLimitExceeded,
                actual: String::new(),
                runtime_ms: evaluation.time_limit_ms,
            }
        } else {
            CaseVerdict {
                status: Status::SystemError,
                actual: evaluation.missing_reason.clone(),
                runtime_ms: 0,
            }
        };
    };

    let (status, actual) = match classify_record(
        record,
        evaluation.time_limit_ms,
        evaluation.slack_ms,
    ) {
        ExitClass::TimeLimit => (Status::TimeLimitExceeded, String::new()),
        ExitClass::MemoryLimit => (Status::MemoryLimitExceeded, String::new()),
        ExitClass::RuntimeError => (Status::RuntimeError, record.stderr.clone()),
        ExitClass::Clean => {
            let stdout = record.stdout.trim_end_matches('\n').to_string();
            let status = if case.expected.trim().is_empty()
                || outputs_equal(evaluation.auto_wrap, &stdout, &case.expected)
            {
                Status::Accepted
            } else {
                Status::WrongAnswer
            };
            (status, stdout)
        }
    };

    CaseVerdict {
        status,
        actual,
        runtime_ms: record.elapsed_ms,
    }
}

fn failed_case(index: usize, case: &JudgeTestCase, verdict: &CaseVerdict) -> FailedCase {
    let mut failed = FailedCase {
        index: index as i64,
        input: Some(case.input.clone()),
        ..Default::default()
    };
    match verdict.status {
        Status::SystemError => failed.actual = Some(verdict.actual.clone()),
        Status::RuntimeError | Status::WrongAnswer => {
            failed.expected = Some(case.expected.clone());
            failed.actual = Some(verdict.actual.clone());
        }
        _ => {}
    }
    failed
}

/// Turns per-case records into the run's verdict.
pub fn evaluate(
    cases: &[JudgeTestCase],
    records: &[Option<CaseRecord>],
    evaluation: &Evaluation,
) -> JudgeResult {
    let mut passed = 0;
    let mut runtime_ms = 0;
    let mut failure: Option<(Status, FailedCase)> = None;
    let mut all_cases = Vec::new();

    for (index, case) in cases.iter().enumerate() {
        let record = records.get(index).and_then(Option::as_ref);
        let verdict = judge_case(case, record, evaluation);
        runtime_ms = runtime_ms.max(verdict.runtime_ms);

        if verdict.status == Status::Accepted {
            passed += 1;
        } else if failure.is_none() {
            failure = Some((verdict.status, failed_case(index, case, &verdict)));
        }

        match evaluation.mode {
            RunMode::RunAll => all_cases.push(CaseResult {
                index,
                status: verdict.status,
                actual: verdict.actual,
            }),
            RunMode::ShortCircuit if verdict.status != Status::Accepted => break,
            RunMode::ShortCircuit => {}
        }
    }

    let (status, failed_case) = match failure {
        Some((status, failed)) => (status, Some(failed)),
        None => (Status::Accepted, None),
    };

    JudgeResult {
        status,
        passed,
        total: cases.len(),
        runtime_ms,
        memory_kb: None,
        failed_case,
        all_cases: (evaluation.mode == RunMode::RunAll).then_some(all_cases),
    }
}
