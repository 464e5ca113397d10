use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Accepted,
    WrongAnswer,
    RuntimeError,
    CompileError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    SystemError,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Stop at the first failing case and disclose nothing after it.
    #[default]
    ShortCircuit,
    RunAll,
}

/// Expected output may be empty while test data is still being imported;
/// such a case is still checked for TLE/MLE/RE but never for WA.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeTestCase {
    pub input: String,
    #[serde(default)]
    pub expected: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct JudgeRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub test_cases: Vec<JudgeTestCase>,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub mode: RunMode,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FailedCase {
    /// Zero-based; -1 when the failure is not tied to one case.
    pub index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CaseResult {
    pub index: usize,
    pub status: Status,
    /// Stdout for AC/WA, stderr for RE, the reason for SE.
    pub actual: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub status: Status,
    pub passed: usize,
    pub total: usize,
    /// Slowest evaluated case.
    pub runtime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_case: Option<FailedCase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_cases: Option<Vec<CaseResult>>,
}

impl JudgeResult {
    pub fn compile_error(total: usize, diagnostic: String) -> Self {
        Self::run_level(Status::CompileError, total, diagnostic)
    }

    pub fn system_error(total: usize, reason: String) -> Self {
        Self::run_level(Status::SystemError, total, reason)
    }

    fn run_level(status: Status, total: usize, actual: String) -> Self {
        Self {
            status,
            passed: 0,
            total,
            runtime_ms: 0,
            memory_kb: None,
            failed_case: Some(FailedCase {
                index: -1,
                actual: Some(actual),
                ..Default::default()
            }),
            all_cases: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExecuteRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub runtime_ms: u64,
}

/// Debug-run view of an [`ExecuteResult`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
    pub runtime_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_camel_case() {
        let result = JudgeResult {
            status: Status::WrongAnswer,
            passed: 1,
            total: 2,
            runtime_ms: 15,
            memory_kb: None,
            failed_case: Some(FailedCase {
                index: 1,
                input: Some("[1]".to_string()),
                expected: Some("1".to_string()),
                actual: Some("2".to_string()),
            }),
            all_cases: None,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "WrongAnswer");
        assert_eq!(json["runtimeMs"], 15);
        assert_eq!(json["failedCase"]["index"], 1);
        assert!(json.get("memoryKb").is_none());
        assert!(json.get("allCases").is_none());
    }

    #[test]
    fn test_compile_error_has_no_case_index() {
        let result = JudgeResult::compile_error(3, "error: expected ';'".to_string());
        assert_eq!(result.status, Status::CompileError);
        assert_eq!(result.passed, 0);
        assert_eq!(result.total, 3);
        assert_eq!(result.failed_case.as_ref().map(|f| f.index), Some(-1));
        assert!(result.all_cases.is_none());
    }

    #[test]
    fn test_request_defaults() {
        let request: JudgeRequest =
            serde_json::from_str(r#"{"language":"cpp","code":"int main(){}"}"#).unwrap();
        assert!(request.test_cases.is_empty());
        assert_eq!(request.mode, RunMode::ShortCircuit);
        assert_eq!(request.time_limit_ms, None);
    }
}
