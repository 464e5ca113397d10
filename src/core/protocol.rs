//! Batch execution protocol: one sandbox invocation compiles once and runs
//! every test case, emitting one length-prefixed frame per case.
//!
//! ```text
//! @compile-error <len>\n<len bytes>\n
//! @case <index> <exit> <elapsed_ms> <oom> <stdout_len> <stderr_len>\n<stdout><stderr>\n
//! ```
//!
//! Payloads are skipped by length and never scanned, so nothing a program
//! prints can be mistaken for a frame header.

use crate::constants::{
    DRIVER_FILE, INPUT_FILE_PREFIX, KILL_EXIT_CODE, TIME_LIMIT_MESSAGE, TIMEOUT_EXIT_CODE, WORKDIR,
};
use crate::core::domain::ExecuteResult;
use crate::core::traits::backend::RawOutput;

const CASE_TAG: &str = "@case";
const COMPILE_ERROR_TAG: &str = "@compile-error";

/// Quotes `s` for `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Seconds for `timeout`, rounded up.
pub fn timeout_secs(timeout_ms: u64) -> u64 {
    timeout_ms.div_ceil(1000).max(1)
}

pub fn input_file_name(index: usize) -> String {
    format!("{INPUT_FILE_PREFIX}{index}")
}

pub fn driver_invocation() -> String {
    format!("sh {WORKDIR}/{DRIVER_FILE}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverScript {
    pub compile_command: Option<String>,
    pub run_command: String,
    pub case_count: usize,
    pub time_limit_ms: u64,
}

impl DriverScript {
    pub fn render(&self) -> String {
        let mut script = String::new();
        script.push_str(PRELUDE);

        if let Some(compile) = &self.compile_command {
            script.push_str(&format!(
                r#"
sh -c {compile} > /tmp/_ce 2>&1
if [ $? -ne 0 ]; then
  printf '{COMPILE_ERROR_TAG} %s\n' "$(fsize /tmp/_ce)"
  cat /tmp/_ce
  printf '\n'
  exit 0
fi
"#,
                compile = shell_quote(compile),
            ));
        }

        script.push_str(&format!(
            r#"
TL={tl}
RUN_CMD={run}
N={n}
i=0
while [ "$i" -lt "$N" ]; do
  IN_FILE="{WORKDIR}/{INPUT_FILE_PREFIX}$i"
  [ -f "$IN_FILE" ] || IN_FILE=/dev/null
  OUT_FILE="/tmp/_out_$i"
  ERR_FILE="/tmp/_err_$i"

  OOM_BEFORE=$(oom_count)
  START_NS=$(now_ns)
  timeout -s KILL "$TL" sh -c "$RUN_CMD" < "$IN_FILE" > "$OUT_FILE" 2> "$ERR_FILE"
  EC=$?
  END_NS=$(now_ns)
  OOM_AFTER=$(oom_count)

  MS=$(( (END_NS - START_NS) / 1000000 ))
  [ "$MS" -lt 0 ] && MS=0
  OOM=0
  [ "${{OOM_AFTER:-0}}" -gt "${{OOM_BEFORE:-0}}" ] && OOM=1

  printf '{CASE_TAG} %d %d %d %d %s %s\n' "$i" "$EC" "$MS" "$OOM" "$(fsize "$OUT_FILE")" "$(fsize "$ERR_FILE")"
  cat "$OUT_FILE" "$ERR_FILE"
  printf '\n'

  rm -f "$OUT_FILE" "$ERR_FILE"
  i=$((i + 1))
done
"#,
            tl = timeout_secs(self.time_limit_ms),
            run = shell_quote(&self.run_command),
            n = self.case_count,
        ));

        script
    }
}

const PRELUDE: &str = r#"#!/bin/sh
set -u
chmod -R 755 /w 2>/dev/null
rm -f /tmp/_out_* /tmp/_err_* /tmp/_ce 2>/dev/null

fsize() {
  _n=$(wc -c < "$1" 2>/dev/null | tr -d ' ')
  echo "${_n:-0}"
}

now_ns() {
  _t=$(date +%s%N 2>/dev/null)
  case "$_t" in
    ''|*[!0-9]*) _t=$(( $(date +%s) * 1000000000 )) ;;
  esac
  echo "$_t"
}

oom_count() {
  _c=0
  if [ -r /sys/fs/cgroup/memory.events ]; then
    _c=$(awk '$1 == "oom_kill" { print $2 }' /sys/fs/cgroup/memory.events 2>/dev/null)
  fi
  echo "${_c:-0}"
}
"#;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaseRecord {
    pub index: usize,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    /// The slot's cgroup recorded an OOM kill while the case ran.
    pub oom_killed: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOutput {
    CompileError(String),
    /// Indexed by case; `None` where no well-formed record arrived.
    Cases(Vec<Option<CaseRecord>>),
}

pub fn parse_batch_output(raw: &[u8], case_count: usize) -> BatchOutput {
    let mut records: Vec<Option<CaseRecord>> = vec![None; case_count];
    let mut pos = 0;

    while pos < raw.len() {
        let line_end = raw[pos..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(raw.len(), |offset| pos + offset);
        let header = String::from_utf8_lossy(&raw[pos..line_end]);
        let mut fields = header.split_ascii_whitespace();
        let payload_start = (line_end + 1).min(raw.len());

        match fields.next() {
            Some(COMPILE_ERROR_TAG) => {
                let Some(len) = fields.next().and_then(|f| f.parse::<usize>().ok()) else {
                    pos = payload_start;
                    continue;
                };
                let end = payload_start
                    .checked_add(len)
                    .map_or(raw.len(), |end| end.min(raw.len()));
                let diagnostic = String::from_utf8_lossy(&raw[payload_start..end]);
                return BatchOutput::CompileError(diagnostic.trim().to_string());
            }
            Some(CASE_TAG) => {
                let Some(header) = parse_case_header(fields) else {
                    tracing::warn!("Skipping malformed case header: {:?}", header);
                    pos = payload_start;
                    continue;
                };
                let ends = payload_start
                    .checked_add(header.stdout_len)
                    .and_then(|stdout_end| {
                        let stderr_end = stdout_end.checked_add(header.stderr_len)?;
                        Some((stdout_end, stderr_end))
                    })
                    .filter(|(_, stderr_end)| *stderr_end <= raw.len());
                let Some((stdout_end, stderr_end)) = ends else {
                    tracing::warn!(
                        "Batch output truncated inside case {} payload",
                        header.index
                    );
                    break;
                };
                if let Some(slot) = records.get_mut(header.index) {
                    if slot.is_none() {
                        *slot = Some(CaseRecord {
                            index: header.index,
                            exit_code: header.exit_code,
                            elapsed_ms: header.elapsed_ms,
                            oom_killed: header.oom_killed,
                            stdout: String::from_utf8_lossy(&raw[payload_start..stdout_end])
                                .into_owned(),
                            stderr: String::from_utf8_lossy(&raw[stdout_end..stderr_end])
                                .into_owned(),
                        });
                    }
                }
                pos = stderr_end;
                if raw.get(pos) == Some(&b'\n') {
                    pos += 1;
                }
            }
            _ => pos = payload_start,
        }
    }

    BatchOutput::Cases(records)
}

struct CaseHeader {
    index: usize,
    exit_code: i32,
    elapsed_ms: u64,
    oom_killed: bool,
    stdout_len: usize,
    stderr_len: usize,
}

fn parse_case_header<'a>(mut fields: impl Iterator<Item = &'a str>) -> Option<CaseHeader> {
    let header = CaseHeader {
        index: fields.next()?.parse().ok()?,
        exit_code: fields.next()?.parse().ok()?,
        elapsed_ms: fields.next()?.parse().ok()?,
        oom_killed: fields.next()? == "1",
        stdout_len: fields.next()?.parse().ok()?,
        stderr_len: fields.next()?.parse().ok()?,
    };
    fields.next().is_none().then_some(header)
}

/// How a process ended, before its output is looked at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitClass {
    Clean,
    TimeLimit,
    MemoryLimit,
    RuntimeError,
}

pub fn is_kill_status(exit_code: i32) -> bool {
    exit_code == KILL_EXIT_CODE || exit_code == TIMEOUT_EXIT_CODE
}

/// A kill near the time limit is a timeout. A kill well before it is only a
/// memory kill when something outside the program did the killing.
pub fn classify_exit(
    exit_code: i32,
    elapsed_ms: u64,
    externally_killed: bool,
    time_limit_ms: u64,
    slack_ms: u64,
) -> ExitClass {
    if exit_code == 0 {
        return ExitClass::Clean;
    }
    if is_kill_status(exit_code) {
        if elapsed_ms >= time_limit_ms.saturating_sub(slack_ms) {
            return ExitClass::TimeLimit;
        }
        if externally_killed {
            return ExitClass::MemoryLimit;
        }
    }
    ExitClass::RuntimeError
}

pub fn classify_record(record: &CaseRecord, time_limit_ms: u64, slack_ms: u64) -> ExitClass {
    classify_exit(
        record.exit_code,
        record.elapsed_ms,
        record.oom_killed || record.stderr.contains("Killed"),
        time_limit_ms,
        slack_ms,
    )
}

/// Single-shot classification used by the debug run.
pub fn classify_invocation(raw: RawOutput, timeout_ms: u64, slack_ms: u64) -> ExecuteResult {
    let stdout = String::from_utf8_lossy(&raw.stdout)
        .trim_end_matches('\n')
        .to_string();
    let stderr = String::from_utf8_lossy(&raw.stderr).into_owned();

    let timed_out = ExecuteResult {
        stdout: stdout.clone(),
        stderr: TIME_LIMIT_MESSAGE.to_string(),
        exit_code: TIMEOUT_EXIT_CODE,
        timed_out: true,
        oom_killed: false,
        runtime_ms: raw.elapsed_ms,
    };

    if raw.deadline_exceeded {
        return timed_out;
    }

    if raw.exit_code == KILL_EXIT_CODE {
        return match classify_exit(
            raw.exit_code,
            raw.elapsed_ms,
            stderr.contains("Killed"),
            timeout_ms,
            slack_ms,
        ) {
            ExitClass::MemoryLimit => ExecuteResult {
                stdout,
                stderr,
                exit_code: raw.exit_code,
                timed_out: false,
                oom_killed: true,
                runtime_ms: raw.elapsed_ms,
            },
            _ => timed_out,
        };
    }

    ExecuteResult {
        stdout,
        stderr,
        exit_code: raw.exit_code,
        timed_out: false,
        oom_killed: false,
        runtime_ms: raw.elapsed_ms,
    }
}
