//! Verification layer.
//!
//! Assertions are fail-fast: a mismatch returns `AssertionFailure` carrying
//! the literal observed and expected values. Nothing here retries.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use super::logging::{LogLevel, PhaseContext, PhaseEventInput, ScenarioPhase, TestLogger};
use super::process::StopStatus;
use crate::errors::{HarnessError, HarnessResult};

/// Above this many line pairs the diff falls back to a positional comparison.
const LCS_CELL_LIMIT: usize = 4_000_000;

/// Diff lines kept in an assertion message; the full diff goes to an artifact.
const DIFF_DETAIL_LINES: usize = 40;

/// Outcome of one comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub observed: String,
    pub expected: String,
    pub pass: bool,
    pub message: String,
}

impl VerificationResult {
    pub fn into_result(self) -> HarnessResult<()> {
        if self.pass {
            Ok(())
        } else {
            Err(HarnessError::AssertionFailure {
                context: self.message,
                observed: self.observed,
                expected: self.expected,
                detail: None,
            })
        }
    }
}

/// Issues assertions and records each one as a verify-phase event.
#[derive(Clone)]
pub struct Verifier {
    logger: TestLogger,
    passed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl Verifier {
    pub fn new(logger: TestLogger) -> Self {
        Self {
            logger,
            passed: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn passed(&self) -> usize {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Compare without failing.
    pub fn check_eq<T: PartialEq + Debug + ?Sized>(
        &self,
        observed: &T,
        expected: &T,
        context: &str,
    ) -> VerificationResult {
        VerificationResult {
            observed: format!("{observed:?}"),
            expected: format!("{expected:?}"),
            pass: observed == expected,
            message: context.to_string(),
        }
    }

    /// Fail with both values when `observed != expected`.
    pub fn assert_eq<T: PartialEq + Debug + ?Sized>(
        &self,
        observed: &T,
        expected: &T,
        context: &str,
    ) -> HarnessResult<()> {
        let result = self.check_eq(observed, expected, context);
        self.record(&result, "ASSERT_EQ", None);
        result.into_result()
    }

    pub fn assert(&self, condition: bool, context: &str) -> HarnessResult<()> {
        let result = VerificationResult {
            observed: condition.to_string(),
            expected: "true".to_string(),
            pass: condition,
            message: context.to_string(),
        };
        self.record(&result, "ASSERT_TRUE", None);
        result.into_result()
    }

    /// Require a clean exit with `expected`; an escalated kill never matches.
    pub fn assert_exit_code(
        &self,
        status: &StopStatus,
        expected: i32,
        context: &str,
    ) -> HarnessResult<()> {
        let result = VerificationResult {
            observed: status.to_string(),
            expected: format!("exit code {expected} without escalation"),
            pass: status.is_interrupted(expected),
            message: context.to_string(),
        };
        self.record(&result, "ASSERT_EXIT_CODE", None);
        result.into_result()
    }

    /// Line diff of two files; empty when identical.
    pub fn diff_files(&self, a: &Path, b: &Path) -> HarnessResult<String> {
        diff_files(a, b)
    }

    /// Fail with the diff when the two files differ.
    pub fn assert_files_identical(&self, a: &Path, b: &Path, context: &str) -> HarnessResult<()> {
        let diff = match diff_files(a, b) {
            Ok(diff) => diff,
            Err(HarnessError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                let result = VerificationResult {
                    observed: format!("missing file ({err})"),
                    expected: format!("{} identical to {}", a.display(), b.display()),
                    pass: false,
                    message: context.to_string(),
                };
                self.record(&result, "ASSERT_FILES_IDENTICAL", None);
                return result.into_result();
            }
            Err(err) => return Err(err),
        };

        let result = VerificationResult {
            observed: if diff.is_empty() {
                "identical".to_string()
            } else {
                format!("{} differing lines", diff.lines().count())
            },
            expected: "identical".to_string(),
            pass: diff.is_empty(),
            message: context.to_string(),
        };
        let artifact = if diff.is_empty() {
            None
        } else {
            self.logger
                .capture_artifact_text(&format!("diff-{context}"), &diff)
                .ok()
        };
        self.record(&result, "ASSERT_FILES_IDENTICAL", artifact.as_deref());
        if result.pass {
            return Ok(());
        }

        let mut detail: Vec<&str> = diff.lines().take(DIFF_DETAIL_LINES).collect();
        let hidden = diff.lines().count().saturating_sub(DIFF_DETAIL_LINES);
        let more = format!("... {hidden} more lines");
        if hidden > 0 {
            detail.push(&more);
        }
        Err(HarnessError::AssertionFailure {
            context: result.message,
            observed: result.observed,
            expected: result.expected,
            detail: Some(detail.join("\n")),
        })
    }

    /// Sorted entry names, or `None` when `path` does not exist.
    pub fn list_directory(&self, path: &Path) -> HarnessResult<Option<Vec<String>>> {
        list_directory(path)
    }

    /// Fail with the listing when `path` exists.
    pub fn assert_absent(&self, path: &Path, context: &str) -> HarnessResult<()> {
        let listing = list_directory(path)?;
        let result = VerificationResult {
            observed: match &listing {
                None => "absent".to_string(),
                Some(entries) => format!("{} [{}]", path.display(), entries.join(", ")),
            },
            expected: "absent".to_string(),
            pass: listing.is_none(),
            message: context.to_string(),
        };
        let artifact = listing.as_ref().and_then(|entries| {
            self.logger
                .capture_artifact_json(&format!("listing-{context}"), entries)
                .ok()
        });
        self.record(&result, "ASSERT_ABSENT", artifact.as_deref());
        result.into_result()
    }

    /// Warn when `observed` is not above `bound`. Never fails.
    pub fn diagnostic_lt(&self, bound: u64, observed: u64, context: &str) -> bool {
        let holds = bound < observed;
        let (decision, level) = if holds {
            ("DIAGNOSTIC_OK", LogLevel::Debug)
        } else {
            ("DIAGNOSTIC_WARN", LogLevel::Warn)
        };
        self.logger.log_phase_event(
            PhaseEventInput::new(
                ScenarioPhase::Verify,
                format!("{context}: {bound} < {observed} is {holds}"),
                PhaseContext::decision_only(decision)
                    .values(observed.to_string(), format!("> {bound}")),
            )
            .level(level),
        );
        holds
    }

    fn record(&self, result: &VerificationResult, kind: &str, artifact: Option<&Path>) {
        let (suffix, level, counter) = if result.pass {
            ("PASS", LogLevel::Info, &self.passed)
        } else {
            ("FAIL", LogLevel::Error, &self.failed)
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut event = PhaseEventInput::new(
            ScenarioPhase::Verify,
            result.message.clone(),
            PhaseContext::decision_only(format!("{kind}_{suffix}"))
                .values(result.observed.clone(), result.expected.clone()),
        )
        .level(level);
        if let Some(path) = artifact {
            event = event.artifact(path);
        }
        self.logger.log_phase_event(event);
    }
}

/// Sorted entry names, or `None` when `path` does not exist.
pub fn list_directory(path: &Path) -> HarnessResult<Option<Vec<String>>> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(Some(names))
}

/// Compare two files; empty output means identical.
///
/// Text files get a line diff with `-N: line` for lines only in `a` and
/// `+N: line` for lines only in `b`. Binary files report the first
/// differing byte.
pub fn diff_files(a: &Path, b: &Path) -> HarnessResult<String> {
    let left = std::fs::read(a)?;
    let right = std::fs::read(b)?;
    Ok(diff_bytes(&left, &right))
}

pub fn diff_bytes(left: &[u8], right: &[u8]) -> String {
    if left == right {
        return String::new();
    }
    match (std::str::from_utf8(left), std::str::from_utf8(right)) {
        (Ok(l), Ok(r)) if !l.contains('\0') && !r.contains('\0') => diff_text(l, r),
        _ => {
            let first = left
                .iter()
                .zip(right)
                .position(|(x, y)| x != y)
                .unwrap_or(left.len().min(right.len()));
            format!(
                "binary files differ at byte {first} (sizes {} and {})\n",
                left.len(),
                right.len()
            )
        }
    }
}

pub fn diff_text(left: &str, right: &str) -> String {
    let a: Vec<&str> = left.lines().collect();
    let b: Vec<&str> = right.lines().collect();
    let mut out = String::new();

    if a.len().saturating_mul(b.len()) > LCS_CELL_LIMIT {
        for i in 0..a.len().max(b.len()) {
            match (a.get(i), b.get(i)) {
                (Some(x), Some(y)) if x == y => {}
                (x, y) => {
                    if let Some(x) = x {
                        out.push_str(&format!("-{}: {x}\n", i + 1));
                    }
                    if let Some(y) = y {
                        out.push_str(&format!("+{}: {y}\n", i + 1));
                    }
                }
            }
        }
        return trailing_newline_note(left, right, out);
    }

    // lcs[i][j] = longest common subsequence of a[i..] and b[j..]
    let width = b.len() + 1;
    let mut lcs = vec![0u32; (a.len() + 1) * width];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i * width + j] = if a[i] == b[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        if i < a.len() && j < b.len() && a[i] == b[j] {
            i += 1;
            j += 1;
        } else if j < b.len()
            && (i == a.len() || lcs[i * width + j + 1] >= lcs[(i + 1) * width + j])
        {
            out.push_str(&format!("+{}: {}\n", j + 1, b[j]));
            j += 1;
        } else {
            out.push_str(&format!("-{}: {}\n", i + 1, a[i]));
            i += 1;
        }
    }
    trailing_newline_note(left, right, out)
}

fn trailing_newline_note(left: &str, right: &str, mut out: String) -> String {
    if out.is_empty() && left != right {
        out.push_str("files differ only in line endings\n");
    }
    out
}
