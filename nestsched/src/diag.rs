// diag.rs — Schedule error model
//
// The single user-facing error kind raised by every primitive when a
// precondition does not hold. Each error names the primitive and the first
// violated precondition, carries a stable code, and renders at the verbosity
// chosen when the schedule was created.
//
// Internal consistency failures (structural index out of sync with the
// program, stale cache trusted as fresh) are not represented here: they are
// engine defects and panic.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Error code ───────────────────────────────────────────────────────────

/// A stable error code (e.g., `S0201`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub &'static str);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error code registry, grouped by primitive family.
pub mod codes {
    use super::ErrorCode;

    // S00xx: handles and lookup
    pub const S0001: ErrorCode = ErrorCode("S0001"); // unknown random variable
    pub const S0002: ErrorCode = ErrorCode("S0002"); // handle refers to a retired statement
    pub const S0003: ErrorCode = ErrorCode("S0003"); // handle kind mismatch
    pub const S0004: ErrorCode = ErrorCode("S0004"); // block name not found / ambiguous
    pub const S0005: ErrorCode = ErrorCode("S0005"); // statement not in the structural index

    // S01xx: sampling
    pub const S0101: ErrorCode = ErrorCode("S0101"); // invalid categorical distribution
    pub const S0102: ErrorCode = ErrorCode("S0102"); // decision not among candidates
    pub const S0103: ErrorCode = ErrorCode("S0103"); // invalid perfect-tile request
    pub const S0104: ErrorCode = ErrorCode("S0104"); // invalid perfect-tile decision

    // S02xx: loop transforms
    pub const S0201: ErrorCode = ErrorCode("S0201"); // split: bad factors
    pub const S0202: ErrorCode = ErrorCode("S0202"); // loop has annotation or thread binding
    pub const S0203: ErrorCode = ErrorCode("S0203"); // loop does not start at 0
    pub const S0204: ErrorCode = ErrorCode("S0204"); // fuse: not a single-child chain
    pub const S0205: ErrorCode = ErrorCode("S0205"); // loop domain depends on another loop
    pub const S0206: ErrorCode = ErrorCode("S0206"); // reorder: loops not on one chain
    pub const S0207: ErrorCode = ErrorCode("S0207"); // duplicate loops
    pub const S0208: ErrorCode = ErrorCode("S0208"); // non-affine or unsupported block binding

    // S03xx: for-kind
    pub const S0301: ErrorCode = ErrorCode("S0301"); // scope is not a stage pipeline
    pub const S0302: ErrorCode = ErrorCode("S0302"); // block under loop is neither complete nor reduction
    pub const S0303: ErrorCode = ErrorCode("S0303"); // loop bound to a disallowed iterator kind
    pub const S0304: ErrorCode = ErrorCode("S0304"); // unknown thread axis

    // S04xx: cache stages
    pub const S0401: ErrorCode = ErrorCode("S0401"); // buffer index out of range
    pub const S0402: ErrorCode = ErrorCode("S0402"); // writer count violates uniqueness
    pub const S0403: ErrorCode = ErrorCode("S0403"); // no position between the writer and a reader

    // S05xx: compute location
    pub const S0501: ErrorCode = ErrorCode("S0501"); // block and loop in different scopes
    pub const S0502: ErrorCode = ErrorCode("S0502"); // loop is an ancestor of block
    pub const S0503: ErrorCode = ErrorCode("S0503"); // scope is not dataflow-compact
    pub const S0504: ErrorCode = ErrorCode("S0504"); // block is the only leaf of its scope
    pub const S0505: ErrorCode = ErrorCode("S0505"); // block is an output block
    pub const S0506: ErrorCode = ErrorCode("S0506"); // consumer/producer not under loop
    pub const S0507: ErrorCode = ErrorCode("S0507"); // region cannot be inferred

    // S06xx: inlining
    pub const S0601: ErrorCode = ErrorCode("S0601"); // body is not a single eligible store
    pub const S0602: ErrorCode = ErrorCode("S0602"); // block is not complete
    pub const S0603: ErrorCode = ErrorCode("S0603"); // producer not unique / not complete
    pub const S0604: ErrorCode = ErrorCode("S0604"); // buffer is not an internal allocation

    // S07xx: reductions
    pub const S0701: ErrorCode = ErrorCode("S0701"); // not a reduction block
    pub const S0702: ErrorCode = ErrorCode("S0702"); // loop is not an ancestor of block
    pub const S0703: ErrorCode = ErrorCode("S0703"); // loop nested under a reduction loop
    pub const S0704: ErrorCode = ErrorCode("S0704"); // rfactor loop shape violations
    pub const S0705: ErrorCode = ErrorCode("S0705"); // no registered reducer matches
    pub const S0706: ErrorCode = ErrorCode("S0706"); // factor_axis out of range

    // S08xx: annotations
    pub const S0801: ErrorCode = ErrorCode("S0801"); // storage_align argument out of range

    // S09xx: trace
    pub const S0901: ErrorCode = ErrorCode("S0901"); // malformed trace record
}

// ── Render level ─────────────────────────────────────────────────────────

/// Verbosity of rendered errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorRenderLevel {
    /// Message, hint, and the offending IR.
    #[default]
    Detail,
    /// Message only, no IR rendering.
    Fast,
    /// Fixed placeholder text.
    None,
}

impl ErrorRenderLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detail" => Some(ErrorRenderLevel::Detail),
            "fast" => Some(ErrorRenderLevel::Fast),
            "none" => Some(ErrorRenderLevel::None),
            _ => None,
        }
    }
}

// ── ScheduleError ────────────────────────────────────────────────────────

/// A violated schedule precondition.
#[derive(Debug, Clone)]
pub struct ScheduleError {
    pub code: ErrorCode,
    /// Primitive that raised the error (`split`, `compute_at`, ...).
    pub primitive: &'static str,
    pub message: String,
    pub hint: Option<String>,
    /// Rendered IR around the offending statement (filled for `Detail`).
    pub ir: Option<String>,
    pub render: ErrorRenderLevel,
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

impl ScheduleError {
    pub fn new(code: ErrorCode, primitive: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            primitive,
            message: message.into(),
            hint: None,
            ir: None,
            render: ErrorRenderLevel::Detail,
        }
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach rendered IR for detailed output.
    pub fn with_ir(mut self, ir: impl Into<String>) -> Self {
        self.ir = Some(ir.into());
        self
    }

    pub fn rendered_at(mut self, level: ErrorRenderLevel) -> Self {
        self.render = level;
        if level != ErrorRenderLevel::Detail {
            self.ir = None;
        }
        self
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render {
            ErrorRenderLevel::None => write!(f, "ScheduleError: (not rendered)"),
            ErrorRenderLevel::Fast => {
                write!(f, "error[{}]: {}: {}", self.code, self.primitive, self.message)
            }
            ErrorRenderLevel::Detail => {
                write!(f, "error[{}]: {}: {}", self.code, self.primitive, self.message)?;
                if let Some(hint) = &self.hint {
                    write!(f, "\n  hint: {}", hint)?;
                }
                if let Some(ir) = &self.ir {
                    write!(f, "\n  ir:")?;
                    for line in ir.lines() {
                        write!(f, "\n    {}", line)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ScheduleError {}
