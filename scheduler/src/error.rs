// error.rs — Edit outcomes and load errors
//
// Every primitive edit and every recipe returns `EditResult<T>`. The
// `NotApplicable` variant is the expected "this rewrite does not apply here"
// outcome that iterative recipes consume as their termination condition; the
// other variants are usage errors and propagate.

use derive_more::{Display, Error};

use crate::lexer::Token;
use chumsky::error::Rich;
use chumsky::span::SimpleSpan;

pub type EditResult<T> = Result<T, EditError>;

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum EditError {
    /// A precondition of the requested edit does not hold.
    #[display("{op}: not applicable: {reason}")]
    NotApplicable { op: &'static str, reason: String },

    /// The cursor resolves to the wrong kind of node for this edit.
    #[display("{op}: {reason}")]
    StructuralMismatch { op: &'static str, reason: String },

    /// The cursor's node no longer exists, or it belongs to another lineage.
    #[display("cannot forward cursor: {reason}")]
    ForwardingFailure { reason: String },

    /// The cursor was captured in a different version and never forwarded.
    #[display("stale cursor: captured at version {cursor_version}, used at version {proc_version}")]
    StaleCursor {
        cursor_version: u32,
        proc_version: u32,
    },
}

impl EditError {
    pub fn not_applicable(op: &'static str, reason: impl Into<String>) -> Self {
        EditError::NotApplicable {
            op,
            reason: reason.into(),
        }
    }

    pub fn mismatch(op: &'static str, reason: impl Into<String>) -> Self {
        EditError::StructuralMismatch {
            op,
            reason: reason.into(),
        }
    }

    pub fn is_not_applicable(&self) -> bool {
        matches!(self, EditError::NotApplicable { .. })
    }
}

/// Turns a `NotApplicable` outcome into `None` and passes everything else
/// through, so iterative recipes can write `while let Some(p) = attempt(..)?`.
pub trait OrNotApplicable<T> {
    fn or_not_applicable(self) -> EditResult<Option<T>>;
}

impl<T> OrNotApplicable<T> for EditResult<T> {
    fn or_not_applicable(self) -> EditResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_applicable() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum LoadError {
    #[display("{count} syntax error(s); first at {start}..{end}: {message}")]
    Syntax {
        count: usize,
        start: usize,
        end: usize,
        message: String,
    },
    #[display("no procedure named `{name}`")]
    MissingProc { name: String },
    #[display("expected one procedure, found {found}")]
    ProcCount { found: usize },
}

impl LoadError {
    pub fn from_syntax(errors: &[Rich<'static, Token, SimpleSpan>]) -> Option<Self> {
        let first = errors.first()?;
        let span = first.span();
        Some(LoadError::Syntax {
            count: errors.len(),
            start: span.start,
            end: span.end,
            message: first.to_string(),
        })
    }
}
