use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("{}", arity_message(*.min, *.max, *.got))]
    ArityMismatch { min: usize, max: usize, got: usize },
    #[error("{0}")]
    TypeMismatch(String),
    #[error("Undefined variable '{name}'.{}", suggestion_suffix(.suggestion))]
    UndefinedVariable { name: String, suggestion: Option<String> },
    #[error("Undefined property '{name}'.{}", suggestion_suffix(.suggestion))]
    UndefinedProperty { name: String, suggestion: Option<String> },
    #[error("Array index out of bounds: {index} (length {len}).")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Instruction budget exceeded ({0}).")]
    InstructionBudgetExceeded(u64),
    #[error("Stack limit exceeded ({0} slots).")]
    StackLimitExceeded(usize),
    #[error("Heap limit exceeded ({0} bytes).")]
    HeapLimitExceeded(usize),
    #[error("Uncaught exception: {0}")]
    UncaughtThrow(String),
}

fn arity_message(min: usize, max: usize, got: usize) -> String {
    if min == max {
        format!("Expected {} arguments but got {}.", max, got)
    } else {
        format!("Expected {} to {} arguments but got {}.", min, max, got)
    }
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(name) => format!(" Did you mean '{}'?", name),
        None => String::new(),
    }
}

/// Source position of the instruction that failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub path: Option<Rc<str>>,
    pub line: u32,
    pub column: u32,
    pub lexeme: Option<Rc<str>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub location: Location,
    /// Frames at the point of failure, most recent call last.
    pub stack_trace: Vec<String>,
    /// The error object of a `throw` that escaped a native boundary. Re-raised
    /// by the caller's dispatch loop instead of being treated as fatal.
    pub thrown: Option<Value>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind) -> Self {
        RuntimeError {
            kind,
            location: Location::default(),
            stack_trace: Vec::new(),
            thrown: None,
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::TypeMismatch(message.into()))
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl From<RuntimeErrorKind> for RuntimeError {
    fn from(kind: RuntimeErrorKind) -> Self {
        RuntimeError::new(kind)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.location.path.as_deref().unwrap_or("<script>");
        if self.location.line > 0 && self.location.column > 0 {
            write!(f, "{}:{}:{}: RuntimeError", path, self.location.line, self.location.column)?;
            if let Some(lexeme) = &self.location.lexeme {
                write!(f, " at '{}'", lexeme)?;
            }
            write!(f, ": {}", self.kind)
        } else {
            write!(f, "{}: RuntimeError: {}", path, self.kind)
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Errors raised while assembling a chunk, before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("Too many constants in one chunk.")]
    TooManyConstants,
    #[error("Too much code to jump over.")]
    JumpTooLarge,
    #[error("Loop body too large.")]
    LoopTooLarge,
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0; b_chars.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = if ca == *cb { 0 } else { 1 };
            current[j + 1] = (previous[j + 1] + 1).min(current[j] + 1).min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b_chars.len()]
}

/// The unique closest candidate within `max(1, len / 3)` edits, if any.
pub fn suggest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let limit = (name.chars().count() / 3).max(1);
    let mut best: Option<(&str, usize)> = None;
    let mut tied = false;
    for candidate in candidates {
        if candidate == name {
            continue;
        }
        let distance = levenshtein(name, candidate);
        if distance > limit {
            continue;
        }
        match best {
            Some((_, best_distance)) if distance > best_distance => {}
            Some((previous, best_distance)) if distance == best_distance => {
                if previous != candidate {
                    tied = true;
                }
            }
            _ => {
                best = Some((candidate, distance));
                tied = false;
            }
        }
    }
    match best {
        Some((candidate, _)) if !tied => Some(candidate.to_string()),
        _ => None,
    }
}
