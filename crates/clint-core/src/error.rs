//! Error types
//!
//! - [`UsageViolation`]: application misuse of the wrapped API, always
//!   reported through the diagnostic sink
//! - [`ShadowError`]: the guarded allocator could not back a mapping; the
//!   mapping falls back to the real pointer
//! - [`PolicyError`]: unreadable configuration input
//! - [`TreeViolation`]: a red-black invariant does not hold (tracker defect)

use clint_unsafe_primitives::MemError;

use crate::monitor::Scope;
use crate::types::{Handle, KindId};

/// Misuse of the wrapped API detected at the offending call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UsageViolation {
    #[error("Unknown cl_{kind} {handle}")]
    UnknownHandle { kind: KindId, handle: Handle },

    #[error("cl_{kind} {handle} was previously freed.")]
    AlreadyFreed {
        kind: KindId,
        handle: Handle,
        /// Where the object was created, when stack logging is on
        stack: Option<String>,
    },

    #[error("Multiple threads detected {scope}.")]
    ConcurrentAccess {
        scope: Scope,
        /// Entry count observed by the second entrant
        count: i32,
    },
}

impl UsageViolation {
    /// The handle the violation is about, if any.
    pub fn handle(&self) -> Option<Handle> {
        match self {
            UsageViolation::UnknownHandle { handle, .. }
            | UsageViolation::AlreadyFreed { handle, .. } => Some(*handle),
            UsageViolation::ConcurrentAccess { scope, .. } => scope.handle(),
        }
    }
}

/// The shadow allocation behind a checked mapping failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ShadowError {
    #[error("shadow allocation failed: {0}")]
    Allocation(MemError),

    #[error("shadow protection failed: {0}")]
    Protection(MemError),
}

/// Invalid configuration input.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid JSON policy: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line {line}: {key} expects a quoted string")]
    ExpectedString { line: usize, key: String },

    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// A red-black tree invariant that does not hold.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TreeViolation {
    #[error("root is red")]
    RedRoot,

    #[error("red node {node} has a red child")]
    RedRedEdge { node: String },

    #[error("black height differs below {node}: {left} vs {right}")]
    BlackHeightMismatch {
        node: String,
        left: usize,
        right: usize,
    },

    #[error("child {node} does not point back at its parent")]
    BrokenParentLink { node: String },

    #[error("keys out of order at {node}")]
    OutOfOrder { node: String },

    #[error("tree reports {expected} entries but {found} are reachable")]
    LengthMismatch { expected: usize, found: usize },
}
