//! Error taxonomy shared by the parsing and loading layers.
//!
//! Every failure mode surfaces as one of the kinds below; nothing is
//! recovered internally. Variants carry a static context message so call
//! sites stay cheap and the kind stays matchable in tests.

use core::fmt;

/// Errors raised by ELF parsing, buffer handling and loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument at an API boundary.
    Args(&'static str),
    /// The ELF header violates a structural precondition.
    Header(&'static str),
    /// A section header is inconsistent, or a section type is disallowed.
    Section(&'static str),
    /// Out-of-bounds read in an accessor, or a file could not be opened.
    Access(&'static str),
    /// Malformed RELA section.
    Reloc(&'static str),
    /// Relocation type not present in the dispatch table.
    UnknownRelocation(u32),
    /// Index out of range, or an invalid multicast selector/mask.
    Range(&'static str),
    /// API called in the wrong order.
    Sequence(&'static str),
    /// The allocator returned a null or short buffer.
    Alloc(&'static str),
    /// Internal invariant violated; should be unreachable.
    Implausible(&'static str),
    /// Generic failure in buffer handling.
    Runtime(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Args(msg) => write!(f, "invalid argument: {msg}"),
            Self::Header(msg) => write!(f, "malformed ELF header: {msg}"),
            Self::Section(msg) => write!(f, "malformed section: {msg}"),
            Self::Access(msg) => write!(f, "access error: {msg}"),
            Self::Reloc(msg) => write!(f, "relocation error: {msg}"),
            Self::UnknownRelocation(ty) => write!(f, "unknown relocation type {ty}"),
            Self::Range(msg) => write!(f, "out of range: {msg}"),
            Self::Sequence(msg) => write!(f, "call sequence error: {msg}"),
            Self::Alloc(msg) => write!(f, "allocation failed: {msg}"),
            Self::Implausible(msg) => write!(f, "implausible state: {msg}"),
            Self::Runtime(msg) => write!(f, "buffer error: {msg}"),
        }
    }
}

/// Result alias used throughout the loader stack.
pub type Result<T> = core::result::Result<T, Error>;
