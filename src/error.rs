use std::borrow::Cow;
use std::fmt::Display;
use std::sync::Mutex;

use hashbrown::HashSet;

/// Error types used throughout the `elf_linker` library.
/// These errors represent the failure conditions that can occur while
/// scanning, laying out, and applying relocations.
#[derive(Debug)]
pub enum Error {
    /// A relocation refers to a symbol that no input file defines.
    UndefinedSymbol {
        /// A descriptive message naming the symbol and the referencing section.
        msg: Cow<'static, str>,
    },

    /// A relocation value does not fit the instruction's immediate field.
    ///
    /// Ranges are half-open intervals; the offending value and the interval
    /// bounds are part of the message.
    OutOfRange {
        /// A descriptive message about the range violation.
        msg: Cow<'static, str>,
    },

    /// The scanner encountered a relocation type it does not handle.
    UnknownRelocation {
        /// A descriptive message naming the relocation type.
        msg: Cow<'static, str>,
    },

    /// A relocation type is not permitted where it appeared.
    ///
    /// Raised for non-allocated sections (anything but `ABS64`/`ABS32`) and
    /// for `.eh_frame` (anything but `ABS64`/`PREL32`/`PREL64`). This error
    /// aborts the link immediately.
    InvalidRelocation {
        /// A descriptive message about the rejected relocation.
        msg: Cow<'static, str>,
    },

    /// A relocation cannot be expressed under the requested output mode,
    /// e.g. a direct page-relative reference to an imported symbol in a
    /// shared object.
    IllegalRelocation {
        /// A descriptive message about the violation.
        msg: Cow<'static, str>,
    },

    /// The link finished with accumulated diagnostics.
    LinkFailed {
        /// Number of diagnostics recorded before completion.
        count: usize,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UndefinedSymbol { msg } => write!(f, "undefined symbol: {msg}"),
            Error::OutOfRange { msg } => write!(f, "relocation out of range: {msg}"),
            Error::UnknownRelocation { msg } => write!(f, "unknown relocation: {msg}"),
            Error::InvalidRelocation { msg } => write!(f, "invalid relocation: {msg}"),
            Error::IllegalRelocation { msg } => write!(f, "illegal relocation: {msg}"),
            Error::LinkFailed { count } => write!(f, "link failed with {count} error(s)"),
        }
    }
}

impl std::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn undefined_symbol_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::UndefinedSymbol { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn out_of_range_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::OutOfRange { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn unknown_relocation_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::UnknownRelocation { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn invalid_relocation_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidRelocation { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn illegal_relocation_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::IllegalRelocation { msg: msg.into() }
}

/// Accumulates non-fatal diagnostics from the scan and apply phases.
///
/// Workers report concurrently; the surrounding driver checks the sink once
/// after emission and fails the link if anything was recorded. Fatal
/// conditions do not pass through the sink, they abort via [`crate::Result`].
pub struct DiagnosticSink {
    errors: Mutex<Vec<Error>>,
    // An undefined symbol is usually referenced many times; report it once.
    undef_seen: Mutex<HashSet<u32>>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            undef_seen: Mutex::new(HashSet::new()),
        }
    }

    /// Record a diagnostic. The link keeps going; [`DiagnosticSink::finish`]
    /// fails it at completion.
    pub fn report(&self, err: Error) {
        log::error!("{err}");
        self.errors.lock().unwrap().push(err);
    }

    /// Record an undefined-symbol diagnostic, deduplicated per symbol.
    pub(crate) fn report_undef(&self, sym_id: u32, name: &str, referenced_in: &str) {
        if self.undef_seen.lock().unwrap().insert(sym_id) {
            self.report(undefined_symbol_error(format!(
                "{name}, referenced by {referenced_in}"
            )));
        }
    }

    #[inline]
    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    /// Drain the recorded diagnostics, leaving the sink empty.
    pub fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.errors.lock().unwrap())
    }

    /// Fail the link if any diagnostic was recorded.
    pub fn finish(&self) -> crate::Result<()> {
        let count = self.error_count();
        if count == 0 {
            Ok(())
        } else {
            Err(Error::LinkFailed { count })
        }
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::new()
    }
}
