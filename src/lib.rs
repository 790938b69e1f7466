//! Formatted input scanning from buffered byte streams, directed by PCRE2
//! patterns.
//!
//! A scan matches a pattern anchored at the current stream position, reads
//! exactly as much input as the match needs, converts the captured
//! substrings into caller-supplied typed destinations, and advances the
//! stream past the matched bytes. When the pattern cannot match, the stream
//! is left where the scan began.
//!
//! Patterns are compiled for multiline matching with CR, LF, and CRLF all
//! recognized as line endings, and matching is *hard-partial*: a match that
//! could still grow at the edge of the buffered window pulls more input
//! before settling, so `(\d+)` never splits a number at a buffer boundary.
//!
//! # Example
//!
//! ```
//! use rescanf::{Pattern, Scanner};
//! use std::io::Cursor;
//!
//! let pattern = Pattern::new(r"\s*(\w+)\s*:\s*(\d+)\s*\n").unwrap();
//! let mut input = Scanner::new(Cursor::new("  port : 8080\n"));
//!
//! let mut key = String::new();
//! let mut value: u32 = 0;
//! let n = rescanf::scan!(&mut input, &pattern, &mut key, &mut value).unwrap();
//!
//! assert_eq!(n, 2);
//! assert_eq!((key.as_str(), value), ("port", 8080));
//! ```
//!
//! # Callouts
//!
//! Patterns may contain callout points (`(?C)`, `(?C7)`, `(?C'tag')`).
//! [`scan_with_callouts`] delivers each one as a [`CaptureRecord`] to a
//! handler, which can collect an unbounded number of captures from a single
//! match, or cancel the scan by returning `false`:
//!
//! ```
//! use rescanf::{CalloutOutcome, Pattern, Scanner};
//! use std::io::Cursor;
//!
//! let pattern = Pattern::new(r"(?:(\w+),(?C))*").unwrap();
//! let mut input = Scanner::new(Cursor::new("a,b,c,"));
//!
//! let mut fields = Vec::new();
//! let outcome = rescanf::scan_with_callouts(&mut input, &pattern, |record| {
//!     fields.push(record.text().unwrap_or("").to_owned());
//!     true
//! })
//! .unwrap();
//!
//! assert_eq!(outcome, CalloutOutcome::Matched(3));
//! assert_eq!(fields, ["a", "b", "c"]);
//! ```
//!
//! # Streams
//!
//! Any [`BufRead`] works as input; wrap it in a [`Scanner`] once and reuse
//! the scanner for every scan on that stream. When a match fits inside the
//! stream's own buffer the scan runs zero-copy against it (this includes
//! `StdinLock`); longer matches spill into a buffer owned by the scanner,
//! and read-ahead the match did not consume stays available to later scans.

use std::io::{self, BufRead};

use thiserror::Error;

mod driver;
mod pattern;
mod source;
mod target;

pub use pattern::{CalloutDescriptor, CaptureRecord, Options, Pattern};
pub use source::Scanner;
pub use target::{ScanTarget, SinkFn};

use source::ByteSource;

/// Errors surfaced by pattern compilation and scanning.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The pattern text failed to compile.
    #[error("pattern error at offset {offset}: {message}")]
    Pattern { offset: usize, message: String },
    /// The underlying stream reported an I/O failure.
    #[error("stream error: {0}")]
    Stream(#[from] io::Error),
    /// The regex engine failed with an error other than no-match.
    #[error("regex engine failure: {message} (code {code})")]
    Engine { code: i32, message: String },
    /// More destinations were supplied than the pattern can capture.
    #[error("{given} destinations supplied but the pattern has {captures} capture groups")]
    Destinations { given: usize, captures: usize },
}

pub type ScanResult<T> = Result<T, ScanError>;

/// How a callout-mode scan ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalloutOutcome {
    /// The pattern matched; the payload counts the callout invocations
    /// whose handler returned `true`.
    Matched(usize),
    /// The pattern did not match any prefix of the remaining input.
    NoMatch,
    /// A handler returned `false`; nothing was consumed.
    Aborted,
}

/// Scans `scanner` with a compiled pattern, converting captured substrings
/// into `targets` in capture order.
///
/// Returns the number of captures that converted successfully. Conversion
/// stops at the first capture that did not participate in the match or
/// whose destination rejected the bytes; destinations converted before
/// that point keep their values. The match itself still consumes its bytes
/// when a conversion fails. `Ok(0)` is also how a clean no-match reports
/// itself, in which case the stream is left where the scan began.
///
/// Supplying more destinations than the pattern has capture groups is
/// reported as [`ScanError::Destinations`] before any input is read.
pub fn scan<R: BufRead>(
    scanner: &mut Scanner<R>,
    pattern: &Pattern,
    targets: &mut [&mut dyn ScanTarget],
) -> ScanResult<usize> {
    if targets.len() > pattern.capture_count() {
        return Err(ScanError::Destinations {
            given: targets.len(),
            captures: pattern.capture_count(),
        });
    }
    driver::run_positional(pattern, ByteSource::new(scanner), targets)
}

/// Like [`scan`], compiling `pattern` ad hoc.
///
/// The throwaway compilation skips the JIT; compile a [`Pattern`] up front
/// to scan the same pattern repeatedly.
pub fn scan_str<R: BufRead>(
    scanner: &mut Scanner<R>,
    pattern: &str,
    targets: &mut [&mut dyn ScanTarget],
) -> ScanResult<usize> {
    let compiled = Pattern::compile(pattern, &Options { jit: false })?;
    scan(scanner, &compiled, targets)
}

/// Scans `scanner` with a compiled pattern, delivering every callout the
/// match reaches to `handler`.
///
/// The handler return value decides whether matching continues; `false`
/// cancels the scan, leaves the stream where it began, and reports
/// [`CalloutOutcome::Aborted`].
///
/// Events are delivered for the attempt that completes the match, after
/// the driver has settled how much input the match needs. Backtracking
/// inside that attempt can still invoke the handler on paths that fail
/// locally, so handlers collecting data should expect events in invocation
/// order, not only from the surviving path.
pub fn scan_with_callouts<R, F>(
    scanner: &mut Scanner<R>,
    pattern: &Pattern,
    mut handler: F,
) -> ScanResult<CalloutOutcome>
where
    R: BufRead,
    F: FnMut(&CaptureRecord<'_>) -> bool,
{
    driver::run_callouts(pattern, ByteSource::new(scanner), &mut handler)
}

/// Like [`scan_with_callouts`], compiling `pattern` ad hoc without JIT.
pub fn scan_str_with_callouts<R, F>(
    scanner: &mut Scanner<R>,
    pattern: &str,
    handler: F,
) -> ScanResult<CalloutOutcome>
where
    R: BufRead,
    F: FnMut(&CaptureRecord<'_>) -> bool,
{
    let compiled = Pattern::compile(pattern, &Options { jit: false })?;
    scan_with_callouts(scanner, &compiled, handler)
}

/// Variadic front end for [`scan`].
///
/// Packs any number of `&mut` destinations into the slice [`scan`]
/// expects:
///
/// ```
/// use rescanf::{Pattern, Scanner};
/// use std::io::Cursor;
///
/// let pattern = Pattern::new(r"(\d+)\s+(\d+)").unwrap();
/// let mut input = Scanner::new(Cursor::new("10 20"));
/// let (mut a, mut b): (i32, i32) = (0, 0);
/// let n = rescanf::scan!(&mut input, &pattern, &mut a, &mut b).unwrap();
/// assert_eq!((n, a, b), (2, 10, 20));
/// ```
#[macro_export]
macro_rules! scan {
    ($scanner:expr, $pattern:expr $(,)?) => {
        $crate::scan($scanner, $pattern, &mut [])
    };
    ($scanner:expr, $pattern:expr, $($target:expr),+ $(,)?) => {
        $crate::scan($scanner, $pattern, &mut [$($target as &mut dyn $crate::ScanTarget),+])
    };
}
