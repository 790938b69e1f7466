//! Buffered byte sources for the match driver.
//!
//! [`Scanner`] wraps any [`BufRead`] stream and persists across scan calls.
//! It remembers two things the raw trait cannot express: bytes that were
//! pulled out of the stream during a scan but not consumed by the match
//! (the carry buffer), and the last byte a successful scan consumed, which
//! decides whether the next scan starts at the beginning of a line.
//!
//! Each scan borrows the scanner through a short-lived `ByteSource`. The
//! source starts in *direct* mode, matching against the stream's own buffer
//! without copying. When a partial match needs more bytes than that buffer
//! holds, the source switches to *pulled* mode: the window moves into an
//! owned overflow buffer that grows with each refill. On drop the overflow
//! flows back into the carry buffer, so a failed or errored scan leaves the
//! logical stream position where it began.

use std::io::{self, BufRead};
use std::mem;

use crate::pattern::{CaptureRecord, Pattern};
use crate::target::ScanTarget;
use crate::{CalloutOutcome, ScanResult};

/// A buffered input stream that scans can consume from.
///
/// Construct one per stream and reuse it for every scan against that
/// stream; the scanner carries unconsumed read-ahead between calls.
///
/// ```
/// use rescanf::{Pattern, Scanner};
/// use std::io::Cursor;
///
/// let pattern = Pattern::new(r"(\d+) ").unwrap();
/// let mut input = Scanner::new(Cursor::new("17 29 "));
/// let mut n: u32 = 0;
/// input.scan(&pattern, &mut [&mut n]).unwrap();
/// assert_eq!(n, 17);
/// input.scan(&pattern, &mut [&mut n]).unwrap();
/// assert_eq!(n, 29);
/// ```
pub struct Scanner<R> {
    inner: R,
    carry: Vec<u8>,
    last_byte: Option<u8>,
}

impl<R: BufRead> Scanner<R> {
    pub fn new(inner: R) -> Self {
        Scanner {
            inner,
            carry: Vec::new(),
            last_byte: None,
        }
    }

    /// Scans with a compiled pattern, converting captures into `targets`.
    ///
    /// See [`crate::scan`].
    pub fn scan(
        &mut self,
        pattern: &Pattern,
        targets: &mut [&mut dyn ScanTarget],
    ) -> ScanResult<usize> {
        crate::scan(self, pattern, targets)
    }

    /// Scans with a compiled pattern, delivering callout events to `handler`.
    ///
    /// See [`crate::scan_with_callouts`].
    pub fn scan_with_callouts<F>(
        &mut self,
        pattern: &Pattern,
        handler: F,
    ) -> ScanResult<CalloutOutcome>
    where
        F: FnMut(&CaptureRecord<'_>) -> bool,
    {
        crate::scan_with_callouts(self, pattern, handler)
    }

    /// Read-ahead bytes held by the scanner, in logical stream order before
    /// anything still inside the underlying reader.
    pub fn buffered(&self) -> &[u8] {
        &self.carry
    }

    /// Releases the underlying reader together with any carried read-ahead.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.carry)
    }
}

pub(crate) enum Refill {
    Gained,
    Eof,
}

/// Per-scan view of a [`Scanner`].
pub(crate) struct ByteSource<'s, R: BufRead> {
    scanner: &'s mut Scanner<R>,
    overflow: Vec<u8>,
    pulled: bool,
}

impl<'s, R: BufRead> ByteSource<'s, R> {
    pub(crate) fn new(scanner: &'s mut Scanner<R>) -> Self {
        let overflow = mem::take(&mut scanner.carry);
        let pulled = !overflow.is_empty();
        ByteSource {
            scanner,
            overflow,
            pulled,
        }
    }

    /// The byte immediately before the window, when known.
    pub(crate) fn preceding_byte(&self) -> Option<u8> {
        self.scanner.last_byte
    }

    /// The contiguous unread region the engine may match against.
    pub(crate) fn window(&mut self) -> io::Result<&[u8]> {
        if self.pulled {
            Ok(&self.overflow)
        } else {
            self.scanner.inner.fill_buf()
        }
    }

    /// Makes more input available, switching to pulled mode if the stream's
    /// own buffer is exhausted.
    pub(crate) fn try_refill(&mut self) -> io::Result<Refill> {
        if !self.pulled {
            let moved = {
                let window = self.scanner.inner.fill_buf()?;
                self.overflow.extend_from_slice(window);
                window.len()
            };
            self.scanner.inner.consume(moved);
            self.pulled = true;
            log::trace!("stream buffer exhausted after {moved} bytes, pulling");
        }
        let gained = {
            let chunk = self.scanner.inner.fill_buf()?;
            self.overflow.extend_from_slice(chunk);
            chunk.len()
        };
        self.scanner.inner.consume(gained);
        if gained == 0 {
            Ok(Refill::Eof)
        } else {
            log::trace!("pulled {gained} bytes, window is now {}", self.overflow.len());
            Ok(Refill::Gained)
        }
    }

    /// Advances the logical position past the first `n` window bytes.
    pub(crate) fn commit(&mut self, n: usize) -> io::Result<()> {
        if self.pulled {
            if n > 0 {
                self.scanner.last_byte = Some(self.overflow[n - 1]);
            }
            self.overflow.drain(..n);
        } else {
            if n > 0 {
                let window = self.scanner.inner.fill_buf()?;
                self.scanner.last_byte = Some(window[n - 1]);
            }
            self.scanner.inner.consume(n);
        }
        Ok(())
    }
}

impl<R: BufRead> Drop for ByteSource<'_, R> {
    fn drop(&mut self) {
        // Pulled bytes the match did not consume go back to the scanner, so
        // the next scan (or a retry after failure) starts from them.
        if self.pulled && !self.overflow.is_empty() {
            self.scanner.carry = mem::take(&mut self.overflow);
        }
    }
}
