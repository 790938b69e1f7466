//! Compiled patterns and the PCRE2 engine binding.
//!
//! All unsafe code in the crate lives here. A [`Pattern`] owns a compiled
//! PCRE2 program (and its JIT translation when available); matching runs
//! through [`Pattern::exec`], which turns the raw return codes into a
//! [`Verdict`]. Match state lives in a per-scan [`MatchData`] workspace, so
//! a `Pattern` can be shared freely across threads.

use std::fmt;
use std::os::raw::{c_int, c_void};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::ptr;
use std::slice;

use pcre2_sys::*;

use crate::{ScanError, ScanResult};

// `pcre2-sys` does not expose the callout API, even though the linked PCRE2
// library provides it. These declarations mirror pcre2.h's `_8` (8-bit)
// width-specific callout symbols so this module can bind them directly.
#[repr(C)]
pub(crate) struct pcre2_callout_block_8 {
    pub version: u32,
    pub callout_number: u32,
    pub capture_top: u32,
    pub capture_last: u32,
    pub offset_vector: *mut usize,
    pub mark: *const u8,
    pub subject: *const u8,
    pub subject_length: usize,
    pub start_match: usize,
    pub current_position: usize,
    pub pattern_position: usize,
    pub next_item_length: usize,
    pub callout_string_offset: usize,
    pub callout_string_length: usize,
    pub callout_string: *const u8,
    pub callout_flags: u32,
}

#[repr(C)]
pub(crate) struct pcre2_callout_enumerate_block_8 {
    pub version: u32,
    pub pattern_position: usize,
    pub next_item_length: usize,
    pub callout_number: u32,
    pub callout_string_offset: usize,
    pub callout_string_length: usize,
    pub callout_string: *const u8,
}

unsafe extern "C" {
    fn pcre2_set_callout_8(
        mcontext: *mut pcre2_match_context_8,
        callout_function: Option<
            unsafe extern "C" fn(*mut pcre2_callout_block_8, *mut c_void) -> c_int,
        >,
        callout_data: *mut c_void,
    ) -> c_int;

    fn pcre2_callout_enumerate_8(
        code: *const pcre2_code_8,
        callback: Option<
            unsafe extern "C" fn(*mut pcre2_callout_enumerate_block_8, *mut c_void) -> c_int,
        >,
        user_data: *mut c_void,
    ) -> c_int;
}

/// `PCRE2_UNSET`: the offset value marking a non-participating group.
const UNSET: usize = usize::MAX;

/// Compile-time configuration for [`Pattern::compile`].
#[derive(Clone, Debug)]
pub struct Options {
    /// Attempt JIT compilation. When the attempt fails the pattern falls
    /// back to the interpreter silently. Enabled by default.
    pub jit: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options { jit: true }
    }
}

/// A callout point found in a compiled pattern.
///
/// Numeric callouts like `(?C7)` carry their number (a bare `(?C)` is
/// number 0); string callouts like `(?C'tag')` carry the tag instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalloutDescriptor {
    pub number: u32,
    pub tag: Option<String>,
}

/// The event handed to a callout handler.
///
/// `bytes` is the most recently captured sub-expression, or the portion of
/// the overall match consumed so far when no sub-expression has captured
/// yet. The borrow is only valid for the duration of the handler call.
#[derive(Clone, Copy, Debug)]
pub struct CaptureRecord<'a> {
    /// Captured bytes, or the match so far.
    pub bytes: &'a [u8],
    /// Numeric callout mark, 0 if absent.
    pub number: u32,
    /// String callout mark, empty if absent.
    pub tag: &'a str,
}

impl<'a> CaptureRecord<'a> {
    /// The captured bytes as UTF-8 text, when they are valid UTF-8.
    pub fn text(&self) -> Option<&'a str> {
        std::str::from_utf8(self.bytes).ok()
    }
}

/// A pattern compiled for anchored, multiline, stream-oriented matching.
///
/// The newline convention is fixed to recognize CR, LF, and CRLF; matching
/// is byte-oriented, so subjects need not be valid UTF-8. Compilation
/// failures report the offending offset within the pattern text.
pub struct Pattern {
    code: *mut pcre2_code_8,
    capture_count: u32,
    jit: bool,
    callouts: Vec<CalloutDescriptor>,
}

// The compiled program is immutable once constructed; PCRE2 allows
// concurrent matching against shared code as long as every match uses its
// own match data, which `MatchData` guarantees.
unsafe impl Send for Pattern {}
unsafe impl Sync for Pattern {}

impl Pattern {
    /// Compiles `pattern` with the default [`Options`].
    pub fn new(pattern: &str) -> ScanResult<Pattern> {
        Pattern::compile(pattern, &Options::default())
    }

    /// Compiles `pattern` with explicit [`Options`].
    pub fn compile(pattern: &str, options: &Options) -> ScanResult<Pattern> {
        let ctx = unsafe { pcre2_compile_context_create_8(ptr::null_mut()) };
        if ctx.is_null() {
            return Err(engine_error(PCRE2_ERROR_NOMEMORY));
        }
        unsafe {
            pcre2_set_newline_8(ctx, PCRE2_NEWLINE_ANYCRLF);
        }
        let mut error_code: c_int = 0;
        let mut error_offset: usize = 0;
        let code = unsafe {
            pcre2_compile_8(
                pattern.as_ptr(),
                pattern.len(),
                PCRE2_ANCHORED | PCRE2_MULTILINE,
                &mut error_code,
                &mut error_offset,
                ctx,
            )
        };
        unsafe {
            pcre2_compile_context_free_8(ctx);
        }
        if code.is_null() {
            return Err(ScanError::Pattern {
                offset: error_offset,
                message: error_text(error_code),
            });
        }

        let mut capture_count: u32 = 0;
        unsafe {
            pcre2_pattern_info_8(
                code.cast_const(),
                PCRE2_INFO_CAPTURECOUNT,
                &mut capture_count as *mut u32 as *mut c_void,
            );
        }

        let jit = if options.jit {
            let rc = unsafe {
                pcre2_jit_compile_8(code, PCRE2_JIT_COMPLETE | PCRE2_JIT_PARTIAL_HARD)
            };
            if rc == 0 {
                true
            } else {
                log::debug!("jit compilation unavailable (code {rc}), using the interpreter");
                false
            }
        } else {
            false
        };

        Ok(Pattern {
            code,
            capture_count,
            jit,
            callouts: enumerate_callouts(code),
        })
    }

    /// Number of capturing groups in the pattern, excluding the overall
    /// match.
    pub fn capture_count(&self) -> usize {
        self.capture_count as usize
    }

    /// Whether the JIT translation was produced.
    pub fn jit_compiled(&self) -> bool {
        self.jit
    }

    /// The callout points present in the pattern, in pattern order.
    pub fn callouts(&self) -> &[CalloutDescriptor] {
        &self.callouts
    }

    /// Runs one anchored match attempt over `subject`.
    pub(crate) fn exec(
        &self,
        workspace: &mut MatchData,
        subject: &[u8],
        opts: ExecOptions,
        shim: Option<&mut CalloutShim<'_>>,
    ) -> ScanResult<Verdict> {
        let mut flags = 0u32;
        if opts.partial {
            flags |= PCRE2_PARTIAL_HARD;
        }
        if opts.notbol {
            flags |= PCRE2_NOTBOL;
        }

        let shim_ptr: *mut CalloutShim<'_> = match shim {
            Some(shim) => shim,
            None => ptr::null_mut(),
        };
        let ctx = if shim_ptr.is_null() {
            None
        } else {
            let ctx = MatchContext::new()?;
            unsafe {
                pcre2_set_callout_8(ctx.0, Some(callout_trampoline), shim_ptr as *mut c_void);
            }
            Some(ctx)
        };

        let rc = unsafe {
            pcre2_match_8(
                self.code.cast_const(),
                subject.as_ptr(),
                subject.len(),
                0,
                flags,
                workspace.ptr,
                ctx.as_ref().map_or(ptr::null_mut(), |c| c.0),
            )
        };
        drop(ctx);

        if let Some(shim) = unsafe { shim_ptr.as_mut() } {
            if let Some(payload) = shim.panic.take() {
                resume_unwind(payload);
            }
        }

        if rc == PCRE2_ERROR_NOMATCH {
            return Ok(Verdict::NoMatch);
        }
        if rc == PCRE2_ERROR_PARTIAL {
            return Ok(Verdict::Partial);
        }
        if rc == PCRE2_ERROR_CALLOUT && !shim_ptr.is_null() {
            return Ok(Verdict::Aborted);
        }
        if rc < 0 {
            return Err(engine_error(rc));
        }

        let ovector = unsafe { pcre2_get_ovector_pointer_8(workspace.ptr) };
        let groups = self.capture_count as usize;
        // rc is one more than the highest pair the engine filled in; pairs
        // beyond it may hold stale offsets from an earlier attempt.
        let filled = if rc == 0 { groups + 1 } else { rc as usize };
        let mut captures = Vec::with_capacity(groups + 1);
        for i in 0..=groups {
            let (start, end) = if i < filled {
                unsafe { (*ovector.add(2 * i), *ovector.add(2 * i + 1)) }
            } else {
                (UNSET, UNSET)
            };
            captures.push(if start == UNSET { None } else { Some((start, end)) });
        }
        let end = captures[0].map_or(0, |(_, end)| end);
        Ok(Verdict::Complete { end, captures })
    }
}

impl Drop for Pattern {
    fn drop(&mut self) {
        unsafe {
            pcre2_code_free_8(self.code);
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("capture_count", &self.capture_count)
            .field("jit", &self.jit)
            .field("callouts", &self.callouts)
            .finish_non_exhaustive()
    }
}

/// Per-match options for [`Pattern::exec`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExecOptions {
    /// Report a hard partial match instead of searching for alternatives
    /// when the subject ends mid-pattern.
    pub(crate) partial: bool,
    /// The match start is not the beginning of a line.
    pub(crate) notbol: bool,
}

/// Outcome of one match attempt.
pub(crate) enum Verdict {
    /// The pattern matched `subject[..end]`. `captures[0]` is the overall
    /// match; non-participating groups are `None`.
    Complete {
        end: usize,
        captures: Vec<Option<(usize, usize)>>,
    },
    /// More input could turn the attempt into a complete match.
    Partial,
    NoMatch,
    /// A callout handler requested cancellation.
    Aborted,
}

/// Per-scan match workspace.
pub(crate) struct MatchData {
    ptr: *mut pcre2_match_data_8,
}

impl MatchData {
    pub(crate) fn for_pattern(pattern: &Pattern) -> ScanResult<MatchData> {
        let ptr = unsafe {
            pcre2_match_data_create_from_pattern_8(pattern.code.cast_const(), ptr::null_mut())
        };
        if ptr.is_null() {
            return Err(engine_error(PCRE2_ERROR_NOMEMORY));
        }
        Ok(MatchData { ptr })
    }
}

impl Drop for MatchData {
    fn drop(&mut self) {
        unsafe {
            pcre2_match_data_free_8(self.ptr);
        }
    }
}

struct MatchContext(*mut pcre2_match_context_8);

impl MatchContext {
    fn new() -> ScanResult<MatchContext> {
        let ptr = unsafe { pcre2_match_context_create_8(ptr::null_mut()) };
        if ptr.is_null() {
            return Err(engine_error(PCRE2_ERROR_NOMEMORY));
        }
        Ok(MatchContext(ptr))
    }
}

impl Drop for MatchContext {
    fn drop(&mut self) {
        unsafe {
            pcre2_match_context_free_8(self.0);
        }
    }
}

/// Bridges engine callouts to a caller-supplied handler.
pub(crate) struct CalloutShim<'a> {
    handler: &'a mut dyn FnMut(&CaptureRecord<'_>) -> bool,
    /// Invocations whose handler returned `true`.
    pub(crate) continued: usize,
    panic: Option<Box<dyn std::any::Any + Send>>,
}

impl<'a> CalloutShim<'a> {
    pub(crate) fn new(handler: &'a mut dyn FnMut(&CaptureRecord<'_>) -> bool) -> Self {
        CalloutShim {
            handler,
            continued: 0,
            panic: None,
        }
    }
}

unsafe extern "C" fn callout_trampoline(
    block: *mut pcre2_callout_block_8,
    data: *mut c_void,
) -> c_int {
    let shim = &mut *(data as *mut CalloutShim<'_>);
    let block = &*block;

    let subject = slice::from_raw_parts(block.subject, block.subject_length);
    let matched_so_far = &subject[block.start_match..block.current_position];
    let bytes = if block.capture_last > 0 && block.capture_last < block.capture_top {
        let i = block.capture_last as usize;
        let pairs = slice::from_raw_parts(block.offset_vector, block.capture_top as usize * 2);
        if pairs[2 * i] == UNSET {
            matched_so_far
        } else {
            &subject[pairs[2 * i]..pairs[2 * i + 1]]
        }
    } else {
        matched_so_far
    };
    let tag = if block.callout_string.is_null() {
        &[][..]
    } else {
        slice::from_raw_parts(block.callout_string, block.callout_string_length)
    };
    let record = CaptureRecord {
        bytes,
        number: block.callout_number,
        tag: std::str::from_utf8(tag).unwrap_or(""),
    };

    // Unwinding must not cross the engine's stack frames; park the payload
    // and re-raise it once pcre2_match returns.
    match catch_unwind(AssertUnwindSafe(|| (shim.handler)(&record))) {
        Ok(true) => {
            shim.continued += 1;
            0
        }
        Ok(false) => PCRE2_ERROR_CALLOUT,
        Err(payload) => {
            shim.panic = Some(payload);
            PCRE2_ERROR_CALLOUT
        }
    }
}

unsafe extern "C" fn enumerate_trampoline(
    block: *mut pcre2_callout_enumerate_block_8,
    data: *mut c_void,
) -> c_int {
    let out = &mut *(data as *mut Vec<CalloutDescriptor>);
    let block = &*block;
    let tag = if block.callout_string.is_null() {
        None
    } else {
        let raw = slice::from_raw_parts(block.callout_string, block.callout_string_length);
        Some(String::from_utf8_lossy(raw).into_owned())
    };
    out.push(CalloutDescriptor {
        number: block.callout_number,
        tag,
    });
    0
}

fn enumerate_callouts(code: *mut pcre2_code_8) -> Vec<CalloutDescriptor> {
    let mut out: Vec<CalloutDescriptor> = Vec::new();
    unsafe {
        pcre2_callout_enumerate_8(
            code.cast_const(),
            Some(enumerate_trampoline),
            &mut out as *mut Vec<CalloutDescriptor> as *mut c_void,
        );
    }
    out
}

fn engine_error(code: c_int) -> ScanError {
    ScanError::Engine {
        code,
        message: error_text(code),
    }
}

fn error_text(code: c_int) -> String {
    let mut buf = [0u8; 256];
    let len = unsafe { pcre2_get_error_message_8(code, buf.as_mut_ptr(), buf.len()) };
    if len < 0 {
        format!("unknown error {code}")
    } else {
        String::from_utf8_lossy(&buf[..len as usize]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_once(pattern: &Pattern, subject: &[u8], partial: bool) -> Verdict {
        let mut workspace = MatchData::for_pattern(pattern).unwrap();
        let opts = ExecOptions {
            partial,
            notbol: false,
        };
        pattern.exec(&mut workspace, subject, opts, None).unwrap()
    }

    #[test]
    fn test_compile_error_reports_offset() {
        let err = Pattern::new("a(b").unwrap_err();
        match err {
            ScanError::Pattern { offset, message } => {
                assert!(offset > 0 && offset <= 3);
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_capture_count() {
        let pattern = Pattern::new(r"(\d+)-(\d+)").unwrap();
        assert_eq!(pattern.capture_count(), 2);
        assert_eq!(Pattern::new("abc").unwrap().capture_count(), 0);
    }

    #[test]
    fn test_jit_opt_out() {
        let pattern = Pattern::compile("a", &Options { jit: false }).unwrap();
        assert!(!pattern.jit_compiled());
    }

    #[test]
    fn test_complete_with_captures() {
        let pattern = Pattern::new(r"(\d+)x").unwrap();
        match exec_once(&pattern, b"12xtail", true) {
            Verdict::Complete { end, captures } => {
                assert_eq!(end, 3);
                assert_eq!(captures[0], Some((0, 3)));
                assert_eq!(captures[1], Some((0, 2)));
            }
            _ => panic!("expected a complete match"),
        }
    }

    #[test]
    fn test_partial_at_end_of_subject() {
        let pattern = Pattern::new(r"(\d+)x").unwrap();
        assert!(matches!(exec_once(&pattern, b"12", true), Verdict::Partial));
        // Without the partial flag the same subject simply fails.
        assert!(matches!(exec_once(&pattern, b"12", false), Verdict::NoMatch));
    }

    #[test]
    fn test_anchored_no_match() {
        let pattern = Pattern::new(r"\d+").unwrap();
        assert!(matches!(exec_once(&pattern, b"ab12", true), Verdict::NoMatch));
    }

    #[test]
    fn test_unset_group() {
        let pattern = Pattern::new(r"(a)|(b)").unwrap();
        match exec_once(&pattern, b"b", false) {
            Verdict::Complete { captures, .. } => {
                assert_eq!(captures[1], None);
                assert_eq!(captures[2], Some((0, 1)));
            }
            _ => panic!("expected a complete match"),
        }
    }

    #[test]
    fn test_empty_pattern_matches_empty() {
        let pattern = Pattern::new("").unwrap();
        match exec_once(&pattern, b"", false) {
            Verdict::Complete { end, .. } => assert_eq!(end, 0),
            _ => panic!("expected a complete match"),
        }
    }

    #[test]
    fn test_notbol_suppresses_line_anchor() {
        let pattern = Pattern::new("^a").unwrap();
        let mut workspace = MatchData::for_pattern(&pattern).unwrap();
        let hit = pattern
            .exec(
                &mut workspace,
                b"a",
                ExecOptions {
                    partial: false,
                    notbol: false,
                },
                None,
            )
            .unwrap();
        assert!(matches!(hit, Verdict::Complete { .. }));
        let miss = pattern
            .exec(
                &mut workspace,
                b"a",
                ExecOptions {
                    partial: false,
                    notbol: true,
                },
                None,
            )
            .unwrap();
        assert!(matches!(miss, Verdict::NoMatch));
    }

    #[test]
    fn test_callout_enumeration() {
        let pattern = Pattern::new(r"(?C1)a(?C'mark')b(?C)").unwrap();
        let callouts = pattern.callouts();
        assert_eq!(callouts.len(), 3);
        assert_eq!(callouts[0].number, 1);
        assert_eq!(callouts[0].tag, None);
        assert_eq!(callouts[1].tag.as_deref(), Some("mark"));
        assert_eq!(callouts[2].number, 0);
        assert_eq!(callouts[2].tag, None);
        assert!(Pattern::new("plain").unwrap().callouts().is_empty());
    }

    #[test]
    fn test_callout_events_and_abort() {
        let pattern = Pattern::new(r"a(?C5)b(?C9)").unwrap();
        let mut workspace = MatchData::for_pattern(&pattern).unwrap();
        let mut numbers = Vec::new();
        let mut handler = |record: &CaptureRecord<'_>| {
            numbers.push(record.number);
            record.number != 9
        };
        let mut shim = CalloutShim::new(&mut handler);
        let verdict = pattern
            .exec(
                &mut workspace,
                b"ab",
                ExecOptions {
                    partial: false,
                    notbol: false,
                },
                Some(&mut shim),
            )
            .unwrap();
        assert!(matches!(verdict, Verdict::Aborted));
        assert_eq!(shim.continued, 1);
        drop(shim);
        assert_eq!(numbers, [5, 9]);
    }
}
