//! The scan state machine.
//!
//! A scan alternates between matching and refilling: the engine gets the
//! current window, a hard-partial verdict requests more input, and the
//! first refill past end of input drops the partial flag so the final
//! attempt can settle against the true end of the stream.

use std::io::BufRead;

use crate::pattern::{CalloutShim, CaptureRecord, ExecOptions, MatchData, Pattern, Verdict};
use crate::source::{ByteSource, Refill};
use crate::target::ScanTarget;
use crate::{CalloutOutcome, ScanResult};

/// A match attempt that can no longer be changed by more input.
enum Settled {
    Complete {
        end: usize,
        captures: Vec<Option<(usize, usize)>>,
        /// The partial flag in effect when the match completed.
        partial: bool,
    },
    NoMatch,
}

fn bol_hint(preceding: Option<u8>) -> bool {
    match preceding {
        None => true,
        Some(byte) => byte == b'\n' || byte == b'\r',
    }
}

fn settle<R: BufRead>(
    pattern: &Pattern,
    workspace: &mut MatchData,
    src: &mut ByteSource<'_, R>,
    notbol: bool,
) -> ScanResult<Settled> {
    let mut partial = true;
    loop {
        let verdict = {
            let window = src.window()?;
            pattern.exec(workspace, window, ExecOptions { partial, notbol }, None)?
        };
        match verdict {
            Verdict::Complete { end, captures } => {
                return Ok(Settled::Complete {
                    end,
                    captures,
                    partial,
                })
            }
            Verdict::Partial => match src.try_refill()? {
                Refill::Gained => {}
                Refill::Eof => {
                    log::trace!("input exhausted during a partial match, settling at end of input");
                    partial = false;
                }
            },
            Verdict::NoMatch | Verdict::Aborted => return Ok(Settled::NoMatch),
        }
    }
}

fn bind_captures(
    window: &[u8],
    captures: &[Option<(usize, usize)>],
    targets: &mut [&mut dyn ScanTarget],
) -> usize {
    let mut converted = 0;
    let groups = captures.len().saturating_sub(1);
    for (i, target) in targets.iter_mut().enumerate().take(groups) {
        match captures[i + 1] {
            Some((start, end)) => {
                if !target.assign(&window[start..end]) {
                    break;
                }
                converted += 1;
            }
            None => break,
        }
    }
    converted
}

pub(crate) fn run_positional<R: BufRead>(
    pattern: &Pattern,
    mut src: ByteSource<'_, R>,
    targets: &mut [&mut dyn ScanTarget],
) -> ScanResult<usize> {
    let mut workspace = MatchData::for_pattern(pattern)?;
    let notbol = !bol_hint(src.preceding_byte());
    match settle(pattern, &mut workspace, &mut src, notbol)? {
        Settled::Complete { end, captures, .. } => {
            // Conversion happens while the window is still alive; the match
            // consumed its bytes even if a conversion fails.
            let converted = {
                let window = src.window()?;
                bind_captures(window, &captures, targets)
            };
            src.commit(end)?;
            log::trace!("matched {end} bytes, converted {converted} captures");
            Ok(converted)
        }
        Settled::NoMatch => Ok(0),
    }
}

pub(crate) fn run_callouts<R: BufRead>(
    pattern: &Pattern,
    mut src: ByteSource<'_, R>,
    handler: &mut dyn FnMut(&CaptureRecord<'_>) -> bool,
) -> ScanResult<CalloutOutcome> {
    let mut workspace = MatchData::for_pattern(pattern)?;
    let notbol = !bol_hint(src.preceding_byte());
    // Settle first without delivering events: a refill restarts matching
    // from the top of the window, and handing events to the caller during
    // the search would repeat them on every restart. Once the match is
    // known to complete, one replay over the settled window delivers the
    // events of the surviving attempt.
    match settle(pattern, &mut workspace, &mut src, notbol)? {
        Settled::Complete { end, partial, .. } => {
            let mut shim = CalloutShim::new(handler);
            let verdict = {
                let window = src.window()?;
                pattern.exec(
                    &mut workspace,
                    window,
                    ExecOptions { partial, notbol },
                    Some(&mut shim),
                )?
            };
            match verdict {
                Verdict::Complete { end: replayed, .. } => {
                    debug_assert_eq!(replayed, end);
                    src.commit(replayed)?;
                    Ok(CalloutOutcome::Matched(shim.continued))
                }
                Verdict::Aborted => Ok(CalloutOutcome::Aborted),
                Verdict::Partial | Verdict::NoMatch => Ok(CalloutOutcome::NoMatch),
            }
        }
        Settled::NoMatch => Ok(CalloutOutcome::NoMatch),
    }
}
