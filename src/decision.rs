//! Operator decisions on ambiguous fuzzy candidates.
//!
//! The engine only sees the [`DecisionSurface`] trait. [`ConsolePrompt`] is the
//! line-based terminal implementation used by the CLI.

use std::io::{BufRead, Write};

use crate::error::{Error, Result};
use crate::models::{LocalTrack, RankedCandidate};

/// What the operator chose for one local track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// 1-based indices into the presented candidate list
    Select(Vec<usize>),
    /// None of the candidates is this track; blacklist them all
    RejectAll,
    /// Leave the track for a later run
    Defer,
}

pub trait DecisionSurface {
    fn decide(&mut self, local: &LocalTrack, candidates: &[RankedCandidate]) -> Result<Decision>;
}

/// Check a 1-based selection against `available` candidates.
/// Returns sorted, deduplicated 0-based positions.
pub fn validate_selection(selection: &[usize], available: usize) -> Result<Vec<usize>> {
    let invalid = || Error::InvalidSelection {
        selection: selection.to_vec(),
        available,
    };
    if selection.is_empty() {
        return Err(invalid());
    }
    let mut positions = Vec::with_capacity(selection.len());
    for &i in selection {
        if i == 0 || i > available {
            return Err(invalid());
        }
        positions.push(i - 1);
    }
    positions.sort_unstable();
    positions.dedup();
    Ok(positions)
}

/// Parse one line of operator input.
///
/// Empty defers, `0` rejects all, otherwise a comma separated list of indices.
/// Anything unparseable comes back as a selection of index 0, which fails validation.
pub fn parse_answer(line: &str) -> Decision {
    let line = line.trim();
    if line.is_empty() {
        return Decision::Defer;
    }
    if line == "0" {
        return Decision::RejectAll;
    }
    let parsed: std::result::Result<Vec<usize>, _> =
        line.split(',').map(|part| part.trim().parse::<usize>()).collect();
    match parsed {
        Ok(indices) => Decision::Select(indices),
        Err(_) => Decision::Select(vec![0]),
    }
}

/// Terminal prompt: lists the ranked candidates and reads one answer line.
pub struct ConsolePrompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsolePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> DecisionSurface for ConsolePrompt<R, W> {
    fn decide(&mut self, local: &LocalTrack, candidates: &[RankedCandidate]) -> Result<Decision> {
        writeln!(self.output)?;
        writeln!(self.output, "Fuzzy matches for {local}:")?;
        for (i, c) in candidates.iter().enumerate() {
            writeln!(self.output, "[{:2}] ({:2.0}%) {}", i + 1, c.ratio * 100.0, c.track)?;
        }
        writeln!(self.output, "[ 0] Reject all")?;
        writeln!(self.output, "[  ] Skip")?;
        write!(self.output, "Select matches (e.g. 1,3): ")?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            // EOF: nobody is answering
            return Ok(Decision::Defer);
        }
        Ok(parse_answer(&line))
    }
}
