//! Hypothesis output formatting, grounded in sudachi-cli's
//! `output.rs` (`SudachiOutput` trait, one struct per format selected
//! by a CLI flag) rendered for decoded word hypotheses instead of
//! morphemes.

use std::io::{self, Write};

use multisphinx::dict::Dictionary;
use multisphinx::hyp::{Hypothesis, Segment};

pub type Writer = io::BufWriter<Box<dyn Write>>;

/// An output format for a decoded hypothesis.
pub trait HypOutput {
    fn write(&self, writer: &mut Writer, dict: &dyn Dictionary, hyp: &Hypothesis, segments: &[Segment]) -> io::Result<()>;
}

/// One line, words space-separated -- the `--wakati` equivalent.
#[derive(Default)]
pub struct Words;

impl HypOutput for Words {
    fn write(&self, writer: &mut Writer, dict: &dyn Dictionary, hyp: &Hypothesis, _segments: &[Segment]) -> io::Result<()> {
        for (i, &w) in hyp.words.iter().enumerate() {
            if i > 0 {
                write!(writer, " ")?;
            }
            write!(writer, "{}", dict.word_str(w))?;
        }
        writeln!(writer)
    }
}

/// One line per segment: word, start/end frame, cumulative score, plus
/// a trailing summary line -- the `--all` equivalent.
pub struct Segments;

impl HypOutput for Segments {
    fn write(&self, writer: &mut Writer, dict: &dyn Dictionary, hyp: &Hypothesis, segments: &[Segment]) -> io::Result<()> {
        for seg in segments {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}",
                dict.word_str(seg.wid),
                seg.start_frame,
                seg.end_frame,
                seg.score
            )?;
        }
        writeln!(writer, "; total score {}", hyp.score)
    }
}
