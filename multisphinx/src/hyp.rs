//! Hypothesis extraction and segmentation (spec.md §4.1, Design Notes §9).
//!
//! `SegIter` is a sum type over "backtraced from a bptbl" and "read off
//! a lattice best path", the Rust rendering of Design Notes §9:
//! "Hypothesis segment iterators, currently backed by a shared v-table,
//! become a sum type over 'from bptbl' and 'from lattice'."

use crate::bptbl::{BackPointerTable, BpIdx, NO_BP};
use crate::dict::{Dictionary, WordId};
use crate::logmath::WORST_SCORE;

/// One word segment of a hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub wid: WordId,
    pub start_frame: i32,
    pub end_frame: i32,
    pub score: i32,
}

/// A complete decoded hypothesis, or "no hypothesis" when the search
/// found nothing reachable (spec.md §7 "User-visible failure").
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub words: Vec<WordId>,
    pub score: i32,
}

impl Hypothesis {
    pub fn empty() -> Self {
        Hypothesis {
            words: Vec::new(),
            score: WORST_SCORE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Segmentation iterator: yields nothing if there is no hypothesis
/// (spec.md §7).
pub enum SegIter<'a> {
    Bptbl {
        bptbl: &'a BackPointerTable,
        path: Vec<BpIdx>,
        pos: usize,
    },
    Lattice {
        segments: std::vec::IntoIter<Segment>,
    },
}

impl<'a> SegIter<'a> {
    pub fn from_bptbl(bptbl: &'a BackPointerTable, bp: BpIdx) -> Self {
        let path = bptbl.backtrace(bp);
        SegIter::Bptbl { bptbl, path, pos: 0 }
    }

    pub fn from_lattice(segments: Vec<Segment>) -> Self {
        SegIter::Lattice {
            segments: segments.into_iter(),
        }
    }
}

impl<'a> Iterator for SegIter<'a> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        match self {
            SegIter::Bptbl { bptbl, path, pos } => {
                if *pos >= path.len() {
                    return None;
                }
                let idx = path[*pos];
                let bp = bptbl.get(idx);
                let start = if bp.prev_bp == NO_BP {
                    0
                } else {
                    bptbl.get(bp.prev_bp).frame
                };
                *pos += 1;
                Some(Segment {
                    wid: bp.wid,
                    start_frame: start,
                    end_frame: bp.frame,
                    score: bp.score,
                })
            }
            SegIter::Lattice { segments } => segments.next(),
        }
    }
}

/// Build a hypothesis by backtracing from `bp` to the start of the
/// utterance (spec.md §4.1 `bptbl_hyp`/`backtrace`).
pub fn hyp_from_bptbl(bptbl: &BackPointerTable, dict: &dyn Dictionary, bp: BpIdx) -> Hypothesis {
    if bp == NO_BP {
        return Hypothesis::empty();
    }
    let score = bptbl.get(bp).score;
    let words = bptbl
        .backtrace(bp)
        .into_iter()
        .map(|idx| bptbl.get(idx).wid)
        .filter(|&w| !dict.is_filler(dict.base_wid(w)))
        .collect();
    Hypothesis { words, score }
}

/// Find the best exit (optionally restricted to `finish_wid`) and
/// return its hypothesis, or an empty one if none exists
/// (spec.md §4.1 `bptbl_hyp`, §7).
pub fn best_hyp(
    bptbl: &BackPointerTable,
    dict: &dyn Dictionary,
    finish_wid: Option<WordId>,
) -> Hypothesis {
    let bp = bptbl.find_exit(dict, finish_wid);
    if bp == NO_BP {
        Hypothesis::empty()
    } else {
        hyp_from_bptbl(bptbl, dict, bp)
    }
}
