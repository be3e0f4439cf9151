//! HMM Viterbi step (spec.md §2: "Viterbi step over HMM nodes
//! (contract only)").
//!
//! The Gaussian/senone scoring itself lives behind [`crate::acmod`]; what
//! lives here is the small, fully-specified piece search passes actually
//! drive every frame: given a vector of per-senone acoustic scores and a
//! transition-score contract, advance one phone HMM's internal states by
//! one frame and report whether it has an exit score this frame. Tied
//! states and the transition matrix itself ("tmat") are dictated by the
//! acoustic model package and are out of scope (spec.md §1); they are
//! represented here as a trait so a pass can drive the Viterbi
//! recursion without knowing their on-disk format.

use crate::acmod::SenoneId;
use crate::bptbl::{BpIdx, NO_BP};
use crate::logmath::WORST_SCORE;

/// Transition-score contract for one HMM topology (external, spec.md §6
/// names this "tmat"). `n_states` is the number of emitting states;
/// `trans(src, dst)` is `None` for disallowed transitions.
pub trait TransitionModel: Send + Sync {
    fn n_states(&self) -> usize;
    fn trans(&self, src: usize, dst: usize) -> Option<i32>;
    fn entry_state(&self) -> usize {
        0
    }
    fn exit_state(&self) -> usize {
        self.n_states() - 1
    }
}

/// A simple strictly left-to-right topology with an optional skip
/// transition, the shape used throughout pocketsphinx-derived acoustic
/// models (3 or 5 emitting states, self-loop plus next and next-next).
pub struct LinearTopology {
    n_states: usize,
    self_loop: i32,
    next: i32,
    skip: Option<i32>,
}

impl LinearTopology {
    pub fn new(n_states: usize, self_loop: i32, next: i32, skip: Option<i32>) -> Self {
        LinearTopology {
            n_states,
            self_loop,
            next,
            skip,
        }
    }
}

impl TransitionModel for LinearTopology {
    fn n_states(&self) -> usize {
        self.n_states
    }

    fn trans(&self, src: usize, dst: usize) -> Option<i32> {
        if dst == src {
            Some(self.self_loop)
        } else if dst == src + 1 {
            Some(self.next)
        } else if dst == src + 2 {
            self.skip
        } else {
            None
        }
    }
}

/// One active phone-HMM instance: a fixed senone per state plus a
/// running Viterbi score/back-pointer per state.
pub struct Hmm<'a> {
    pub senones: Vec<SenoneId>,
    tmat: &'a dyn TransitionModel,
    state_score: Vec<i32>,
    state_bp: Vec<BpIdx>,
    pub frame_entered: i32,
}

impl<'a> Hmm<'a> {
    pub fn new(senones: Vec<SenoneId>, tmat: &'a dyn TransitionModel) -> Self {
        let n = tmat.n_states();
        assert_eq!(senones.len(), n, "senone sequence must cover every emitting state");
        Hmm {
            senones,
            tmat,
            state_score: vec![WORST_SCORE; n],
            state_bp: vec![NO_BP; n],
            frame_entered: -1,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state_score.iter().any(|&s| s != WORST_SCORE)
    }

    pub fn reset(&mut self) {
        self.state_score.iter_mut().for_each(|s| *s = WORST_SCORE);
        self.state_bp.iter_mut().for_each(|b| *b = NO_BP);
    }

    /// Feed an incoming score/back-pointer into the entry state, taking
    /// the max with whatever is already there (multiple words can enter
    /// a shared root channel in the same frame).
    pub fn enter(&mut self, score: i32, bp: BpIdx, frame: i32) {
        let e = self.tmat.entry_state();
        if score > self.state_score[e] {
            self.state_score[e] = score;
            self.state_bp[e] = bp;
            self.frame_entered = frame;
        }
    }

    /// Advance every state by one frame given per-senone acoustic
    /// scores this frame. Returns `(exit_score, exit_bp)` for the
    /// topology's exit state, or `(WORST_SCORE, NO_BP)` if the HMM was
    /// entirely inactive.
    pub fn step(&mut self, senone_score: impl Fn(SenoneId) -> i32) -> (i32, BpIdx) {
        let n = self.state_score.len();
        let mut new_score = vec![WORST_SCORE; n];
        let mut new_bp = vec![NO_BP; n];
        for dst in 0..n {
            let mut best = WORST_SCORE;
            let mut best_bp = NO_BP;
            for src in 0..n {
                if let Some(t) = self.tmat.trans(src, dst) {
                    if self.state_score[src] == WORST_SCORE {
                        continue;
                    }
                    let cand = self.state_score[src] + t;
                    if cand > best {
                        best = cand;
                        best_bp = self.state_bp[src];
                    }
                }
            }
            if best != WORST_SCORE {
                new_score[dst] = best + senone_score(self.senones[dst]);
                new_bp[dst] = best_bp;
            }
        }
        self.state_score = new_score;
        self.state_bp = new_bp;
        let exit = self.tmat.exit_state();
        (self.state_score[exit], self.state_bp[exit])
    }

    pub fn best_score(&self) -> i32 {
        self.state_score.iter().copied().max().unwrap_or(WORST_SCORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_state_hmm_carries_entry_score() {
        let tmat = LinearTopology::new(1, -1, 0, None);
        let mut hmm = Hmm::new(vec![7], &tmat);
        hmm.enter(-100, NO_BP, 0);
        let (score, _) = hmm.step(|_| -5);
        assert_eq!(score, -105);
    }

    #[test]
    fn inactive_hmm_reports_worst_score() {
        let tmat = LinearTopology::new(3, -1, 0, Some(-2));
        let mut hmm = Hmm::new(vec![1, 2, 3], &tmat);
        let (score, bp) = hmm.step(|_| -1);
        assert_eq!(score, WORST_SCORE);
        assert_eq!(bp, NO_BP);
    }
}
