//! Tree-lexicon forward search (spec.md §4.3).
//!
//! A Viterbi beam search over a shared lexical tree: root channels
//! multiplex on the first phone of every word (further multiplexed by
//! left-context word in the full design; here keyed by first phone,
//! see DESIGN.md for the scope decision), word-internal phones run as
//! private per-word channels, and last-phone channels fan out per
//! right context so word exits carry a full right-context delta row
//! into the [`BackPointerTable`] (spec.md §4.1).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::acmod::{AcousticModel, SenoneId};
use crate::arc_buffer::ArcBuffer;
use crate::bptbl::{BackPointerTable, BpIdx, NO_BP};
use crate::config::Config;
use crate::dict::{Dict2Pid, Dictionary, WordId};
use crate::hyp::{best_hyp, Hypothesis, SegIter};
use crate::logmath::WORST_SCORE;
use crate::ngram::LanguageModel;

/// A single-state phone channel: senone id plus the running Viterbi
/// score/back-pointer (the n=1 specialization of
/// `crate::hmm::TransitionModel` -- acoustic tying collapses a phone's
/// internal states into the one exit score a search pass actually
/// needs, see `crate::hmm`).
#[derive(Clone, Copy)]
struct Channel {
    senone: SenoneId,
    score: i32,
    bp: BpIdx,
}

impl Channel {
    fn new(senone: SenoneId) -> Self {
        Channel {
            senone,
            score: WORST_SCORE,
            bp: NO_BP,
        }
    }

    fn is_active(&self) -> bool {
        self.score != WORST_SCORE
    }

    fn enter(&mut self, score: i32, bp: BpIdx) {
        if score > self.score {
            self.score = score;
            self.bp = bp;
        }
    }

    /// Self-loop + acoustic score for one frame.
    fn step(&mut self, senone_score: &HashMap<SenoneId, i32>) -> Option<(i32, BpIdx)> {
        if !self.is_active() {
            return None;
        }
        let acoustic = *senone_score.get(&self.senone).unwrap_or(&0);
        self.score += acoustic;
        Some((self.score, self.bp))
    }

    fn deactivate(&mut self) {
        self.score = WORST_SCORE;
        self.bp = NO_BP;
    }
}

/// Tree-lexicon forward Viterbi search (spec.md §4.3).
pub struct FwdtreeSearch {
    config: Config,
    dict: Arc<dyn Dictionary>,
    d2p: Arc<dyn Dict2Pid>,
    lm: Arc<dyn LanguageModel>,
    acmod: Arc<dyn AcousticModel>,
    out_arcs: Option<Arc<ArcBuffer>>,

    bptbl: BackPointerTable,
    /// Root channels keyed by first phone.
    roots: HashMap<i16, Channel>,
    /// Which words currently feed a given root.
    root_words: HashMap<i16, Vec<WordId>>,
    /// Word-internal channels keyed by (word, phone position).
    internal: HashMap<(WordId, usize), Channel>,
    /// Last-phone channels keyed by (word, right-context slot).
    last: HashMap<(WordId, usize), Channel>,

    frame: i32,
    best_score: i32,
}

impl FwdtreeSearch {
    pub fn new(
        config: Config,
        dict: Arc<dyn Dictionary>,
        d2p: Arc<dyn Dict2Pid>,
        lm: Arc<dyn LanguageModel>,
        acmod: Arc<dyn AcousticModel>,
        out_arcs: Option<Arc<ArcBuffer>>,
    ) -> Self {
        FwdtreeSearch {
            config,
            dict,
            d2p,
            lm,
            acmod,
            out_arcs,
            bptbl: BackPointerTable::new("fwdtree"),
            roots: HashMap::new(),
            root_words: HashMap::new(),
            internal: HashMap::new(),
            last: HashMap::new(),
            frame: 0,
            best_score: WORST_SCORE,
        }
    }

    pub fn bptbl(&self) -> &BackPointerTable {
        &self.bptbl
    }

    /// Enter `<s>` at time 0 with score 0 and no predecessor
    /// (spec.md §4.3 "Start and end of utterance").
    pub fn start_utt(&mut self) {
        self.bptbl = BackPointerTable::new("fwdtree");
        self.roots.clear();
        self.root_words.clear();
        self.internal.clear();
        self.last.clear();
        self.frame = 0;
        self.best_score = WORST_SCORE;
        self.acmod.start_utt();
        if let Some(ab) = &self.out_arcs {
            ab.producer_start_utt("utt");
        }
        let start = self.dict.start_wid();
        let bp = self.bptbl.enter(&*self.dict, start, NO_BP, 0, 0, 1);
        self.enter_roots_for(start, bp, 0);
    }

    fn word_exit_senones(&self, word: WordId) -> Vec<usize> {
        let n = self.dict.pronlen(word);
        (0..n).collect()
    }

    fn rc_fanout(&self, word: WordId) -> usize {
        if self.dict.is_single_phone(word) {
            1
        } else {
            self.d2p
                .rc_fanout(self.dict.last_phone(word), self.dict.second_last_phone(word))
                .max(1)
        }
    }

    /// Broadcast an incoming score/bp into every stage of `word`'s
    /// pronunciation: root if not yet entered this utterance, or the
    /// appropriate internal/last-phone channel.
    fn enter_word(&mut self, word: WordId, score: i32, bp: BpIdx) {
        let pronlen = self.dict.pronlen(word).max(1);
        if pronlen == 1 {
            self.enter_last(word, 0, score, bp);
            return;
        }
        let first = self.dict.first_phone(word);
        let senone = self.d2p.internal_triphone(word, 0) as u32;
        let chan = self.roots.entry(first).or_insert_with(|| Channel::new(senone));
        chan.enter(score, bp);
        self.root_words.entry(first).or_default().push(word);
    }

    fn enter_roots_for(&mut self, word: WordId, bp: BpIdx, score: i32) {
        self.enter_word(word, score, bp);
    }

    fn enter_internal(&mut self, word: WordId, pos: usize, score: i32, bp: BpIdx) {
        let senone = self.d2p.internal_triphone(word, pos) as u32;
        let chan = self
            .internal
            .entry((word, pos))
            .or_insert_with(|| Channel::new(senone));
        chan.enter(score, bp);
    }

    fn enter_last(&mut self, word: WordId, rc: usize, score: i32, bp: BpIdx) {
        let senone = self.d2p.internal_triphone(word, self.dict.pronlen(word).saturating_sub(1)) as u32;
        let chan = self.last.entry((word, rc)).or_insert_with(|| Channel::new(senone));
        chan.enter(score, bp);
    }

    /// One frame of the search (spec.md §4.3 steps 1-10).
    pub fn step(&mut self) -> bool {
        let ids = self.active_senones();
        self.acmod.activate(&ids);
        let senone_score = match self.acmod.score(self.frame) {
            Some(raw) => ids.into_iter().zip(raw.into_iter()).collect::<HashMap<_, _>>(),
            None => return false,
        };

        let oldest = self.compute_oldest_bp();
        self.bptbl.push_frame(oldest);

        self.step_roots(&senone_score);
        self.step_internal(&senone_score);
        let exits = self.step_last(&senone_score);

        self.bptbl.apply_maxwpf(&*self.dict, self.config.maxwpf);
        self.bptbl.commit();

        self.enforce_silence_window();

        for (word, bp) in exits {
            self.word_transition(word, bp);
        }

        self.prune();
        self.renormalize();

        if let Some(ab) = &self.out_arcs {
            ab.producer_sweep(&mut self.bptbl, true);
        }

        self.acmod.advance();
        self.frame += 1;
        true
    }

    fn active_senones(&self) -> Vec<SenoneId> {
        let mut ids: Vec<SenoneId> = self.roots.values().map(|c| c.senone).collect();
        ids.extend(self.internal.values().map(|c| c.senone));
        ids.extend(self.last.values().map(|c| c.senone));
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn compute_oldest_bp(&self) -> BpIdx {
        let mut oldest = BpIdx::MAX;
        for c in self.roots.values().chain(self.internal.values()).chain(self.last.values()) {
            if c.is_active() && c.bp != NO_BP && c.bp < oldest {
                oldest = c.bp;
            }
        }
        if oldest == BpIdx::MAX {
            NO_BP
        } else {
            oldest
        }
    }

    fn step_roots(&mut self, senone_score: &HashMap<SenoneId, i32>) {
        let keys: Vec<i16> = self.roots.keys().copied().collect();
        for k in keys {
            let (score, bp) = match self.roots.get_mut(&k).unwrap().step(senone_score) {
                Some(v) => v,
                None => continue,
            };
            if score == WORST_SCORE {
                continue;
            }
            if score > self.best_score {
                self.best_score = score;
            }
            let words = self.root_words.get(&k).cloned().unwrap_or_default();
            for w in words {
                let pronlen = self.dict.pronlen(w).max(1);
                if pronlen == 2 {
                    self.enter_last(w, 0, score, bp);
                } else if pronlen >= 3 {
                    self.enter_internal(w, 1, score, bp);
                }
            }
        }
    }

    fn step_internal(&mut self, senone_score: &HashMap<SenoneId, i32>) {
        let keys: Vec<(WordId, usize)> = self.internal.keys().copied().collect();
        let mut sorted = keys;
        sorted.sort_by_key(|&(_, pos)| pos);
        for (word, pos) in sorted {
            let (score, bp) = match self.internal.get_mut(&(word, pos)).unwrap().step(senone_score) {
                Some(v) => v,
                None => continue,
            };
            if score == WORST_SCORE {
                continue;
            }
            if score > self.best_score {
                self.best_score = score;
            }
            let pronlen = self.dict.pronlen(word);
            if pos + 2 == pronlen {
                // next phone is the last one.
                self.enter_last(word, 0, score, bp);
            } else if pos + 2 < pronlen {
                self.enter_internal(word, pos + 1, score, bp);
            }
        }
    }

    /// Step last-phone channels; where multiple right contexts are
    /// active for the same word, pick the best as the bp's canonical
    /// score and record the rest as rc deltas (spec.md §4.1, §4.3
    /// step 6-7).
    fn step_last(&mut self, senone_score: &HashMap<SenoneId, i32>) -> Vec<(WordId, BpIdx)> {
        let mut by_word: HashMap<WordId, Vec<(usize, i32, BpIdx)>> = HashMap::new();
        let keys: Vec<(WordId, usize)> = self.last.keys().copied().collect();
        for (word, rc) in keys {
            let (score, bp) = match self.last.get_mut(&(word, rc)).unwrap().step(senone_score) {
                Some(v) => v,
                None => continue,
            };
            if score == WORST_SCORE {
                continue;
            }
            by_word.entry(word).or_default().push((rc, score, bp));
        }
        let mut exits = Vec::new();
        for (word, mut rcs) in by_word {
            rcs.sort_by(|a, b| b.1.cmp(&a.1));
            let (best_rc, best_score, best_bp) = rcs[0];
            if best_score > self.best_score {
                self.best_score = best_score;
            }
            let fanout = self.rc_fanout(word);
            let bp = self
                .bptbl
                .enter(&*self.dict, word, best_bp, best_score, best_rc, fanout);
            for &(rc, score, _) in rcs.iter().skip(1) {
                self.bptbl.set_rc_score(bp, rc, score);
            }
            exits.push((word, bp));
        }
        exits
    }

    /// Force a silence channel whose anchoring back-pointer has gone
    /// stale to drop out, so the next word transition below re-enters
    /// it fresh instead of perpetuating one ancient `prev_bp` across an
    /// arbitrarily long run of silence exits (spec.md §6 `-maxsilfr`).
    /// Mirrors the original's `too_old_too_cold` check on the
    /// single-phone silence channel.
    fn enforce_silence_window(&mut self) {
        let sil = self.dict.silence_wid();
        for (&(word, _rc), chan) in self.last.iter_mut() {
            if word != sil || !chan.is_active() || chan.bp == NO_BP {
                continue;
            }
            let anchor_frame = self.bptbl.get(chan.bp).frame;
            if self.frame - anchor_frame > self.config.maxsilfr as i32 {
                chan.deactivate();
            }
        }
    }

    /// Word transition: an exiting word enters every root whose first
    /// phone is a live right context of the exit, with the appropriate
    /// language score added (spec.md §4.3 step 8).
    fn word_transition(&mut self, exiting_word: WordId, bp: BpIdx) {
        let real_wid = self.bptbl.get(bp).real_wid;
        let prev_real_wid = self.bptbl.get(bp).prev_real_wid;
        let base_score = self.bptbl.get(bp).score;
        let n_words = self.dict.n_words() as u32;
        for raw in 0..n_words {
            let next = WordId::new(raw);
            if self.dict.base_wid(next) != next {
                continue; // only base forms enter fresh roots
            }
            if next == self.dict.start_wid() {
                continue;
            }
            let lscr = if self.dict.is_filler(next) {
                if next == self.dict.silence_wid() {
                    self.config.silprob.ln()
                } else {
                    self.config.fillprob.ln()
                }
            } else {
                match self.lm.ngram(next, &[real_wid, prev_real_wid]) {
                    Some(hit) => hit.log_prob,
                    None => {
                        warn!(wid = ?next, "unknown word in language model, skipping transition");
                        continue;
                    }
                }
            };
            let penalty = self.config.wip.ln() + self.config.nwpen.ln();
            let score = base_score + (lscr * self.config.lw + penalty).round() as i32;
            if score + self.config.wbeam < self.best_score {
                continue;
            }
            self.enter_word(next, score, bp);
        }
    }

    /// Channel and adaptive (`maxhmmpf`) pruning (spec.md §4.3 step 5).
    fn prune(&mut self) {
        let thresh = self.best_score + self.config.beam.round() as i32;
        let mut active_scores: Vec<i32> = Vec::new();
        for c in self.roots.values().chain(self.internal.values()).chain(self.last.values()) {
            if c.is_active() {
                active_scores.push(c.score);
            }
        }
        let cap = if active_scores.len() > self.config.maxhmmpf {
            adaptive_beam_cutoff(&active_scores, self.best_score, self.config.maxhmmpf)
        } else {
            thresh
        };
        let floor = thresh.max(cap);
        for c in self.roots.values_mut() {
            if c.is_active() && c.score < floor {
                c.deactivate();
            }
        }
        for c in self.internal.values_mut() {
            if c.is_active() && c.score < floor {
                c.deactivate();
            }
        }
        for c in self.last.values_mut() {
            if c.is_active() && c.score < floor {
                c.deactivate();
            }
        }
    }

    /// Renormalize subtractively if the best score nears underflow
    /// (spec.md §4.3 step 9).
    fn renormalize(&mut self) {
        if self.best_score > 2 * (self.config.beam.round() as i32) + WORST_SCORE {
            return;
        }
        let offset = self.best_score;
        trace!(offset, "renormalizing fwdtree channel scores");
        for c in self.roots.values_mut().chain(self.internal.values_mut()).chain(self.last.values_mut()) {
            if c.is_active() {
                c.score -= offset;
            }
        }
        self.best_score -= offset;
    }

    /// Finalize the bptbl and signal end-of-utterance downstream
    /// (spec.md §4.3 "Start and end of utterance").
    pub fn end_utt(&mut self) {
        self.bptbl.finalize();
        self.acmod.end_utt();
        if let Some(ab) = &self.out_arcs {
            ab.producer_end_utt(&mut self.bptbl, true);
        }
        debug!(frames = self.frame, "fwdtree end_utt");
    }

    pub fn decode_utterance(&mut self) {
        self.start_utt();
        while self.step() {}
        self.end_utt();
    }

    pub fn hyp(&self, finish_wid: Option<WordId>) -> Hypothesis {
        best_hyp(&self.bptbl, &*self.dict, finish_wid)
    }

    pub fn seg_iter(&self, finish_wid: Option<WordId>) -> SegIter<'_> {
        let bp = self.bptbl.find_exit(&*self.dict, finish_wid);
        SegIter::from_bptbl(&self.bptbl, bp)
    }
}

/// Build a 256-bin histogram of `(best_score - score)/bin_width` and
/// return the score cutoff for the smallest bin whose cumulative count
/// exceeds `maxhmmpf` (spec.md §4.3 step 5).
fn adaptive_beam_cutoff(scores: &[i32], best_score: i32, maxhmmpf: usize) -> i32 {
    const BINS: i32 = 256;
    let max_delta = scores.iter().map(|&s| best_score - s).max().unwrap_or(0).max(1);
    let bin_width = (max_delta / BINS).max(1);
    let mut hist = vec![0usize; BINS as usize + 1];
    for &s in scores {
        let delta = best_score - s;
        let bin = (delta / bin_width).min(BINS) as usize;
        hist[bin] += 1;
    }
    let mut cum = 0usize;
    for (bin, count) in hist.iter().enumerate() {
        cum += count;
        if cum > maxhmmpf {
            return best_score - (bin as i32) * bin_width;
        }
    }
    best_score - max_delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TinyAcmod, TinyDict, TinyDict2Pid, TinyLm};

    #[test]
    fn single_word_utterance_yields_one_hypothesis() {
        let dict = Arc::new(TinyDict::new());
        let d2p = Arc::new(TinyDict2Pid::new());
        let lm = Arc::new(TinyLm::unigram_only());
        let go = dict.wid_by_name("go").unwrap();
        let acmod = Arc::new(TinyAcmod::favoring(&dict, &[go], 6));
        let mut fw = FwdtreeSearch::new(Config::default(), dict.clone(), d2p, lm, acmod, None);
        fw.decode_utterance();
        let hyp = fw.hyp(None);
        assert!(!hyp.is_empty());
        assert!(hyp.words.contains(&go));
        assert!(hyp.score > WORST_SCORE);
    }
}
