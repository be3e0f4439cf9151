//! Flat-lexicon forward search (spec.md §4.4).
//!
//! Where [`crate::fwdtree`] shares phones across words in a lexical
//! tree, fwdflat gives every word proposed by the upstream arc buffer
//! its own private phone chain and restricts the active vocabulary to
//! whatever the tree pass actually saw -- the point of a second pass is
//! to re-score that restricted vocabulary against a (usually
//! higher-order) language model, not to widen the search.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::acmod::{AcousticModel, SenoneId};
use crate::arc_buffer::{ArcBuffer, WaitError};
use crate::bptbl::{BackPointerTable, BpIdx, NO_BP};
use crate::config::Config;
use crate::dict::{Dict2Pid, Dictionary, WordId};
use crate::hyp::{best_hyp, Hypothesis, SegIter};
use crate::logmath::WORST_SCORE;
use crate::ngram::LanguageModel;

/// A single-state phone channel, identical in shape to
/// [`crate::fwdtree`]'s -- the HMM-per-phone collapse is a property of
/// the acoustic contract, not of which pass is stepping it.
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

/// Flat-lexicon forward Viterbi search (spec.md §4.4).
pub struct FwdflatSearch {
    config: Config,
    dict: Arc<dyn Dictionary>,
    d2p: Arc<dyn Dict2Pid>,
    lm: Arc<dyn LanguageModel>,
    acmod: Arc<dyn AcousticModel>,
    in_arcs: Arc<ArcBuffer>,
    out_arcs: Option<Arc<ArcBuffer>>,

    bptbl: BackPointerTable,
    /// First-phone (entry) channel for words with `pronlen >= 2`.
    entry: HashMap<WordId, Channel>,
    /// Word-internal channels keyed by (word, phone position).
    internal: HashMap<(WordId, usize), Channel>,
    /// Last-phone channels keyed by (word, right-context slot).
    last: HashMap<(WordId, usize), Channel>,
    /// Words the arc-buffer window has proposed this utterance, kept
    /// around so they (and their channels) can be cleared in bulk at
    /// `end_utt` (spec.md §4.4 "Per-utterance").
    active_words: HashSet<WordId>,

    frame: i32,
    best_score: i32,
    /// Lowest source frame still needed by the sliding window; arcs and
    /// acoustic state before it are released each frame.
    window_floor: i32,
}

impl FwdflatSearch {
    pub fn new(
        config: Config,
        dict: Arc<dyn Dictionary>,
        d2p: Arc<dyn Dict2Pid>,
        lm: Arc<dyn LanguageModel>,
        acmod: Arc<dyn AcousticModel>,
        in_arcs: Arc<ArcBuffer>,
        out_arcs: Option<Arc<ArcBuffer>>,
    ) -> Self {
        FwdflatSearch {
            config,
            dict,
            d2p,
            lm,
            acmod,
            in_arcs,
            out_arcs,
            bptbl: BackPointerTable::new("fwdflat"),
            entry: HashMap::new(),
            internal: HashMap::new(),
            last: HashMap::new(),
            active_words: HashSet::new(),
            frame: 0,
            best_score: WORST_SCORE,
            window_floor: 0,
        }
    }

    pub fn bptbl(&self) -> &BackPointerTable {
        &self.bptbl
    }

    fn window(&self) -> i32 {
        self.config.fwdflatsfwin.max(1) as i32
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

    /// Allocate (if absent) and activate `word`'s channel(s) with an
    /// incoming score/bp (spec.md §4.4 step 5).
    fn enter_word(&mut self, word: WordId, score: i32, bp: BpIdx) {
        let pronlen = self.dict.pronlen(word).max(1);
        self.active_words.insert(word);
        if pronlen == 1 {
            self.enter_last(word, 0, score, bp);
            return;
        }
        let senone = self.d2p.internal_triphone(word, 0) as u32;
        let chan = self.entry.entry(word).or_insert_with(|| Channel::new(senone));
        chan.enter(score, bp);
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

    /// Ensure `word` has an (inactive) channel allocated so it shows up
    /// in `active_senones` once something enters it, and is cleared at
    /// `end_utt` regardless of whether anything ever did (spec.md §4.4
    /// "Per-utterance").
    fn propose_word(&mut self, word: WordId) {
        if self.active_words.contains(&word) {
            return;
        }
        self.active_words.insert(word);
        let pronlen = self.dict.pronlen(word).max(1);
        if pronlen == 1 {
            let senone = self.d2p.internal_triphone(word, 0) as u32;
            self.last.entry((word, 0)).or_insert_with(|| Channel::new(senone));
        } else {
            let senone = self.d2p.internal_triphone(word, 0) as u32;
            self.entry.entry(word).or_insert_with(|| Channel::new(senone));
        }
    }

    pub fn start_utt(&mut self) {
        self.bptbl = BackPointerTable::new("fwdflat");
        self.entry.clear();
        self.internal.clear();
        self.last.clear();
        self.active_words.clear();
        self.frame = 0;
        self.best_score = WORST_SCORE;
        self.window_floor = 0;
        self.acmod.start_utt();
        if let Some(ab) = &self.out_arcs {
            ab.producer_start_utt("utt");
        }
        let start = self.dict.start_wid();
        let bp = self.bptbl.enter(&*self.dict, start, NO_BP, 0, 0, 1);
        self.propose_word(start);
        self.enter_word(start, 0, bp);
    }

    /// Block until the arc buffer has committed arcs covering
    /// `[frame - W, frame + W)`, or has signalled end-of-utterance
    /// (spec.md §4.4 step 1).
    fn wait_for_window(&self) -> Result<(), WaitError> {
        let target = self.frame + self.window();
        loop {
            if self.in_arcs.eou() {
                return Ok(());
            }
            let available = self.in_arcs.consumer_wait(Some(Duration::from_secs(30)))?;
            if available >= target {
                return Ok(());
            }
        }
    }

    /// Scan the arc-buffer window and mark every base word it proposes
    /// as eligible for expansion this frame (spec.md §4.4 step 2).
    fn scan_window(&mut self) -> Vec<WordId> {
        let lo = self.frame - self.window();
        let hi = self.frame + self.window();
        let arcs = self.in_arcs.iter_range(lo.max(0), hi);
        let mut seen = HashSet::new();
        let mut list = Vec::new();
        for a in &arcs {
            let base = self.dict.base_wid(a.arc.wid);
            if seen.insert(base) {
                self.propose_word(base);
                list.push(base);
            }
        }
        list
    }

    /// One frame of the search (spec.md §4.4 steps 1-6). Returns `false`
    /// once the acoustic model has no more frames to offer.
    pub fn step(&mut self) -> bool {
        if self.wait_for_window().is_err() {
            return false;
        }
        let expansion = self.scan_window();

        let ids = self.active_senones();
        self.acmod.activate(&ids);
        let senone_score = match self.acmod.score(self.frame) {
            Some(raw) => ids.into_iter().zip(raw.into_iter()).collect::<HashMap<_, _>>(),
            None => return false,
        };

        let oldest = self.compute_oldest_bp();
        self.bptbl.push_frame(oldest);

        self.step_entry(&senone_score);
        self.step_internal(&senone_score);
        let exits = self.step_last(&senone_score);

        self.bptbl.apply_maxwpf(&*self.dict, self.config.maxwpf);
        self.bptbl.commit();

        self.enforce_silence_window();

        for (word, bp) in exits {
            self.word_transition(word, bp, &expansion);
        }

        self.prune();
        self.renormalize();

        if let Some(ab) = &self.out_arcs {
            ab.producer_sweep(&mut self.bptbl, true);
        }

        let new_floor = self.frame - self.window();
        if new_floor > self.window_floor {
            self.in_arcs.consumer_release(new_floor);
            self.window_floor = new_floor;
        }

        self.acmod.advance();
        self.frame += 1;
        true
    }

    fn active_senones(&self) -> Vec<SenoneId> {
        let mut ids: Vec<SenoneId> = self.entry.values().map(|c| c.senone).collect();
        ids.extend(self.internal.values().map(|c| c.senone));
        ids.extend(self.last.values().map(|c| c.senone));
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn compute_oldest_bp(&self) -> BpIdx {
        let mut oldest = BpIdx::MAX;
        for c in self.entry.values().chain(self.internal.values()).chain(self.last.values()) {
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

    fn step_entry(&mut self, senone_score: &HashMap<SenoneId, i32>) {
        let words: Vec<WordId> = self.entry.keys().copied().collect();
        for w in words {
            let (score, bp) = match self.entry.get_mut(&w).unwrap().step(senone_score) {
                Some(v) => v,
                None => continue,
            };
            if score == WORST_SCORE {
                continue;
            }
            if score > self.best_score {
                self.best_score = score;
            }
            let pronlen = self.dict.pronlen(w).max(1);
            if pronlen == 2 {
                self.enter_last(w, 0, score, bp);
            } else if pronlen >= 3 {
                self.enter_internal(w, 1, score, bp);
            }
        }
    }

    fn step_internal(&mut self, senone_score: &HashMap<SenoneId, i32>) {
        let mut keys: Vec<(WordId, usize)> = self.internal.keys().copied().collect();
        keys.sort_by_key(|&(_, pos)| pos);
        for (word, pos) in keys {
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
                self.enter_last(word, 0, score, bp);
            } else if pos + 2 < pronlen {
                self.enter_internal(word, pos + 1, score, bp);
            }
        }
    }

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
    /// arbitrarily long run of silence exits (spec.md §6 `-maxsilfr`,
    /// same treatment as `crate::fwdtree`'s).
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

    /// Word transition restricted to the window's expansion list (spec.md
    /// §4.4 step 5): unlike fwdtree, a new word is only entered here if
    /// the upstream pass actually proposed it for this stretch of audio.
    fn word_transition(&mut self, exiting_word: WordId, bp: BpIdx, expansion: &[WordId]) {
        let real_wid = self.bptbl.get(bp).real_wid;
        let prev_real_wid = self.bptbl.get(bp).prev_real_wid;
        let base_score = self.bptbl.get(bp).score;
        for &next in expansion {
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
            let score = base_score + (lscr * self.config.fwdflatlw + penalty).round() as i32;
            if score + self.config.fwdflatwbeam < self.best_score {
                continue;
            }
            self.enter_word(next, score, bp);
        }
    }

    fn prune(&mut self) {
        let thresh = self.best_score + self.config.fwdflatbeam.round() as i32;
        let mut active_scores: Vec<i32> = Vec::new();
        for c in self.entry.values().chain(self.internal.values()).chain(self.last.values()) {
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
        for c in self.entry.values_mut() {
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

    fn renormalize(&mut self) {
        if self.best_score > 2 * (self.config.fwdflatbeam.round() as i32) + WORST_SCORE {
            return;
        }
        let offset = self.best_score;
        trace!(offset, "renormalizing fwdflat channel scores");
        for c in self.entry.values_mut().chain(self.internal.values_mut()).chain(self.last.values_mut()) {
            if c.is_active() {
                c.score -= offset;
            }
        }
        self.best_score -= offset;
    }

    pub fn end_utt(&mut self) {
        self.bptbl.finalize();
        self.acmod.end_utt();
        if let Some(ab) = &self.out_arcs {
            ab.producer_end_utt(&mut self.bptbl, true);
        }
        self.in_arcs.consumer_end_utt();
        debug!(frames = self.frame, words = self.active_words.len(), "fwdflat end_utt");
    }

    /// Run a full utterance against an already-producing input arc
    /// buffer, from `consumer_start_utt` through `end_utt`.
    pub fn decode_utterance(&mut self) -> Result<(), WaitError> {
        self.in_arcs.consumer_start_utt(Some(Duration::from_secs(30)))?;
        self.start_utt();
        while self.step() {}
        self.end_utt();
        Ok(())
    }

    pub fn hyp(&self, finish_wid: Option<WordId>) -> Hypothesis {
        best_hyp(&self.bptbl, &*self.dict, finish_wid)
    }

    pub fn seg_iter(&self, finish_wid: Option<WordId>) -> SegIter<'_> {
        let bp = self.bptbl.find_exit(&*self.dict, finish_wid);
        SegIter::from_bptbl(&self.bptbl, bp)
    }
}

/// Identical in shape to `fwdtree`'s adaptive cutoff (spec.md §4.3 step
/// 5, reused verbatim by §4.4 step 4).
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
    use crate::arc_buffer::ArcBuffer as Buf;
    use crate::bptbl::BackPointerTable as Bptbl;
    use crate::testutil::{TinyAcmod, TinyDict, TinyDict2Pid, TinyLm};

    /// Drive a tiny fwdtree pass to populate an arc buffer on a producer
    /// thread, then confirm fwdflat can consume it on this thread and
    /// re-derive the same one-word hypothesis (spec.md §8 scenario:
    /// "fwdtree and fwdflat agree"). `producer_end_utt` blocks for a
    /// consumer acknowledgement, so the two sides must run concurrently
    /// the way a real pipeline would (spec.md §4.2, §9).
    #[test]
    fn fwdflat_rescoring_agrees_with_single_word_tree_pass() {
        let dict = Arc::new(TinyDict::new());
        let d2p = Arc::new(TinyDict2Pid::new());
        let lm = Arc::new(TinyLm::unigram_only());
        let go = dict.wid_by_name("go").unwrap();

        let arcs = Buf::new("fwdtree-out", true);
        let producer_dict = dict.clone();
        let producer_arcs = arcs.clone();
        let producer = std::thread::spawn(move || {
            // Populate the bptbl directly instead of a full fwdtree run
            // -- this test exercises the consumer side of fwdflat, not
            // fwdtree's search (see `fwdtree::tests` for that).
            let mut src = Bptbl::new("src");
            let start = producer_dict.start_wid();
            let bp0 = src.enter(&*producer_dict, start, NO_BP, 0, 0, 1);
            src.push_frame(NO_BP);
            let bp1 = src.enter(&*producer_dict, go, bp0, -100, 0, 1);
            src.push_frame(bp1);
            producer_arcs.producer_start_utt("utt");
            producer_arcs.producer_end_utt(&mut src, true);
        });

        let acmod = Arc::new(TinyAcmod::favoring(&dict, &[go], 6));
        let mut ff = FwdflatSearch::new(Config::default(), dict.clone(), d2p, lm, acmod, arcs, None);
        ff.decode_utterance().unwrap();
        producer.join().unwrap();
        let hyp = ff.hyp(None);
        assert!(!hyp.is_empty());
        assert!(hyp.words.contains(&go));
    }
}
