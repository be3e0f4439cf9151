//! In-memory dictionary/LM/acoustic-model fixtures (spec.md §6, SPEC_FULL
//! §5), sized for unit and integration tests. Mirrors the teacher's
//! `tests/common/mod.rs` pattern of a small shared test dictionary instead
//! of loading a real one from disk.
//!
//! Gated behind the `testutil` feature (or `cfg(test)`) so it never ships
//! in a release build -- only `multisphinx`'s own tests and its
//! `multisphinx/tests/*.rs` integration suite depend on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::acmod::{AcousticModel, SenoneId};
use crate::dict::{Dict2Pid, Dictionary, PhoneId, WordId, NO_PHONE};
use crate::ngram::{LanguageModel, NgramHit};

/// A tiny, fully in-memory dictionary. Phone ids are synthesized as
/// `word_id * 10 + position`, which is all [`Dict2Pid`]/[`AcousticModel`]
/// need since the contracts in `crate::dict` only rely on equality and
/// ordering, never on the phone alphabet's actual meaning.
pub struct TinyDict {
    names: Vec<String>,
    base: Vec<WordId>,
    phones: Vec<Vec<PhoneId>>,
    filler: Vec<bool>,
    name_to_wid: HashMap<String, WordId>,
    start: WordId,
    finish: WordId,
    silence: WordId,
}

impl TinyDict {
    /// A vocabulary covering every seed scenario in spec.md §8: `<s>`,
    /// `</s>`, silence, one generic filler, "go" (with a pronunciation
    /// alternate), "forward", "ten", "meters", and single-phone "a"/"b"/"c"
    /// for the latgen trigram/backoff tests.
    pub fn new() -> Self {
        let mut b = TinyDictBuilder::new();
        let start = b.add_filler("<s>");
        let finish = b.add_filler("</s>");
        let silence = b.add_filler("SIL");
        b.add_filler("UH");
        let go = b.add_word("go", 2);
        b.add_alt(go, "go(2)", 2);
        b.add_word("forward", 3);
        b.add_word("ten", 2);
        b.add_word("meters", 3);
        b.add_word("a", 1);
        b.add_word("b", 1);
        b.add_word("c", 1);
        b.build(start, finish, silence)
    }
}

impl Default for TinyDict {
    fn default() -> Self {
        TinyDict::new()
    }
}

struct TinyDictBuilder {
    names: Vec<String>,
    base: Vec<WordId>,
    phones: Vec<Vec<PhoneId>>,
    filler: Vec<bool>,
    name_to_wid: HashMap<String, WordId>,
}

impl TinyDictBuilder {
    fn new() -> Self {
        TinyDictBuilder {
            names: Vec::new(),
            base: Vec::new(),
            phones: Vec::new(),
            filler: Vec::new(),
            name_to_wid: HashMap::new(),
        }
    }

    fn push(&mut self, name: &str, base: WordId, pronlen: usize, filler: bool) -> WordId {
        let wid = WordId::new(self.names.len() as u32);
        let phones = (0..pronlen.max(1))
            .map(|p| (wid.get() * 10 + p as u32) as PhoneId)
            .collect();
        self.names.push(name.to_string());
        self.base.push(base);
        self.phones.push(phones);
        self.filler.push(filler);
        self.name_to_wid.insert(name.to_string(), wid);
        wid
    }

    fn add_filler(&mut self, name: &str) -> WordId {
        let wid = WordId::new(self.names.len() as u32);
        self.push(name, wid, 1, true)
    }

    fn add_word(&mut self, name: &str, pronlen: usize) -> WordId {
        let wid = WordId::new(self.names.len() as u32);
        self.push(name, wid, pronlen, false)
    }

    fn add_alt(&mut self, base: WordId, name: &str, pronlen: usize) -> WordId {
        self.push(name, base, pronlen, false)
    }

    fn build(self, start: WordId, finish: WordId, silence: WordId) -> TinyDict {
        TinyDict {
            names: self.names,
            base: self.base,
            phones: self.phones,
            filler: self.filler,
            name_to_wid: self.name_to_wid,
            start,
            finish,
            silence,
        }
    }
}

impl Dictionary for TinyDict {
    fn n_words(&self) -> usize {
        self.names.len()
    }

    fn base_wid(&self, w: WordId) -> WordId {
        self.base[w.get() as usize]
    }

    fn pronlen(&self, w: WordId) -> usize {
        self.phones[w.get() as usize].len()
    }

    fn first_phone(&self, w: WordId) -> PhoneId {
        self.phones[w.get() as usize][0]
    }

    fn second_phone(&self, w: WordId) -> PhoneId {
        self.phones[w.get() as usize].get(1).copied().unwrap_or(NO_PHONE)
    }

    fn last_phone(&self, w: WordId) -> PhoneId {
        *self.phones[w.get() as usize].last().unwrap()
    }

    fn second_last_phone(&self, w: WordId) -> PhoneId {
        let p = &self.phones[w.get() as usize];
        if p.len() < 2 {
            NO_PHONE
        } else {
            p[p.len() - 2]
        }
    }

    fn is_filler(&self, w: WordId) -> bool {
        self.filler[w.get() as usize]
    }

    fn silence_wid(&self) -> WordId {
        self.silence
    }

    fn start_wid(&self) -> WordId {
        self.start
    }

    fn finish_wid(&self) -> WordId {
        self.finish
    }

    fn wid_by_name(&self, name: &str) -> Option<WordId> {
        self.name_to_wid.get(name).copied()
    }

    fn word_str(&self, w: WordId) -> &str {
        &self.names[w.get() as usize]
    }
}

/// A fixed-fanout right-context table: every multi-phone word gets the
/// same small fanout, and a following word's first phone is mapped into
/// a slot by simple modulo. `Dict2Pid` is documented as opaque beyond
/// equality/ordering (`crate::dict`), so there is nothing more to model.
pub struct TinyDict2Pid {
    fanout: usize,
}

impl TinyDict2Pid {
    pub fn new() -> Self {
        TinyDict2Pid { fanout: 3 }
    }
}

impl Default for TinyDict2Pid {
    fn default() -> Self {
        TinyDict2Pid::new()
    }
}

impl Dict2Pid for TinyDict2Pid {
    fn rc_fanout(&self, last_phone: PhoneId, second_last_phone: PhoneId) -> usize {
        if last_phone == NO_PHONE {
            0
        } else {
            let _ = second_last_phone;
            self.fanout
        }
    }

    fn rc_index(&self, _last_phone: PhoneId, _second_last_phone: PhoneId, next_first_phone: PhoneId) -> usize {
        (next_first_phone.max(0) as usize) % self.fanout
    }

    fn internal_triphone(&self, w: WordId, pos: usize) -> i32 {
        (w.get() * 10 + pos as u32) as i32
    }
}

/// A small explicit N-gram table with unigram/back-off fallback, for
/// tests that need specific trigram/bigram behavior (e.g. the latgen
/// back-off scenario in spec.md §8). `history[0]` is the most recent word,
/// matching [`LanguageModel::ngram`]'s contract.
pub struct TinyLm {
    order: usize,
    probs: HashMap<(WordId, Vec<WordId>), f64>,
    bowt: HashMap<Vec<WordId>, f64>,
    known: std::collections::HashSet<WordId>,
    /// If set, every word gets this unigram probability even if never
    /// explicitly added -- used by [`TinyLm::unigram_only`].
    default_log_prob: Option<f64>,
    has_eos: bool,
}

impl TinyLm {
    pub fn new(order: usize) -> Self {
        TinyLm {
            order,
            probs: HashMap::new(),
            bowt: HashMap::new(),
            known: std::collections::HashSet::new(),
            default_log_prob: None,
            has_eos: true,
        }
    }

    /// A degenerate unigram-only model: every word is "known" with the
    /// same flat log probability, regardless of history. Used by the
    /// single-word fwdtree seed test (spec.md §8 scenario 1).
    pub fn unigram_only() -> Self {
        let mut lm = TinyLm::new(1);
        lm.default_log_prob = Some(-1.0);
        lm
    }

    pub fn set_prob(&mut self, w: WordId, history: &[WordId], log_prob: f64) -> &mut Self {
        self.known.insert(w);
        self.probs.insert((w, history.to_vec()), log_prob);
        self
    }

    pub fn set_backoff(&mut self, history: &[WordId], log_bowt: f64) -> &mut Self {
        self.bowt.insert(history.to_vec(), log_bowt);
        self
    }

    pub fn set_has_eos(&mut self, v: bool) -> &mut Self {
        self.has_eos = v;
        self
    }
}

impl LanguageModel for TinyLm {
    fn size(&self) -> usize {
        self.order
    }

    fn ngram(&self, w: WordId, history: &[WordId]) -> Option<NgramHit> {
        let mut h = history.to_vec();
        if h.len() > self.order.saturating_sub(1) {
            h.truncate(self.order.saturating_sub(1));
        }
        let mut bowt_acc = 0.0;
        loop {
            if let Some(&p) = self.probs.get(&(w, h.clone())) {
                return Some(NgramHit {
                    log_prob: p + bowt_acc,
                    log_bowt: bowt_acc,
                });
            }
            if h.is_empty() {
                return if self.known.contains(&w) || self.default_log_prob.is_some() {
                    Some(NgramHit {
                        log_prob: self.default_log_prob.unwrap_or(f64::NEG_INFINITY) + bowt_acc,
                        log_bowt: bowt_acc,
                    })
                } else {
                    None
                };
            }
            bowt_acc += self.bowt.get(&h).copied().unwrap_or(0.0);
            h.pop();
        }
    }

    fn backoff_weight(&self, history: &[WordId]) -> f64 {
        self.bowt.get(history).copied().unwrap_or(0.0)
    }

    fn contains(&self, w: WordId, history: &[WordId]) -> bool {
        self.probs.contains_key(&(w, history.to_vec()))
    }

    fn has_end_of_sentence(&self) -> bool {
        self.has_eos
    }
}

struct AcmodShared {
    favored: std::collections::HashSet<SenoneId>,
    favor_score: i32,
    other_score: i32,
    n_frames: i32,
}

struct AcmodState {
    frame: i32,
    active: Vec<SenoneId>,
}

/// A fixed-score acoustic model: senones belonging to a set of "favored"
/// words score `favor_score` every frame, everything else scores
/// `other_score`, for `n_frames` frames. Drives the search toward a known
/// answer without any real feature extraction (spec.md §1 Non-goals).
pub struct TinyAcmod {
    shared: Arc<AcmodShared>,
    state: Mutex<AcmodState>,
}

impl TinyAcmod {
    pub fn favoring(dict: &TinyDict, words: &[WordId], n_frames: i32) -> Self {
        let mut favored = std::collections::HashSet::new();
        for &w in words {
            let n = dict.pronlen(w).max(1);
            for p in 0..n {
                favored.insert((w.get() * 10 + p as u32) as SenoneId);
            }
        }
        TinyAcmod {
            shared: Arc::new(AcmodShared {
                favored,
                favor_score: 0,
                other_score: -1000,
                n_frames,
            }),
            state: Mutex::new(AcmodState {
                frame: 0,
                active: Vec::new(),
            }),
        }
    }

    pub fn silent(n_frames: i32) -> Self {
        TinyAcmod {
            shared: Arc::new(AcmodShared {
                favored: std::collections::HashSet::new(),
                favor_score: -1,
                other_score: -1,
                n_frames,
            }),
            state: Mutex::new(AcmodState {
                frame: 0,
                active: Vec::new(),
            }),
        }
    }
}

impl AcousticModel for TinyAcmod {
    fn activate(&self, senones: &[SenoneId]) {
        let mut st = self.state.lock().unwrap();
        st.active = senones.to_vec();
    }

    fn n_senone_active(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    fn score(&self, frame: i32) -> Option<Vec<i32>> {
        let st = self.state.lock().unwrap();
        if frame >= self.shared.n_frames {
            return None;
        }
        Some(
            st.active
                .iter()
                .map(|s| {
                    if self.shared.favored.contains(s) {
                        self.shared.favor_score
                    } else {
                        self.shared.other_score
                    }
                })
                .collect(),
        )
    }

    fn advance(&self) {
        self.state.lock().unwrap().frame += 1;
    }

    fn start_utt(&self) {
        let mut st = self.state.lock().unwrap();
        st.frame = 0;
        st.active.clear();
    }

    fn end_utt(&self) {}

    fn output_frame(&self) -> i32 {
        self.state.lock().unwrap().frame
    }

    fn eou(&self) -> bool {
        self.state.lock().unwrap().frame >= self.shared.n_frames
    }

    fn clone_handle(&self) -> Arc<dyn AcousticModel> {
        Arc::new(TinyAcmod {
            shared: self.shared.clone(),
            state: Mutex::new(AcmodState {
                frame: 0,
                active: Vec::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_dict_has_expected_vocabulary() {
        let dict = TinyDict::new();
        assert!(dict.wid_by_name("go").is_some());
        assert!(dict.is_filler(dict.start_wid()));
        let go = dict.wid_by_name("go").unwrap();
        assert_eq!(dict.pronlen(go), 2);
    }

    #[test]
    fn tiny_lm_unigram_only_answers_any_word() {
        let dict = TinyDict::new();
        let lm = TinyLm::unigram_only();
        let go = dict.wid_by_name("go").unwrap();
        assert!(lm.ngram(go, &[dict.start_wid(), dict.start_wid()]).is_some());
    }

    #[test]
    fn tiny_lm_backs_off_to_bigram() {
        let dict = TinyDict::new();
        let a = dict.wid_by_name("a").unwrap();
        let b = dict.wid_by_name("b").unwrap();
        let c = dict.wid_by_name("c").unwrap();
        let mut lm = TinyLm::new(3);
        lm.set_prob(c, &[b], -0.5);
        lm.set_backoff(&[a, b], -0.2);
        let hit = lm.ngram(c, &[b, a]).unwrap();
        assert!((hit.log_prob - (-0.7)).abs() < 1e-9);
        assert!(!lm.contains(c, &[b, a]));
    }
}
