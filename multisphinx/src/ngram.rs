//! Language model contract (spec.md §6).
//!
//! N-Gram storage and query are out of scope (spec.md §1); search
//! passes and the lattice generator only need `ngram`/`size` and a
//! backoff-weight lookup for intermediate histories (used by latgen's
//! N-Gram-state back-off walk, spec.md §4.5).

use crate::dict::WordId;

/// A successful N-gram lookup: natural-log probability and, if the
/// exact history wasn't found, the back-off weight that was applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NgramHit {
    pub log_prob: f64,
    pub log_bowt: f64,
}

/// Language model query surface (spec.md §6).
pub trait LanguageModel: Send + Sync {
    /// Maximum N-gram order (2 = bigram, 3 = trigram, ...).
    fn size(&self) -> usize;

    /// `P(w | history)`, backing off internally and reporting the
    /// aggregate back-off weight applied. `history[0]` is the most
    /// recent word. Returns `None` if `w` is entirely unknown to the
    /// model (spec.md §7: "unknown word in arc stream").
    fn ngram(&self, w: WordId, history: &[WordId]) -> Option<NgramHit>;

    /// Back-off weight for `history` alone (i.e. `log_bowt` for the
    /// context `history` with no successor specified), used by latgen
    /// when walking from an N-gram miss down to a shorter context
    /// (spec.md §4.5 step 2).
    fn backoff_weight(&self, history: &[WordId]) -> f64;

    /// Does the model contain an explicit entry for `(w, history)`
    /// (exact order, no back-off)? Used to decide whether latgen must
    /// create an intermediate back-off node (spec.md §4.5 step 2).
    fn contains(&self, w: WordId, history: &[WordId]) -> bool;

    fn has_end_of_sentence(&self) -> bool;
}
