//! Acoustic model contract (spec.md §6).
//!
//! Gaussian scoring itself is out of scope (spec.md §1 Non-goals); what
//! the search passes need is the call contract: per-frame senone
//! scores gated by an active-state set, utterance framing, and a
//! cheap `clone()` so two passes can independently consume the same
//! feature stream (spec.md §5: "the pass optionally owning a cloned
//! acmod instance").

use std::sync::Arc;

/// Dense senone id within the acoustic model's output layer.
pub type SenoneId = u32;

/// Acoustic scoring contract a search pass drives one frame at a time.
///
/// `Send + Sync` so a `Arc<dyn AcousticModel>` can be shared and cloned
/// across pass threads; each pass is expected to call `score`/`advance`
/// single-threaded on its own handle (spec.md §5).
pub trait AcousticModel: Send + Sync {
    /// Mark the active set of senones to score this frame. Passes call
    /// this before `score` so an implementation can skip inactive
    /// Gaussians.
    fn activate(&self, senones: &[SenoneId]);

    /// Number of senones marked active for the current frame.
    fn n_senone_active(&self) -> usize;

    /// Score the current frame for every active senone. Returns `None`
    /// once the feature stream is exhausted (`eou()` becomes true).
    fn score(&self, frame: i32) -> Option<Vec<i32>>;

    /// Advance to the next frame of input.
    fn advance(&self);

    fn start_utt(&self);
    fn end_utt(&self);

    /// Current output frame index.
    fn output_frame(&self) -> i32;

    /// True once the feature stream for this utterance is exhausted.
    fn eou(&self) -> bool;

    /// An independent handle onto the same underlying feature stream,
    /// so a second pass can score frames without contending with the
    /// first (spec.md §6's `clone()`).
    fn clone_handle(&self) -> Arc<dyn AcousticModel>;
}
