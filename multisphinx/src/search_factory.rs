//! Pipeline construction and the per-utterance run loop (spec.md §5,
//! Design Notes §9; SPEC_FULL.md §7).
//!
//! `Pipeline` wires the three search passes and the two arc buffers
//! connecting them from a [`Config`] and the three external contracts.
//! Each utterance is fed to all three passes concurrently: fwdtree runs
//! on the caller's thread (it is the one pulling fresh frames out of
//! the acoustic model, spec.md §5 "plus the caller thread feeding
//! acoustic features"), while fwdflat and latgen each get a scoped
//! worker thread for the utterance's duration, joined before
//! `run_utterance` returns.

use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::acmod::AcousticModel;
use crate::arc_buffer::ArcBuffer;
use crate::config::Config;
use crate::dict::{Dict2Pid, Dictionary, WordId};
use crate::error::{MultisphinxError, MultisphinxResult};
use crate::fwdflat::FwdflatSearch;
use crate::fwdtree::FwdtreeSearch;
use crate::hyp::{Hypothesis, SegIter};
use crate::lattice::Lattice;
use crate::latgen::{ArcConsumer, LatticeGeneratorSearch};
use crate::ngram::LanguageModel;

/// Polymorphism over the search-pass v-table (Design Notes §9:
/// "expressed as an interface/trait with one implementation per
/// pass"). The lattice generator is not a `Search` -- it has no `hyp`
/// of its own and consumes rather than produces arcs, see
/// [`crate::latgen::ArcConsumer`].
pub trait Search: Send {
    fn name(&self) -> &'static str;
    fn hyp(&self, finish_wid: Option<WordId>) -> Hypothesis;
    fn seg_iter(&self, finish_wid: Option<WordId>) -> SegIter<'_>;
}

impl Search for FwdtreeSearch {
    fn name(&self) -> &'static str {
        "fwdtree"
    }

    fn hyp(&self, finish_wid: Option<WordId>) -> Hypothesis {
        FwdtreeSearch::hyp(self, finish_wid)
    }

    fn seg_iter(&self, finish_wid: Option<WordId>) -> SegIter<'_> {
        FwdtreeSearch::seg_iter(self, finish_wid)
    }
}

impl Search for FwdflatSearch {
    fn name(&self) -> &'static str {
        "fwdflat"
    }

    fn hyp(&self, finish_wid: Option<WordId>) -> Hypothesis {
        FwdflatSearch::hyp(self, finish_wid)
    }

    fn seg_iter(&self, finish_wid: Option<WordId>) -> SegIter<'_> {
        FwdflatSearch::seg_iter(self, finish_wid)
    }
}

/// The three-pass decoder pipeline (spec.md §2, §5; SPEC_FULL.md §7).
pub struct Pipeline {
    dict: Arc<dyn Dictionary>,
    fwdtree: FwdtreeSearch,
    // `Option` so `run_utterance` can move the pass into its worker
    // thread for the utterance's duration and reclaim it afterwards.
    fwdflat: Option<FwdflatSearch>,
    latgen: Option<LatticeGeneratorSearch>,
    tree_to_flat: Arc<ArcBuffer>,
    flat_to_lat: Arc<ArcBuffer>,
}

impl Pipeline {
    /// Build a pipeline from a resolved [`Config`] and the three
    /// external contracts it drives (spec.md §6). `acmod` is cloned
    /// once per pass via [`AcousticModel::clone_handle`] so fwdtree and
    /// fwdflat each score frames on an independent handle (spec.md §5).
    pub fn new(
        config: Config,
        dict: Arc<dyn Dictionary>,
        d2p: Arc<dyn Dict2Pid>,
        lm: Arc<dyn LanguageModel>,
        acmod: Arc<dyn AcousticModel>,
        frate: f64,
    ) -> Self {
        let tree_to_flat = ArcBuffer::new("fwdtree-to-fwdflat", true);
        let flat_to_lat = ArcBuffer::new("fwdflat-to-latgen", true);

        let fwdtree = FwdtreeSearch::new(
            config.clone(),
            dict.clone(),
            d2p.clone(),
            lm.clone(),
            acmod.clone_handle(),
            Some(tree_to_flat.clone()),
        );
        let fwdflat = FwdflatSearch::new(
            config.clone(),
            dict.clone(),
            d2p.clone(),
            lm.clone(),
            acmod.clone_handle(),
            tree_to_flat.clone(),
            Some(flat_to_lat.clone()),
        );
        let latgen = LatticeGeneratorSearch::new(dict.clone(), d2p, lm, frate);

        Pipeline {
            dict,
            fwdtree,
            fwdflat: Some(fwdflat),
            latgen: Some(latgen),
            tree_to_flat,
            flat_to_lat,
        }
    }

    /// Feed one utterance of acoustic features to all three passes
    /// concurrently, blocking until all three finish (SPEC_FULL.md §7).
    ///
    /// fwdflat and latgen run on scoped worker threads since they are
    /// driven by their upstream arc buffer rather than directly by the
    /// acoustic model; fwdtree runs here, on the calling thread.
    pub fn run_utterance(&mut self) -> MultisphinxResult<()> {
        let mut fwdflat = self.fwdflat.take().expect("pipeline already shut down");
        let mut latgen = self.latgen.take().expect("pipeline already shut down");
        let lat_input = self.flat_to_lat.clone();

        let flat_handle = thread::Builder::new()
            .name("fwdflat".into())
            .spawn(move || {
                let result = fwdflat.decode_utterance();
                (fwdflat, result)
            })
            .expect("spawn fwdflat worker thread");

        let lat_handle = thread::Builder::new()
            .name("latgen".into())
            .spawn(move || {
                let result = latgen.run_utterance(&lat_input);
                (latgen, result)
            })
            .expect("spawn latgen worker thread");

        self.fwdtree.decode_utterance();

        let (fwdflat, flat_result) = flat_handle.join().expect("fwdflat worker thread panicked");
        let (latgen, lat_result) = lat_handle.join().expect("latgen worker thread panicked");
        self.fwdflat = Some(fwdflat);
        self.latgen = Some(latgen);

        if let Err(e) = flat_result {
            warn!(pass = "fwdflat", error = %e, "pass ended abnormally");
            return Err(MultisphinxError::Cancelled);
        }
        if let Err(e) = lat_result {
            warn!(pass = "latgen", error = %e, "pass ended abnormally");
            return Err(MultisphinxError::Cancelled);
        }
        debug!("run_utterance complete");
        Ok(())
    }

    /// Shut down both arc buffers, unblocking any pass still waiting on
    /// them (spec.md §5 "Cancellation and timeouts").
    pub fn shutdown(&self) {
        self.tree_to_flat.producer_shutdown();
        self.flat_to_lat.producer_shutdown();
    }

    pub fn fwdtree(&self) -> &FwdtreeSearch {
        &self.fwdtree
    }

    pub fn fwdflat(&self) -> &FwdflatSearch {
        self.fwdflat.as_ref().expect("pipeline already shut down")
    }

    /// The final hypothesis: fwdflat's, since it is the last
    /// word-level pass (rescored against the downstream language model,
    /// spec.md §4.4).
    pub fn hyp(&self, finish_wid: Option<WordId>) -> Hypothesis {
        self.fwdflat().hyp(finish_wid)
    }

    pub fn lattice(&self) -> &Lattice {
        self.latgen.as_ref().expect("pipeline already shut down").lattice()
    }

    pub fn dict(&self) -> &Arc<dyn Dictionary> {
        &self.dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TinyAcmod, TinyDict, TinyDict2Pid, TinyLm};

    #[test]
    fn pipeline_runs_single_word_utterance_end_to_end() {
        let dict = Arc::new(TinyDict::new());
        let d2p = Arc::new(TinyDict2Pid::new());
        let lm = Arc::new(TinyLm::unigram_only());
        let go = dict.wid_by_name("go").unwrap();
        let acmod = Arc::new(TinyAcmod::favoring(&dict, &[go], 6));

        let mut pipeline = Pipeline::new(Config::default(), dict.clone(), d2p, lm, acmod, 100.0);
        pipeline.run_utterance().unwrap();

        let tree_hyp = pipeline.fwdtree().hyp(None);
        assert!(!tree_hyp.is_empty());
        assert!(tree_hyp.words.contains(&go));

        let final_hyp = pipeline.hyp(None);
        assert!(!final_hyp.is_empty());
    }
}
