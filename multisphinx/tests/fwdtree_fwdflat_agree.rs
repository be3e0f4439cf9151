//! Full three-pass pipeline on a single-word utterance (spec.md §8
//! scenario 1, run through [`Pipeline`] rather than a lone pass): fwdtree
//! and fwdflat must agree on the recognized word, and the lattice
//! generator must produce a lattice containing that word on some link.

use std::sync::Arc;

use multisphinx::config::Config;
use multisphinx::dict::Dictionary;
use multisphinx::search_factory::Pipeline;
use multisphinx::testutil::{TinyAcmod, TinyDict, TinyDict2Pid, TinyLm};

#[test]
fn fwdtree_and_fwdflat_agree_on_single_word() {
    let dict = Arc::new(TinyDict::new());
    let d2p = Arc::new(TinyDict2Pid::new());
    let lm = Arc::new(TinyLm::unigram_only());
    let go = dict.wid_by_name("go").unwrap();
    let acmod = Arc::new(TinyAcmod::favoring(&dict, &[go], 8));

    let mut pipeline = Pipeline::new(Config::default(), dict.clone(), d2p, lm, acmod, 100.0);
    pipeline.run_utterance().unwrap();

    let tree_hyp = pipeline.fwdtree().hyp(None);
    let flat_hyp = pipeline.fwdflat().hyp(None);

    assert!(tree_hyp.words.contains(&go));
    assert!(flat_hyp.words.contains(&go));

    let lattice = pipeline.lattice();
    let has_go_link = (0..lattice.n_links()).any(|i| {
        let link = lattice.link(i);
        link.wid == go
    });
    assert!(has_go_link, "expected a lattice link for \"go\"");

    pipeline.shutdown();
}

#[test]
fn two_word_phrase_round_trips_through_all_three_passes() {
    let dict = Arc::new(TinyDict::new());
    let d2p = Arc::new(TinyDict2Pid::new());
    let mut lm = TinyLm::new(2);
    let start = dict.start_wid();
    let forward = dict.wid_by_name("forward").unwrap();
    let ten = dict.wid_by_name("ten").unwrap();
    let finish = dict.finish_wid();
    lm.set_prob(forward, &[start], -0.1);
    lm.set_prob(ten, &[forward], -0.1);
    lm.set_prob(finish, &[ten], -0.1);
    let lm = Arc::new(lm);

    let acmod = Arc::new(TinyAcmod::favoring(&dict, &[forward, ten], 16));

    let mut pipeline = Pipeline::new(Config::default(), dict.clone(), d2p, lm, acmod, 100.0);
    pipeline.run_utterance().unwrap();

    let flat_hyp = pipeline.fwdflat().hyp(None);
    assert!(!flat_hyp.is_empty());

    pipeline.shutdown();
}
