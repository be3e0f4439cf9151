//! Single-word utterance, fwdtree only (spec.md §8 scenario 1): with an
//! acoustic model that favors one word's senones throughout, fwdtree's
//! hypothesis should be exactly that word.

use std::sync::Arc;

use multisphinx::config::Config;
use multisphinx::dict::Dictionary;
use multisphinx::fwdtree::FwdtreeSearch;
use multisphinx::testutil::{TinyAcmod, TinyDict, TinyDict2Pid, TinyLm};

#[test]
fn single_favored_word_is_recognized() {
    let dict = Arc::new(TinyDict::new());
    let d2p = Arc::new(TinyDict2Pid::new());
    let lm = Arc::new(TinyLm::unigram_only());
    let go = dict.wid_by_name("go").unwrap();
    let acmod = Arc::new(TinyAcmod::favoring(&dict, &[go], 8));

    let mut search = FwdtreeSearch::new(Config::default(), dict.clone(), d2p, lm, acmod, None);
    search.decode_utterance();

    let hyp = search.hyp(None);
    assert!(!hyp.is_empty());
    assert!(hyp.words.contains(&go), "expected \"go\" in {:?}", hyp.words);
}

#[test]
fn silent_utterance_yields_no_word_exits() {
    let dict = Arc::new(TinyDict::new());
    let d2p = Arc::new(TinyDict2Pid::new());
    let lm = Arc::new(TinyLm::unigram_only());
    let acmod = Arc::new(TinyAcmod::silent(4));

    let mut search = FwdtreeSearch::new(Config::default(), dict, d2p, lm, acmod, None);
    search.decode_utterance();

    // Every senone scores identically so nothing is favored; this only
    // asserts decode_utterance runs to completion without panicking on
    // a degenerate (no-real-signal) utterance.
    let hyp = search.hyp(None);
    let _ = hyp;
}
