//! fwdflat's active vocabulary is whatever the upstream arc buffer
//! proposes within its sliding window, not the full dictionary
//! (spec.md §4.4). An acoustic model that favors two words equally
//! should still only ever produce the one the upstream pass actually
//! exited.

use std::sync::Arc;
use std::thread;

use multisphinx::arc_buffer::ArcBuffer;
use multisphinx::bptbl::{BackPointerTable, NO_BP};
use multisphinx::config::Config;
use multisphinx::dict::Dictionary;
use multisphinx::fwdflat::FwdflatSearch;
use multisphinx::testutil::{TinyAcmod, TinyDict, TinyDict2Pid, TinyLm};

#[test]
fn fwdflat_restricts_vocabulary_to_the_upstream_window() {
    let dict = Arc::new(TinyDict::new());
    let d2p = Arc::new(TinyDict2Pid::new());
    let lm = Arc::new(TinyLm::unigram_only());
    let forward = dict.wid_by_name("forward").unwrap();
    let meters = dict.wid_by_name("meters").unwrap();

    // Favor BOTH words equally; only "forward" is ever proposed by the
    // upstream buffer below, so "meters" must never surface even though
    // it would win acoustically if fwdflat considered the full lexicon.
    let acmod = Arc::new(TinyAcmod::favoring(&dict, &[forward, meters], 6));

    let in_arcs = ArcBuffer::new("test-in", true);
    let mut ff = FwdflatSearch::new(
        Config::default(),
        dict.clone(),
        d2p,
        lm,
        acmod,
        in_arcs.clone(),
        None,
    );

    let producer = {
        let in_arcs = in_arcs.clone();
        let dict = dict.clone();
        thread::spawn(move || {
            let mut src = BackPointerTable::new("test-producer");
            let start = dict.start_wid();
            let bp0 = src.enter(&*dict, start, NO_BP, 0, 0, 1);
            src.push_frame(NO_BP);
            let bp1 = src.enter(&*dict, forward, bp0, -10, 0, 1);
            src.push_frame(bp1);
            in_arcs.producer_start_utt("u1");
            in_arcs.producer_end_utt(&mut src, true);
        })
    };

    ff.decode_utterance().unwrap();
    producer.join().unwrap();

    let hyp = ff.hyp(None);
    assert!(
        !hyp.words.contains(&meters),
        "\"meters\" was never proposed upstream and must not appear: {:?}",
        hyp.words
    );
}
