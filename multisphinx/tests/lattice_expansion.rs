//! Lattice generation driven end to end through an [`ArcBuffer`]
//! (spec.md §4.5), as opposed to `latgen`'s own inline tests which call
//! `LatGen::process_arc` directly. Builds a small back-pointer chain,
//! sweeps it through a real arc buffer on a producer thread, and checks
//! the resulting lattice has the expected node/link shape and a unique
//! end node once finalized.

use std::sync::Arc;
use std::thread;

use multisphinx::arc_buffer::ArcBuffer;
use multisphinx::bptbl::{BackPointerTable, NO_BP};
use multisphinx::dict::Dictionary;
use multisphinx::latgen::{ArcConsumer, LatticeGeneratorSearch};
use multisphinx::testutil::{TinyDict, TinyDict2Pid, TinyLm};

#[test]
fn two_word_chain_expands_into_a_connected_lattice_with_one_end_node() {
    let dict = Arc::new(TinyDict::new());
    let d2p = Arc::new(TinyDict2Pid::new());
    let start = dict.start_wid();
    let forward = dict.wid_by_name("forward").unwrap();
    let finish = dict.finish_wid();

    let mut lm = TinyLm::new(2);
    lm.set_prob(forward, &[start], -0.2);
    lm.set_prob(finish, &[forward], -0.2);
    let lm = Arc::new(lm);

    let arcs = ArcBuffer::new("latgen-test", true);
    let producer = {
        let arcs = arcs.clone();
        let dict = dict.clone();
        thread::spawn(move || {
            let mut src = BackPointerTable::new("latgen-producer");
            let bp0 = src.enter(&*dict, start, NO_BP, 0, 0, 1);
            src.push_frame(NO_BP);
            let bp1 = src.enter(&*dict, forward, bp0, -10, 0, 1);
            src.push_frame(bp1);
            let bp2 = src.enter(&*dict, finish, bp1, -15, 0, 1);
            src.push_frame(bp2);
            arcs.producer_start_utt("u1");
            arcs.producer_end_utt(&mut src, true);
        })
    };

    let mut search = LatticeGeneratorSearch::new(dict.clone(), d2p, lm, 100.0);
    search.run_utterance(&arcs).unwrap();
    producer.join().unwrap();

    let lattice = search.lattice();
    assert!(lattice.n_nodes() >= 2, "expected at least start and forward/finish nodes");
    assert!(lattice.n_links() >= 2, "expected at least a forward link and a finish link");

    let end = lattice.end_node().expect("lattice should have a unique end node after finalize");
    assert_eq!(lattice.node(end).wid, finish);

    let has_forward_link = (0..lattice.n_links()).any(|i| lattice.link(i).wid == forward);
    assert!(has_forward_link);
}
