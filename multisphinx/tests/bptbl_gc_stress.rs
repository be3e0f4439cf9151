//! Back-pointer table garbage collection under sustained load
//! (spec.md §4.1, §8 "long utterance... exercising the GC/retire path
//! repeatedly"). Runs a long single-word-chain utterance through raw
//! `BackPointerTable` calls -- well past any single GC window -- and
//! checks the invariants spec.md §4.1 promises:
//!
//! - `release` is idempotent (calling it twice with the same index is
//!   a no-op the second time).
//! - indices handed back by `enter` remain valid (`get`, `backtrace`)
//!   for as long as the bp is reachable, across any number of GC
//!   cycles.
//! - `find_exit`/`backtrace` still reconstruct the full, correctly
//!   ordered word chain after hundreds of frames and many retirements.

use std::sync::Arc;

use multisphinx::bptbl::{BackPointerTable, NO_BP};
use multisphinx::dict::Dictionary;
use multisphinx::testutil::TinyDict;

const N_WORDS: i32 = 400;
// How many frames the oldest-active hint is held back before jumping
// forward, the way a real search pass's `compute_oldest_bp` only advances
// in bursts as whole cohorts of channels die off, not every single frame.
const LAG: i32 = 5;

#[test]
fn long_chain_survives_repeated_gc_and_release() {
    let dict = Arc::new(TinyDict::new());
    let go = dict.wid_by_name("go").unwrap();
    let start = dict.start_wid();

    let mut bptbl = BackPointerTable::new("stress");
    let mut prev = NO_BP;
    let mut released_through = 0;
    let mut oldest_hint = NO_BP;

    prev = bptbl.enter(&*dict, start, prev, 0, 0, 1);
    oldest_hint = prev;
    bptbl.push_frame(oldest_hint);

    for i in 1..=N_WORDS {
        let score = -(i);
        prev = bptbl.enter(&*dict, go, prev, score, 0, 1);
        if i % LAG == 0 {
            oldest_hint = prev;
        }
        bptbl.push_frame(oldest_hint);

        // Release everything retired so far every few frames, the way a
        // long-running pass periodically reclaims memory.
        if i % 17 == 0 {
            let cutoff = bptbl.retired_idx();
            bptbl.release(cutoff);
            // Idempotent: releasing the same cutoff again must not panic
            // or change anything observable.
            bptbl.release(cutoff);
            released_through = cutoff;
        }
    }
    bptbl.finalize();

    assert!(released_through > 0, "the chain should have triggered at least one release");

    let exit = bptbl.find_exit(&*dict, None);
    assert_ne!(exit, NO_BP);

    let chain = bptbl.backtrace(exit);
    // <s> plus N_WORDS exits of "go".
    assert_eq!(chain.len() as i32, N_WORDS + 1);
    assert_eq!(bptbl.get(chain[0]).wid, start);
    for idx in &chain[1..] {
        assert_eq!(bptbl.get(*idx).wid, go);
    }

    // Scores strictly decrease along the chain (each step subtracted 1).
    for w in chain.windows(2) {
        assert!(bptbl.get(w[1]).score <= bptbl.get(w[0]).score);
    }
}

#[test]
fn release_with_an_already_passed_index_is_a_no_op() {
    let dict = Arc::new(TinyDict::new());
    let start = dict.start_wid();
    let go = dict.wid_by_name("go").unwrap();

    let mut bptbl = BackPointerTable::new("stress-release");
    let mut prev = bptbl.enter(&*dict, start, NO_BP, 0, 0, 1);
    let mut oldest_hint = prev;
    bptbl.push_frame(oldest_hint);
    for i in 1..=50 {
        prev = bptbl.enter(&*dict, go, prev, -(i), 0, 1);
        if i % LAG == 0 {
            oldest_hint = prev;
        }
        bptbl.push_frame(oldest_hint);
    }
    bptbl.finalize();

    let cutoff = bptbl.retired_idx();
    bptbl.release(cutoff);
    let exit_before = bptbl.find_exit(&*dict, None);
    let chain_before = bptbl.backtrace(exit_before);

    // Releasing an index at or below the already-released cutoff must
    // not disturb anything.
    bptbl.release(0);
    bptbl.release(cutoff);

    let exit_after = bptbl.find_exit(&*dict, None);
    let chain_after = bptbl.backtrace(exit_after);
    assert_eq!(chain_before.len(), chain_after.len());
}
