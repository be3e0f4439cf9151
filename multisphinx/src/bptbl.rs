//! Back-pointer table (spec.md §4.1).
//!
//! Every word exit a search pass considers is recorded here as a `Bp`.
//! The table is split into two parallel regions with a single
//! contiguous index space: `retired` (GC'd and renumbered, indices
//! stable until [`BackPointerTable::release`]) and `active` (the
//! current GC window, indices stable only until the next GC). A
//! separate `rc` array holds right-context score deltas; each `Bp`
//! owns a contiguous slice of it.
//!
//! Grounded in `examples/original_source/multisphinx/multisphinx/bptbl.h`
//! (`bp_t`, `bptbl_t`, the `enter`/`commit`/`push_frame`/`release` API)
//! translated to owned `Vec`-backed storage instead of `garray_t`.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::dict::{Dictionary, WordId};
use crate::logmath::WORST_SCORE;

/// Index into the combined retired+active back-pointer space.
pub type BpIdx = i32;

/// Sentinel meaning "no back-pointer" (spec.md GLOSSARY, §4.1 `enter`).
pub const NO_BP: BpIdx = -1;

/// Right-context delta sentinel: "no exit with this right context".
pub const NO_RC: u16 = u16::MAX;

/// A single back-pointer table entry (spec.md §3).
#[derive(Debug, Clone)]
pub struct Bp {
    pub frame: i32,
    pub wid: WordId,
    pub prev_bp: BpIdx,
    pub score: i32,
    /// Base offset into the `rc` array for this bp's right-context deltas.
    pub score_stack_idx: usize,
    /// Number of rc delta slots allocated at this bp's `score_stack_idx`.
    pub rc_len: usize,
    pub last_phone: i16,
    pub last2_phone: i16,
    pub valid: bool,
    pub real_wid: WordId,
    pub prev_real_wid: WordId,
}

/// Back-pointer table: append, garbage-collect, and renumber word exits
/// for a single search pass (spec.md §4.1).
pub struct BackPointerTable {
    name: String,
    retired: Vec<Bp>,
    active: Vec<Bp>,
    rc: Vec<u16>,
    /// Index in the combined space of `retired[0]`.
    retired_base: BpIdx,
    /// First frame still active; bps exiting before this are retired.
    active_frame: i32,
    /// Per-frame index into the combined space: `ef_idx[f - active_frame]`
    /// is the first bp index exiting in frame `f`.
    ef_idx: Vec<BpIdx>,
    n_frame: i32,
    oldest_bp: BpIdx,
}

impl BackPointerTable {
    pub fn new(name: impl Into<String>) -> Self {
        BackPointerTable {
            name: name.into(),
            retired: Vec::new(),
            active: Vec::new(),
            rc: Vec::new(),
            retired_base: 0,
            active_frame: 0,
            ef_idx: vec![0],
            n_frame: 0,
            oldest_bp: NO_BP,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index one past the last retired bp (== first active index).
    pub fn retired_idx(&self) -> BpIdx {
        self.retired_base + self.retired.len() as BpIdx
    }

    /// Index one past the last bp in the table.
    pub fn end_idx(&self) -> BpIdx {
        self.retired_idx() + self.active.len() as BpIdx
    }

    pub fn active_idx(&self) -> BpIdx {
        self.retired_idx()
    }

    pub fn active_frame(&self) -> i32 {
        self.active_frame
    }

    pub fn frame_idx(&self) -> i32 {
        self.n_frame
    }

    /// First start frame for which all bps are guaranteed retired.
    pub fn active_sf(&self) -> i32 {
        self.active_frame
    }

    fn is_retired(&self, idx: BpIdx) -> bool {
        idx < self.retired_idx()
    }

    pub fn get(&self, idx: BpIdx) -> &Bp {
        if self.is_retired(idx) {
            &self.retired[(idx - self.retired_base) as usize]
        } else {
            &self.active[(idx - self.retired_idx()) as usize]
        }
    }

    fn get_mut(&mut self, idx: BpIdx) -> &mut Bp {
        let retired_idx = self.retired_idx();
        if idx < retired_idx {
            &mut self.retired[(idx - self.retired_base) as usize]
        } else {
            &mut self.active[(idx - retired_idx) as usize]
        }
    }

    /// Right-context deltas belonging to `idx`, sized by how many the
    /// entry was allocated at `enter` time.
    pub fn rc_deltas(&self, idx: BpIdx, n: usize) -> &[u16] {
        let bp = self.get(idx);
        &self.rc[bp.score_stack_idx..bp.score_stack_idx + n]
    }

    fn real_wid_of(&self, dict: &dyn Dictionary, prev_bp: BpIdx, wid: WordId) -> (WordId, WordId) {
        let base = dict.base_wid(wid);
        if dict.is_filler(base) {
            if prev_bp == NO_BP {
                (base, base)
            } else {
                let prev = self.get(prev_bp);
                (prev.real_wid, prev.prev_real_wid)
            }
        } else if prev_bp == NO_BP {
            (base, base)
        } else {
            let prev = self.get(prev_bp);
            (base, prev.real_wid)
        }
    }

    /// Append a new active bp at the current frame (spec.md §4.1 `enter`).
    ///
    /// `rc_fanout` is the number of right-context slots `wid`'s last
    /// phone needs (0 for single-phone words); all are initialized to
    /// [`NO_RC`] except the slot for `rc`, which is set to 0 (this bp
    /// *is* its own best score for that context).
    pub fn enter(
        &mut self,
        dict: &dyn Dictionary,
        wid: WordId,
        prev_bp: BpIdx,
        score: i32,
        rc: usize,
        rc_fanout: usize,
    ) -> BpIdx {
        let (real_wid, prev_real_wid) = self.real_wid_of(dict, prev_bp, wid);
        let last_phone = dict.last_phone(wid);
        let last2_phone = dict.second_last_phone(wid);
        let score_stack_idx = self.rc.len();
        let n = rc_fanout.max(1);
        self.rc.resize(score_stack_idx + n, NO_RC);
        if rc < n {
            self.rc[score_stack_idx + rc] = 0;
        }
        let bp = Bp {
            frame: self.n_frame,
            wid,
            prev_bp,
            score,
            score_stack_idx,
            rc_len: n,
            last_phone,
            last2_phone,
            valid: true,
            real_wid,
            prev_real_wid,
        };
        let idx = self.end_idx();
        self.active.push(bp);
        trace!(bptbl = %self.name, idx, frame = self.n_frame, "enter");
        idx
    }

    /// Store `best_score(bp) - score` as the delta for right context
    /// `rc`, or [`NO_RC`] if the margin overflows or `score` is
    /// unreachable (spec.md §4.1 `set_rc_score`).
    pub fn set_rc_score(&mut self, bp: BpIdx, rc: usize, score: i32) {
        let best = self.get(bp).score;
        let delta = if score == WORST_SCORE {
            NO_RC
        } else {
            let d = best - score;
            if d < 0 || d as i64 >= NO_RC as i64 {
                NO_RC
            } else {
                d as u16
            }
        };
        let base = self.get(bp).score_stack_idx;
        self.rc[base + rc] = delta;
    }

    /// Replace `prev_bp`/`score` for an existing bp in the current
    /// frame when a better incoming path is found, shifting existing rc
    /// deltas by the score improvement (spec.md §4.1 `update_bp`).
    pub fn update_bp(&mut self, dict: &dyn Dictionary, bp: BpIdx, new_prev: BpIdx, new_score: i32) {
        let (base, n, old_score, wid) = {
            let e = self.get(bp);
            (e.score_stack_idx, e.rc_len, e.score, e.wid)
        };
        let delta = new_score - old_score;
        for slot in &mut self.rc[base..base + n] {
            if *slot != NO_RC {
                let shifted = *slot as i64 - delta as i64;
                *slot = if shifted < 0 || shifted >= NO_RC as i64 {
                    NO_RC
                } else {
                    shifted as u16
                };
            }
        }
        let (real_wid, prev_real_wid) = self.real_wid_of(dict, new_prev, wid);
        let e = self.get_mut(bp);
        e.prev_bp = new_prev;
        e.score = new_score;
        e.real_wid = real_wid;
        e.prev_real_wid = prev_real_wid;
    }

    /// Advance the frame counter, record the just-finished frame's end
    /// index, and run GC with `oldest_active_bp` as the root hint
    /// (spec.md §4.1 `push_frame`).
    pub fn push_frame(&mut self, oldest_active_bp: BpIdx) {
        self.ef_idx.push(self.end_idx());
        self.n_frame += 1;
        let next_active_frame = if oldest_active_bp == NO_BP {
            0
        } else {
            self.get(oldest_active_bp).frame
        };
        self.gc(next_active_frame);
    }

    /// Compact the just-appended bps by dropping those marked invalid,
    /// closing the gap in both `active` and `rc` (spec.md §4.1
    /// `commit`, and the `maxwpf` trim in §4.3 step 7).
    pub fn commit(&mut self) {
        if self.active.iter().all(|b| b.valid) {
            return;
        }
        let mut kept: Vec<Bp> = Vec::with_capacity(self.active.len());
        let mut new_rc: Vec<u16> = Vec::with_capacity(self.rc.len());
        // rc offsets below the active region are untouched; only the
        // region covering `self.active` itself needs recompaction.
        let active_rc_start = if self.active.is_empty() {
            self.rc.len()
        } else {
            self.active[0].score_stack_idx
        };
        new_rc.extend_from_slice(&self.rc[..active_rc_start]);
        for bp in self.active.drain(..) {
            if !bp.valid {
                continue;
            }
            let n = bp.rc_len;
            let new_base = new_rc.len();
            new_rc.extend_from_slice(&self.rc[bp.score_stack_idx..bp.score_stack_idx + n]);
            let mut bp = bp;
            bp.score_stack_idx = new_base;
            kept.push(bp);
        }
        self.active = kept;
        self.rc = new_rc;
    }

    /// Invalidate all but the best filler exit and the top-`maxwpf`
    /// non-filler exits of the current (uncommitted) frame
    /// (spec.md §4.3 step 7).
    pub fn apply_maxwpf(&mut self, dict: &dyn Dictionary, maxwpf: usize) {
        let frame = self.n_frame;
        let mut filler_best: Option<(usize, i32)> = None;
        let mut non_filler: Vec<(usize, i32)> = Vec::new();
        for (i, bp) in self.active.iter().enumerate() {
            if bp.frame != frame || !bp.valid {
                continue;
            }
            if dict.is_filler(dict.base_wid(bp.wid)) {
                if filler_best.map(|(_, s)| bp.score > s).unwrap_or(true) {
                    filler_best = Some((i, bp.score));
                }
            } else {
                non_filler.push((i, bp.score));
            }
        }
        if non_filler.len() <= maxwpf {
            return;
        }
        non_filler.sort_by(|a, b| b.1.cmp(&a.1));
        let mut keep = vec![false; self.active.len()];
        if let Some((i, _)) = filler_best {
            keep[i] = true;
        }
        for &(i, _) in non_filler.iter().take(maxwpf) {
            keep[i] = true;
        }
        let dropped = non_filler.len() - maxwpf.min(non_filler.len());
        if dropped > 0 {
            debug!(bptbl = %self.name, frame, dropped, "maxwpf trim");
        }
        for (i, bp) in self.active.iter_mut().enumerate() {
            if bp.frame == frame && !keep[i] {
                bp.valid = false;
            }
        }
    }

    /// Drop retired bps with index `< first_idx`, advancing the
    /// retired-array and rc-array origins (spec.md §4.1 `release`).
    /// Idempotent: calling twice with the same `first_idx` is a no-op
    /// the second time (spec.md §8).
    pub fn release(&mut self, first_idx: BpIdx) {
        let first_idx = first_idx.clamp(self.retired_base, self.retired_idx());
        let drop_n = (first_idx - self.retired_base) as usize;
        if drop_n == 0 {
            return;
        }
        let rc_cut = if drop_n == self.retired.len() {
            self.active
                .first()
                .map(|b| b.score_stack_idx)
                .unwrap_or(self.rc.len())
        } else {
            self.retired[drop_n].score_stack_idx
        };
        self.retired.drain(..drop_n);
        for bp in self.retired.iter_mut() {
            bp.score_stack_idx -= rc_cut;
        }
        self.rc.drain(..rc_cut);
        for bp in self.active.iter_mut() {
            bp.score_stack_idx -= rc_cut;
        }
        self.retired_base = first_idx;
    }

    /// The GC protocol of spec.md §4.1. `next_active_frame` is the frame
    /// of the oldest bp any live channel still points to (the root hint
    /// a search pass computes every frame), or one past the last frame
    /// with any entries to retire everything still reachable from it
    /// (see `finalize`).
    fn gc(&mut self, next_active_frame: i32) {
        if next_active_frame <= self.active_frame + 1 {
            if next_active_frame > self.active_frame {
                self.active_frame = next_active_frame;
            }
            return;
        }

        // Step 2: invalidate bps exiting in [active_frame, next_active_frame).
        for bp in self.active.iter_mut() {
            if bp.frame >= self.active_frame && bp.frame < next_active_frame {
                bp.valid = false;
            }
        }

        // Find split point: bps with frame < next_active_frame are the
        // to-be-retired window (they were appended in frame order).
        let mut split = 0;
        for (i, bp) in self.active.iter().enumerate() {
            if bp.frame < next_active_frame {
                split = i + 1;
            }
        }
        let to_retire_end = split;

        // Step 3: mark forward-reachable predecessors. The roots are the
        // bps that remain active -- those exiting in
        // [next_active_frame, current_frame) -- not the retire window
        // itself, whose `valid` flags step 2 just zeroed.
        let mut reachable_frames: std::collections::HashSet<i32> = std::collections::HashSet::new();
        for bp in &self.active[to_retire_end..] {
            if bp.prev_bp != NO_BP {
                reachable_frames.insert(self.get(bp.prev_bp).frame);
            }
        }
        loop {
            let mut grew = false;
            let frames_snapshot: Vec<i32> = reachable_frames.iter().copied().collect();
            for i in 0..to_retire_end {
                let bp = &self.active[i];
                if !frames_snapshot.contains(&bp.frame) {
                    continue;
                }
                if bp.prev_bp != NO_BP {
                    let pf = self.get(bp.prev_bp).frame;
                    if pf >= self.active_frame && reachable_frames.insert(pf) {
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }
        // A bp in the retire window survives GC iff its exit frame was
        // marked reachable by the walk above; this overrides step 2's
        // blanket invalidation, not just narrows it.
        for i in 0..to_retire_end {
            self.active[i].valid = reachable_frames.contains(&self.active[i].frame);
        }

        // Step 4: retire, building a permutation map.
        let mut permute: HashMap<BpIdx, BpIdx> = HashMap::new();
        let retire_base_idx = self.retired_idx();
        let mut new_oldest = BpIdx::MAX;
        for i in 0..to_retire_end {
            let old_idx = retire_base_idx + i as BpIdx;
            if !self.active[i].valid {
                permute.insert(old_idx, -1);
                continue;
            }
            let bp = self.active[i].clone();
            let n = bp.rc_len;
            let new_base = self.rc.len();
            // rc region is already contiguous with the active array at
            // this point (no commit has run since append), so this is a
            // linear copy.
            let src: Vec<u16> = self.rc[bp.score_stack_idx..bp.score_stack_idx + n].to_vec();
            self.rc.extend_from_slice(&src);
            let mut bp = bp;
            bp.score_stack_idx = new_base;
            let new_idx = self.retired_idx();
            self.retired.push(bp);
            permute.insert(old_idx, new_idx);
        }

        // Step 5: remap prev_bp for newly retired and still-active bps.
        for bp in self.retired[(self.retired.len() - permute.values().filter(|&&v| v >= 0).count())..].iter_mut() {
            if let Some(&mapped) = permute.get(&bp.prev_bp) {
                bp.prev_bp = mapped;
            }
            if bp.prev_bp >= 0 && bp.prev_bp < new_oldest {
                new_oldest = bp.prev_bp;
            }
        }
        let remaining: Vec<Bp> = self.active.split_off(to_retire_end);
        self.active = remaining;
        for bp in self.active.iter_mut() {
            if let Some(&mapped) = permute.get(&bp.prev_bp) {
                bp.prev_bp = mapped;
            }
            if bp.prev_bp >= 0 && bp.prev_bp < new_oldest {
                new_oldest = bp.prev_bp;
            }
        }
        if new_oldest != BpIdx::MAX {
            self.oldest_bp = new_oldest;
        }

        // Step 6: advance active_frame.
        self.active_frame = next_active_frame;
        debug!(
            bptbl = %self.name,
            active_frame = self.active_frame,
            retired = self.retired.len(),
            active = self.active.len(),
            "gc"
        );
    }

    /// Finalize: retire everything but the newest frame (called at end
    /// of utterance). The newest frame is kept as the GC root so its
    /// ancestors stay reachable; nothing depends on it going forward, so
    /// unlike a mid-utterance `push_frame` it is fine for it to remain
    /// un-retired in `active` once GC returns.
    pub fn finalize(&mut self) {
        self.gc(self.n_frame - 1);
        self.commit();
    }

    pub fn is_final(&self) -> bool {
        self.active.is_empty() && self.active_frame >= self.n_frame
    }

    /// First bp index exiting in `frame`, or `end_idx()` if none.
    pub fn ef_idx(&self, frame: i32) -> BpIdx {
        let i = (frame - 0).max(0) as usize;
        *self.ef_idx.get(i).unwrap_or(&self.end_idx())
    }

    pub fn ef_count(&self, frame: i32) -> usize {
        let start = self.ef_idx(frame);
        let end = self.ef_idx(frame + 1);
        (end - start).max(0) as usize
    }

    /// Standard reachability/hypothesis extraction (spec.md §4.1).
    pub fn find_exit(&self, dict: &dyn Dictionary, wid: Option<WordId>) -> BpIdx {
        let mut best: BpIdx = NO_BP;
        let mut best_frame = i32::MIN;
        let mut best_score = WORST_SCORE;
        let iter = self.retired.iter().enumerate().map(|(i, b)| (self.retired_base + i as BpIdx, b)).chain(
            self.active
                .iter()
                .enumerate()
                .map(|(i, b)| (self.retired_idx() + i as BpIdx, b)),
        );
        for (idx, bp) in iter {
            if !bp.valid {
                continue;
            }
            if let Some(w) = wid {
                if dict.base_wid(bp.wid) != dict.base_wid(w) {
                    continue;
                }
            }
            if bp.frame > best_frame || (bp.frame == best_frame && bp.score > best_score) {
                best_frame = bp.frame;
                best_score = bp.score;
                best = idx;
            }
        }
        best
    }

    /// Backtrace a chain of bps from `bp` to the start, oldest first.
    pub fn backtrace(&self, bp: BpIdx) -> Vec<BpIdx> {
        let mut out = Vec::new();
        let mut cur = bp;
        while cur != NO_BP {
            out.push(cur);
            cur = self.get(cur).prev_bp;
        }
        out.reverse();
        out
    }

    pub fn oldest_bp(&self) -> BpIdx {
        self.oldest_bp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TinyDict;

    #[test]
    fn enter_and_commit_roundtrip() {
        let dict = TinyDict::new();
        let mut bpt = BackPointerTable::new("test");
        let w = dict.wid_by_name("go").unwrap();
        let idx = bpt.enter(&dict, w, NO_BP, -100, 0, 1);
        assert_eq!(idx, 0);
        assert_eq!(bpt.get(idx).score, -100);
        bpt.commit();
        assert_eq!(bpt.end_idx(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let dict = TinyDict::new();
        let mut bpt = BackPointerTable::new("test");
        let w = dict.wid_by_name("go").unwrap();
        bpt.enter(&dict, w, NO_BP, -1, 0, 1);
        bpt.commit();
        bpt.push_frame(NO_BP);
        bpt.enter(&dict, w, 0, -2, 0, 1);
        bpt.commit();
        bpt.push_frame(1);
        bpt.finalize();
        let before = bpt.retired.len();
        bpt.release(1);
        let after_first = bpt.retired.len();
        bpt.release(1);
        let after_second = bpt.retired.len();
        assert!(after_first <= before);
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn gc_retains_only_reachable_bps() {
        let dict = TinyDict::new();
        let mut bpt = BackPointerTable::new("test");
        let w = dict.wid_by_name("go").unwrap();
        // frame 0: two competing exits, only one is ever referenced.
        let good = bpt.enter(&dict, w, NO_BP, -1, 0, 1);
        let _dead = bpt.enter(&dict, w, NO_BP, -5, 0, 1);
        bpt.commit();
        bpt.push_frame(NO_BP);
        let _child = bpt.enter(&dict, w, good, -2, 0, 1);
        bpt.commit();
        bpt.push_frame(bpt.active_idx());
        bpt.finalize();
        // After finalize, backtracing from the last entry must resolve.
        let last = bpt.end_idx() - 1;
        let path = bpt.backtrace(last);
        assert!(!path.is_empty());
        for &idx in &path {
            assert!(bpt.get(idx).valid || idx < bpt.retired_idx());
        }
    }
}
