//! Arc buffer: a bounded, frame-ordered word-arc queue between two
//! search passes (spec.md §4.2).
//!
//! One producer (the upstream pass, sweeping its own [`BackPointerTable`])
//! and one consumer (the downstream pass) share an `ArcBuffer` through
//! `Arc<...>`. Synchronization follows spec.md §5: a mutex over the arc
//! array itself, a "start" one-shot, a "release" counter, and a condvar
//! standing in for the "data available" event -- the condvar/mutex pair
//! is the natural Rust rendering of the original's semaphore trio
//! (`examples/original_source/multisphinx/multisphinx/arc_buffer.h`).

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::bptbl::{BackPointerTable, Bp, NO_RC};
use crate::dict::WordId;

/// Unscored word arc (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arc_ {
    pub wid: WordId,
    pub src_frame: i32,
    pub dest_frame: i32,
}

/// A scored arc: carries the best path score, an approximate language
/// score, and a window into the buffer's right-context delta store.
#[derive(Debug, Clone)]
pub struct ScoredArc {
    pub arc: Arc_,
    pub best_score: i32,
    pub lscr: i32,
    rc_base: usize,
    rc_len: usize,
    /// Right contexts with a non-`NO_RC` delta, in `rc_base` order.
    pub rc_present: Vec<bool>,
}

impl ScoredArc {
    /// Build a scored arc with no right-context delta row, for tests and
    /// consumers (e.g. latgen) that only care about `best_score`/`lscr`.
    pub fn unscored(arc: Arc_, best_score: i32, lscr: i32) -> Self {
        ScoredArc {
            arc,
            best_score,
            lscr,
            rc_base: 0,
            rc_len: 0,
            rc_present: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Idle,
    Running,
    Final,
    Canceled,
}

/// Error returned by blocking arc-buffer calls (spec.md §5, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("arc buffer was cancelled")]
    Cancelled,
    #[error("timed out waiting on arc buffer")]
    Timeout,
}

struct Inner {
    state: BufferState,
    uttid: String,
    arcs: Vec<ScoredArc>,
    /// `sf_idx[f - sf_base]` is the index of the first arc with
    /// `src_frame >= f`.
    sf_idx: Vec<usize>,
    sf_base: i32,
    /// Arcs appended since the last commit, not yet visible to consumers.
    pending: Vec<ScoredArc>,
    rc: Vec<u16>,
    keep_scores: bool,
    active_sf: i32,
    next_sf: i32,
}

/// Bounded frame-ordered arc queue connecting two search passes
/// (spec.md §4.2).
pub struct ArcBuffer {
    name: String,
    inner: Mutex<Inner>,
    data_available: Condvar,
    start: Condvar,
    started: Mutex<bool>,
    release_count: Mutex<usize>,
    release_cv: Condvar,
}

impl ArcBuffer {
    pub fn new(name: impl Into<String>, keep_scores: bool) -> Arc<Self> {
        Arc::new(ArcBuffer {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: BufferState::Idle,
                uttid: String::new(),
                arcs: Vec::new(),
                sf_idx: vec![0],
                sf_base: 0,
                pending: Vec::new(),
                rc: Vec::new(),
                keep_scores,
                active_sf: 0,
                next_sf: 0,
            }),
            data_available: Condvar::new(),
            start: Condvar::new(),
            started: Mutex::new(false),
            release_count: Mutex::new(0),
            release_cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // --- producer side -------------------------------------------------

    pub fn producer_start_utt(&self, uttid: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = BufferState::Running;
            inner.uttid = uttid.to_string();
            inner.arcs.clear();
            inner.pending.clear();
            inner.rc.clear();
            inner.sf_idx = vec![0];
            inner.sf_base = 0;
            inner.active_sf = 0;
            inner.next_sf = 0;
        }
        let mut started = self.started.lock().unwrap();
        *started = true;
        self.start.notify_all();
        debug!(buffer = %self.name, uttid, "producer_start_utt");
    }

    /// Sweep newly retired bps from `source` into the buffer and commit
    /// them. Returns the source-bptbl index that must be preserved for
    /// the next sweep (spec.md §4.2 `producer_sweep`).
    pub fn producer_sweep(&self, source: &mut BackPointerTable, release: bool) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let active_sf = source.active_frame();
        inner.next_sf = active_sf;
        let start_frame = inner.active_sf;
        for frame in start_frame..active_sf {
            let from = source.ef_idx(frame);
            let to = source.ef_idx(frame + 1);
            let mut idx = from;
            while idx < to {
                let bp = source.get(idx).clone();
                if bp.valid {
                    push_arc(&mut inner, source, idx, &bp);
                }
                idx += 1;
            }
        }
        self.commit(&mut inner);
        let preserve = source.active_idx();
        if release {
            source.release(preserve);
        }
        trace!(buffer = %self.name, active_sf, "producer_sweep");
        preserve
    }

    fn commit(&self, inner: &mut Inner) {
        if inner.pending.is_empty() {
            inner.active_sf = inner.next_sf;
            return;
        }
        inner.pending.sort_by_key(|a| a.arc.src_frame);
        let base_idx = inner.arcs.len();
        inner.arcs.append(&mut inner.pending);
        while (inner.sf_idx.len() as i32) <= inner.next_sf - inner.sf_base {
            inner.sf_idx.push(inner.arcs.len());
        }
        // Recompute sf_idx entries covering the newly committed range.
        for (i, idx) in inner.sf_idx.iter_mut().enumerate() {
            let frame = inner.sf_base + i as i32;
            if frame < inner.next_sf {
                continue;
            }
            let pos = inner.arcs[base_idx..]
                .iter()
                .position(|a| a.arc.src_frame >= frame)
                .map(|p| base_idx + p)
                .unwrap_or(inner.arcs.len());
            *idx = pos.max(*idx);
        }
        inner.active_sf = inner.next_sf;
        self.data_available.notify_all();
    }

    /// Final sweep, then mark the buffer FINAL and wait for the consumer
    /// to acknowledge via `consumer_end_utt` (spec.md §4.2
    /// `producer_end_utt`).
    pub fn producer_end_utt(&self, source: &mut BackPointerTable, release: bool) {
        source.finalize();
        self.producer_sweep(source, release);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = BufferState::Final;
            self.data_available.notify_all();
        }
        debug!(buffer = %self.name, "producer_end_utt");
        let mut count = self.release_count.lock().unwrap();
        while *count == 0 {
            count = self.release_cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn producer_shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BufferState::Canceled;
        drop(inner);
        let mut started = self.started.lock().unwrap();
        *started = true;
        self.start.notify_all();
        self.data_available.notify_all();
        debug!(buffer = %self.name, "producer_shutdown");
    }

    pub fn eou(&self) -> bool {
        self.inner.lock().unwrap().state == BufferState::Final
    }

    fn is_canceled(&self) -> bool {
        self.inner.lock().unwrap().state == BufferState::Canceled
    }

    // --- consumer side ---------------------------------------------

    pub fn consumer_start_utt(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        let mut started = self.started.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        while !*started {
            started = match deadline {
                None => self.start.wait(started).unwrap(),
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    let (g, r) = self.start.wait_timeout(started, remaining).unwrap();
                    if r.timed_out() && !*g {
                        return Err(WaitError::Timeout);
                    }
                    g
                }
            };
        }
        *started = false;
        if self.is_canceled() {
            return Err(WaitError::Cancelled);
        }
        Ok(())
    }

    /// Block until new arcs are committed or the buffer becomes FINAL;
    /// returns the first frame whose arcs are not yet available
    /// (spec.md §4.2 `consumer_wait`).
    pub fn consumer_wait(&self, timeout: Option<Duration>) -> Result<i32, WaitError> {
        let mut inner = self.inner.lock().unwrap();
        let start_sf = inner.active_sf;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if inner.state == BufferState::Canceled {
                return Err(WaitError::Cancelled);
            }
            if inner.active_sf > start_sf || inner.state == BufferState::Final {
                return Ok(inner.active_sf);
            }
            inner = match deadline {
                None => self.data_available.wait(inner).unwrap(),
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(WaitError::Timeout);
                    }
                    let (g, r) = self.data_available.wait_timeout(inner, remaining).unwrap();
                    if r.timed_out() {
                        return Err(WaitError::Timeout);
                    }
                    g
                }
            };
        }
    }

    /// Drop arcs with `src_frame < first_sf` (spec.md §4.2
    /// `consumer_release`).
    pub fn consumer_release(&self, first_sf: i32) {
        let mut inner = self.inner.lock().unwrap();
        if first_sf <= inner.sf_base {
            return;
        }
        let cut = first_sf - inner.sf_base;
        let cut_idx = inner
            .sf_idx
            .get(cut as usize)
            .copied()
            .unwrap_or(inner.arcs.len());
        inner.arcs.drain(..cut_idx);
        if (cut as usize) < inner.sf_idx.len() {
            inner.sf_idx.drain(..cut as usize);
        } else {
            inner.sf_idx = vec![inner.arcs.len()];
        }
        inner.sf_base = first_sf;
    }

    pub fn consumer_end_utt(&self) {
        let mut count = self.release_count.lock().unwrap();
        *count += 1;
        self.release_cv.notify_all();
    }

    /// Iterate committed arcs starting at frame `sf`. The returned slice
    /// is only valid while the caller holds no concurrent mutation --
    /// callers should copy what they need before releasing the lock
    /// the way the original's `arc_buffer_lock`/`unlock` pair requires.
    pub fn iter_from(&self, sf: i32) -> Vec<ScoredArc> {
        let inner = self.inner.lock().unwrap();
        let idx = if sf <= inner.sf_base {
            0
        } else {
            inner
                .sf_idx
                .get((sf - inner.sf_base) as usize)
                .copied()
                .unwrap_or(inner.arcs.len())
        };
        inner.arcs[idx..].to_vec()
    }

    pub fn iter_range(&self, sf_start: i32, sf_end: i32) -> Vec<ScoredArc> {
        self.iter_from(sf_start)
            .into_iter()
            .take_while(|a| a.arc.src_frame < sf_end)
            .collect()
    }

    /// `best_score - delta` for a given right context of a scored arc
    /// (spec.md §9: the documented contract, the source's own
    /// `arc_buffer_get_rcscore` comment notwithstanding).
    pub fn rc_score(&self, arc: &ScoredArc, rc: usize) -> Option<i32> {
        let inner = self.inner.lock().unwrap();
        if !inner.keep_scores || rc >= arc.rc_len {
            return None;
        }
        let delta = inner.rc[arc.rc_base + rc];
        if delta == NO_RC {
            None
        } else {
            Some(arc.best_score - delta as i32)
        }
    }

    pub fn max_n_rc(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.arcs.iter().map(|a| a.rc_len).max().unwrap_or(0)
    }
}

fn push_arc(inner: &mut Inner, source: &BackPointerTable, idx: crate::bptbl::BpIdx, bp: &Bp) {
    let (rc_base, rc_len, rc_present) = if inner.keep_scores {
        let n = bp.rc_len;
        let deltas = source.rc_deltas(idx, n);
        let base = inner.rc.len();
        inner.rc.extend_from_slice(deltas);
        let present = deltas.iter().map(|&d| d != NO_RC).collect();
        (base, n, present)
    } else {
        (0, 0, Vec::new())
    };
    // src_frame is the *start* frame of the word, i.e. the frame its
    // predecessor exited in (or 0 if there is no predecessor).
    let src_frame = if bp.prev_bp == crate::bptbl::NO_BP {
        0
    } else {
        source.get(bp.prev_bp).frame
    };
    let sarc = ScoredArc {
        arc: Arc_ {
            wid: bp.wid,
            src_frame,
            dest_frame: bp.frame,
        },
        best_score: bp.score,
        lscr: 0,
        rc_base,
        rc_len,
        rc_present,
    };
    inner.pending.push(sarc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::Dictionary;
    use crate::testutil::TinyDict;
    use std::thread;

    #[test]
    fn sweep_commits_arcs_in_frame_order() {
        let dict = TinyDict::new();
        let w = dict.wid_by_name("go").unwrap();
        let mut bpt = BackPointerTable::new("src");
        let buf = ArcBuffer::new("t", true);
        buf.producer_start_utt("u1");
        let e1 = bpt.enter(&dict, w, crate::bptbl::NO_BP, -1, 0, 1);
        bpt.commit();
        bpt.push_frame(crate::bptbl::NO_BP);
        let _e2 = bpt.enter(&dict, w, e1, -2, 0, 1);
        bpt.commit();
        bpt.push_frame(bpt.active_idx());
        buf.producer_sweep(&mut bpt, false);
        buf.producer_end_utt(&mut bpt, false);
        let arcs = buf.iter_from(0);
        for w in arcs.windows(2) {
            assert!(w[0].arc.src_frame <= w[1].arc.src_frame);
        }
    }

    #[test]
    fn cancellation_unblocks_consumer() {
        let buf = ArcBuffer::new("t", false);
        let buf2 = buf.clone();
        let handle = thread::spawn(move || buf2.consumer_start_utt(None));
        thread::sleep(Duration::from_millis(20));
        buf.producer_shutdown();
        let res = handle.join().unwrap();
        assert_eq!(res, Err(WaitError::Cancelled));
    }
}
