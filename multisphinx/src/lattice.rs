//! Lattice storage and HTK-text I/O (spec.md §3, §4.5, §6).
//!
//! A lattice is a node list and a link list; node identity is
//! `(start_frame, lm_state)` so two arcs with the same start frame and
//! the same language-model history collapse onto one node
//! (`examples/original_source/multisphinx/multisphinx/ms_lattice.h`'s
//! `nodeid_map`). The language-model-state side of that identity lives in
//! [`LmStateTable`]; the expansion algorithm that actually walks arcs into
//! nodes/links lives in [`crate::latgen`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{BufRead, Write};

use thiserror::Error;

use crate::dict::{Dictionary, WordId};

pub type NodeIdx = u32;
pub type LinkIdx = u32;

/// Epsilon / fully-backed-off language-model state (spec.md §4.5).
pub const EPSILON_LM_STATE: i32 = -1;

#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("malformed HTK lattice line: {0}")]
    MalformedLine(String),
    #[error("lattice has no start node")]
    NoStartNode,
    #[error("lattice has no end node after finalization")]
    NoEndNode,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Language-model-state trie, flattened to dense integer ids.
///
/// A state is a tuple `(head_word, history_words)`, at most `order`
/// words long, most-recent-first. States are interned by content so
/// `(start_frame, lm_state)` pairs with the same history collapse to the
/// same node (spec.md §4.5). [`EPSILON_LM_STATE`] (`-1`) is the implicit
/// "no history" root and is never actually stored.
pub struct LmStateTable {
    order: usize,
    states: Vec<Vec<WordId>>,
    index: HashMap<Vec<WordId>, i32>,
}

impl LmStateTable {
    pub fn new(order: usize) -> Self {
        LmStateTable {
            order: order.max(1),
            states: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn intern(&mut self, words: Vec<WordId>) -> i32 {
        if words.is_empty() {
            return EPSILON_LM_STATE;
        }
        if let Some(&id) = self.index.get(&words) {
            return id;
        }
        let id = self.states.len() as i32;
        self.index.insert(words.clone(), id);
        self.states.push(words);
        id
    }

    /// Intern a bare single-word state, e.g. the `<s>`-only start state.
    pub fn intern_word(&mut self, w: WordId) -> i32 {
        self.intern(vec![w])
    }

    pub fn words(&self, state: i32) -> &[WordId] {
        if state == EPSILON_LM_STATE {
            &[]
        } else {
            &self.states[state as usize]
        }
    }

    pub fn head(&self, state: i32) -> Option<WordId> {
        self.words(state).first().copied()
    }

    /// History words only (head dropped), most-recent-first, used as the
    /// N-gram lookup context for the *next* word out of this state.
    pub fn history(&self, state: i32) -> Vec<WordId> {
        self.words(state).to_vec()
    }

    /// Rotate `state`'s full word tuple into history and push `new_head`
    /// as the new head, truncating to `order - 1` history words
    /// (spec.md §4.5 step 2: "rotate its head word into the history").
    pub fn advance(&mut self, state: i32, new_head: WordId) -> i32 {
        let mut new_words = vec![new_head];
        new_words.extend(self.words(state).iter().copied().take(self.order.saturating_sub(1)));
        self.intern(new_words)
    }

    /// Drop the oldest (last) history word, keeping the head -- one
    /// back-off step. `None` if there is no history left to drop.
    pub fn backoff(&mut self, state: i32) -> Option<i32> {
        let words = self.words(state);
        if words.len() <= 1 {
            return None;
        }
        let mut shortened = words.to_vec();
        shortened.pop();
        Some(self.intern(shortened))
    }

    pub fn order(&self) -> usize {
        self.order
    }
}

#[derive(Debug, Clone)]
pub struct LatticeNode {
    pub start_frame: i32,
    pub lm_state: i32,
    /// The head word of this state -- the word whose exit created it
    /// (`<s>` for the start node).
    pub wid: WordId,
    pub entries: Vec<LinkIdx>,
    pub exits: Vec<LinkIdx>,
}

#[derive(Debug, Clone)]
pub struct LatticeLink {
    pub src: NodeIdx,
    pub dest: NodeIdx,
    pub wid: WordId,
    pub ascr: i32,
    pub lscr: i32,
    pub alpha: f64,
    pub beta: f64,
}

/// The word graph produced by [`crate::latgen`] (spec.md §3, §4.5).
pub struct Lattice {
    nodes: Vec<LatticeNode>,
    links: Vec<LatticeLink>,
    node_index: HashMap<(i32, i32), NodeIdx>,
    start_node: NodeIdx,
    end_node: Option<NodeIdx>,
    /// Frames per second, used to derive HTK `t=` fields from frame index
    /// (spec.md §6: "Times are derived from `sf / frate`").
    pub frate: f64,
}

impl Lattice {
    pub fn new(frate: f64, start_wid: WordId, start_state: i32) -> Self {
        let mut lat = Lattice {
            nodes: Vec::new(),
            links: Vec::new(),
            node_index: HashMap::new(),
            start_node: 0,
            end_node: None,
            frate,
        };
        lat.start_node = lat.get_or_create_node(0, start_state, start_wid);
        lat
    }

    pub fn start_node(&self) -> NodeIdx {
        self.start_node
    }

    pub fn end_node(&self) -> Option<NodeIdx> {
        self.end_node
    }

    pub fn node(&self, idx: NodeIdx) -> &LatticeNode {
        &self.nodes[idx as usize]
    }

    pub fn link(&self, idx: LinkIdx) -> &LatticeLink {
        &self.links[idx as usize]
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_links(&self) -> usize {
        self.links.len()
    }

    /// Every node whose `start_frame == sf`, i.e. the lattice's notion of
    /// "active source node at src_sf" (spec.md §4.5 step 1).
    pub fn nodes_at(&self, sf: i32) -> Vec<NodeIdx> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.start_frame == sf)
            .map(|(i, _)| i as NodeIdx)
            .collect()
    }

    /// Find or create the node `(start_frame, lm_state)` (spec.md §3:
    /// "Two nodes with the same (start_frame, lm_state) are the same
    /// node").
    pub fn get_or_create_node(&mut self, start_frame: i32, lm_state: i32, wid: WordId) -> NodeIdx {
        if let Some(&idx) = self.node_index.get(&(start_frame, lm_state)) {
            return idx;
        }
        let idx = self.nodes.len() as NodeIdx;
        self.nodes.push(LatticeNode {
            start_frame,
            lm_state,
            wid,
            entries: Vec::new(),
            exits: Vec::new(),
        });
        self.node_index.insert((start_frame, lm_state), idx);
        idx
    }

    pub fn add_link(&mut self, src: NodeIdx, dest: NodeIdx, wid: WordId, ascr: i32, lscr: i32) -> LinkIdx {
        let idx = self.links.len() as LinkIdx;
        self.links.push(LatticeLink {
            src,
            dest,
            wid,
            ascr,
            lscr,
            alpha: 0.0,
            beta: 0.0,
        });
        self.nodes[src as usize].exits.push(idx);
        self.nodes[dest as usize].entries.push(idx);
        idx
    }

    pub fn set_end_node(&mut self, idx: NodeIdx) {
        self.end_node = Some(idx);
    }

    /// Drop links/nodes left dangling after expansion: a non-start node
    /// with zero entries, or a non-final node with zero exits
    /// (spec.md §4.5 "Cleanup"). Iterates to a fixed point since removing
    /// one dangling node can orphan its neighbors.
    pub fn prune_dangling(&mut self) {
        loop {
            let mut dead_links: Vec<LinkIdx> = Vec::new();
            for (i, node) in self.nodes.iter().enumerate() {
                let idx = i as NodeIdx;
                if idx != self.start_node && node.entries.is_empty() {
                    dead_links.extend(node.exits.iter().copied());
                }
                if Some(idx) != self.end_node && !node.exits.is_empty() && node.entries.is_empty() {
                    // already queued via the branch above; avoid double push
                }
                if Some(idx) != self.end_node && node.exits.is_empty() && idx != self.start_node {
                    dead_links.extend(node.entries.iter().copied());
                }
            }
            if dead_links.is_empty() {
                break;
            }
            dead_links.sort_unstable();
            dead_links.dedup();
            for &l in dead_links.iter().rev() {
                self.remove_link(l);
            }
        }
    }

    fn remove_link(&mut self, link: LinkIdx) {
        let l = self.links[link as usize].clone();
        self.nodes[l.src as usize].exits.retain(|&x| x != link);
        self.nodes[l.dest as usize].entries.retain(|&x| x != link);
    }

    /// Forward/backward pass computing posterior link probabilities
    /// (spec.md §4.5 "On EOU ... a forward/backward pass can compute
    /// posterior link probabilities"). Requires a finalized lattice
    /// (end node set) and that nodes are already in topological
    /// (start_frame-monotonic) order, which they are by construction.
    pub fn compute_posteriors(&mut self, lm: &crate::logmath::LogMath) {
        let end = match self.end_node {
            Some(e) => e,
            None => return,
        };
        let n = self.nodes.len();
        let mut alpha = vec![f64::NEG_INFINITY; n];
        alpha[self.start_node as usize] = 0.0;
        let order: Vec<usize> = self.topological_order();
        for &i in &order {
            if alpha[i] == f64::NEG_INFINITY {
                continue;
            }
            let exits = self.nodes[i].exits.clone();
            for link in exits {
                let l = &self.links[link as usize];
                let score = lm.logmath_to_log(l.ascr + l.lscr);
                let cand = alpha[i] + score;
                let d = l.dest as usize;
                alpha[d] = log_add_f64(alpha[d], cand);
            }
        }
        let mut beta = vec![f64::NEG_INFINITY; n];
        beta[end as usize] = 0.0;
        for &i in order.iter().rev() {
            let entries = self.nodes[i].entries.clone();
            for link in entries {
                let l = &self.links[link as usize];
                let score = lm.logmath_to_log(l.ascr + l.lscr);
                let src = l.src as usize;
                let cand = beta[i] + score;
                beta[src] = log_add_f64(beta[src], cand);
            }
        }
        let total = alpha[end as usize];
        for (i, node) in self.nodes.iter().enumerate() {
            for &link in &node.exits {
                let l = &mut self.links[link as usize];
                l.alpha = alpha[i];
            }
        }
        for link in self.links.iter_mut() {
            link.beta = beta[link.dest as usize];
            // posterior (natural-log) = alpha(src) + score + beta(dest) - total
            let score = lm.logmath_to_log(link.ascr + link.lscr);
            link.alpha = alpha[link.src as usize] + score + link.beta - total;
        }
    }

    fn topological_order(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.nodes.len()).collect();
        idx.sort_by_key(|&i| self.nodes[i].start_frame);
        idx
    }

    /// Write an HTK-compatible ASCII lattice (spec.md §6).
    pub fn write_htk(&self, w: &mut impl Write, dict: &dyn Dictionary) -> Result<(), LatticeError> {
        let end = self.end_node.ok_or(LatticeError::NoEndNode)?;
        writeln!(w, "VERSION=1.0")?;
        writeln!(w, "start={}", self.start_node)?;
        writeln!(w, "end={}", end)?;
        writeln!(w, "N={} L={}", self.nodes.len(), self.links.len())?;
        for (i, node) in self.nodes.iter().enumerate() {
            let t = node.start_frame as f64 / self.frate;
            writeln!(w, "I={} t={:.2} W={}", i, t, dict.word_str(node.wid))?;
        }
        for (i, link) in self.links.iter().enumerate() {
            write!(w, "J={} S={} E={} a={}", i, link.src, link.dest, link.ascr)?;
            write!(w, " W={}", dict.word_str(link.wid))?;
            write!(w, " l={}", link.lscr)?;
            if link.alpha != 0.0 || link.beta != 0.0 {
                write!(w, " p={:.6}", link.alpha.exp())?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    /// Read back an HTK-compatible ASCII lattice previously written by
    /// [`Lattice::write_htk`] (spec.md §8 round-trip test). Word names
    /// are resolved back to ids via `dict`.
    pub fn read_htk(r: impl BufRead, dict: &dyn Dictionary, frate: f64) -> Result<Self, LatticeError> {
        let mut start = 0u32;
        let mut end = 0u32;
        let mut node_words: HashMap<u32, (i32, WordId)> = HashMap::new();
        let mut raw_links: Vec<(u32, u32, u32, i32, WordId, i32)> = Vec::new();
        for line in r.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with("VERSION") || line.starts_with("N=") {
                continue;
            }
            if let Some(rest) = line.strip_prefix("start=") {
                start = rest.trim().parse().map_err(|_| LatticeError::MalformedLine(line.to_string()))?;
            } else if let Some(rest) = line.strip_prefix("end=") {
                end = rest.trim().parse().map_err(|_| LatticeError::MalformedLine(line.to_string()))?;
            } else if line.starts_with("I=") {
                let fields = parse_fields(line);
                let i: u32 = fields.get("I").ok_or_else(|| LatticeError::MalformedLine(line.to_string()))?.parse().unwrap();
                let t: f64 = fields.get("t").map(|s| s.parse().unwrap_or(0.0)).unwrap_or(0.0);
                let w = fields.get("W").and_then(|n| dict.wid_by_name(n)).unwrap_or(dict.start_wid());
                node_words.insert(i, ((t * frate).round() as i32, w));
            } else if line.starts_with("J=") {
                let fields = parse_fields(line);
                let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
                let s: u32 = get("S").parse().unwrap_or(0);
                let e: u32 = get("E").parse().unwrap_or(0);
                let a: i32 = get("a").parse().unwrap_or(0);
                let l: i32 = get("l").parse().unwrap_or(0);
                let w = fields.get("W").and_then(|n| dict.wid_by_name(n)).unwrap_or(dict.start_wid());
                raw_links.push((s, e, s, a, w, l));
                let _ = e;
            }
        }
        let (sf, wid) = node_words.get(&start).copied().unwrap_or((0, dict.start_wid()));
        let mut lat = Lattice::new(frate, wid, EPSILON_LM_STATE);
        lat.nodes.clear();
        lat.node_index.clear();
        let mut remap: HashMap<u32, NodeIdx> = HashMap::new();
        for (&orig, &(sf, w)) in node_words.iter() {
            let idx = lat.get_or_create_node(sf, EPSILON_LM_STATE - 1 - orig as i32, w);
            remap.insert(orig, idx);
        }
        for (s, e, _src_orig, a, w, l) in raw_links {
            let src = *remap.get(&s).ok_or_else(|| LatticeError::MalformedLine(format!("link src {}", s)))?;
            let dest = *remap.get(&e).ok_or_else(|| LatticeError::MalformedLine(format!("link dest {}", e)))?;
            lat.add_link(src, dest, w, a, l);
        }
        lat.start_node = *remap.get(&start).ok_or(LatticeError::NoStartNode)?;
        lat.end_node = remap.get(&end).copied();
        Ok(lat)
    }

    /// A DOT visualization (spec.md §6: "a DOT visualization").
    pub fn write_dot(&self, w: &mut impl Write, dict: &dyn Dictionary) -> Result<(), LatticeError> {
        writeln!(w, "digraph lattice {{")?;
        writeln!(w, "  rankdir=LR;")?;
        for (i, node) in self.nodes.iter().enumerate() {
            let mut label = String::new();
            write!(label, "{}@{}", dict.word_str(node.wid), node.start_frame).ok();
            writeln!(w, "  n{} [label=\"{}\"];", i, label)?;
        }
        for link in &self.links {
            writeln!(
                w,
                "  n{} -> n{} [label=\"{} a={} l={}\"];",
                link.src,
                link.dest,
                dict.word_str(link.wid),
                link.ascr,
                link.lscr
            )?;
        }
        writeln!(w, "}}")?;
        Ok(())
    }
}

fn parse_fields(line: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for tok in line.split_whitespace() {
        if let Some((k, v)) = tok.split_once('=') {
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

fn log_add_f64(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (1.0 + (lo - hi).exp()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TinyDict;

    #[test]
    fn node_identity_is_start_frame_and_lm_state() {
        let dict = TinyDict::new();
        let mut lat = Lattice::new(100.0, dict.start_wid(), EPSILON_LM_STATE);
        let a = lat.get_or_create_node(5, 3, dict.start_wid());
        let b = lat.get_or_create_node(5, 3, dict.start_wid());
        assert_eq!(a, b);
        let c = lat.get_or_create_node(5, 4, dict.start_wid());
        assert_ne!(a, c);
    }

    #[test]
    fn prune_dangling_drops_zero_exit_node() {
        let dict = TinyDict::new();
        let go = dict.wid_by_name("go").unwrap();
        let mut lat = Lattice::new(100.0, dict.start_wid(), EPSILON_LM_STATE);
        let start = lat.start_node();
        let dead_end = lat.get_or_create_node(1, 99, go);
        lat.add_link(start, dead_end, go, -1, -1);
        assert_eq!(lat.node(dead_end).exits.len(), 0);
        lat.prune_dangling();
        assert_eq!(lat.node(start).exits.len(), 0);
    }

    #[test]
    fn lm_state_table_advance_and_backoff_roundtrip() {
        let dict = TinyDict::new();
        let a = dict.wid_by_name("a").unwrap();
        let b = dict.wid_by_name("b").unwrap();
        let c = dict.wid_by_name("c").unwrap();
        let mut t = LmStateTable::new(3);
        let s0 = t.intern_word(a);
        let s1 = t.advance(s0, b);
        assert_eq!(t.words(s1), &[b, a]);
        let s2 = t.advance(s1, c);
        assert_eq!(t.words(s2), &[c, b, a]);
        let back = t.backoff(s2).unwrap();
        assert_eq!(t.words(back), &[c, b]);
    }
}
