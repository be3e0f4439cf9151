//! Concurrent multi-pass large-vocabulary continuous speech recognition
//! search engine.
//!
//! A decoder pipeline is three cooperating search passes connected by
//! bounded [`arc_buffer`]s: a tree-lexicon pass ([`fwdtree`]) narrows the
//! active vocabulary, a flat-lexicon pass ([`fwdflat`]) refines it with a
//! higher-order language model, and a lattice generator ([`latgen`])
//! expands the survivors into a word graph ([`lattice`]). Each pass
//! records its word exits in its own [`bptbl`].
//!
//! Acoustic scoring, the dictionary, and the language model are external
//! collaborators, expressed here as traits ([`acmod`], [`dict`],
//! [`ngram`]) rather than concrete implementations -- this crate is the
//! search engine, not the front end.

pub mod acmod;
pub mod arc_buffer;
pub mod bptbl;
pub mod config;
pub mod dict;
pub mod error;
pub mod fwdflat;
pub mod fwdtree;
pub mod hmm;
pub mod hyp;
pub mod lattice;
pub mod latgen;
pub mod logmath;
pub mod ngram;
pub mod search_factory;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{MultisphinxError, MultisphinxResult};
    pub use crate::search_factory::Pipeline;
}
