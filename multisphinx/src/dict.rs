//! Dictionary contract (search.md §6).
//!
//! The dictionary and its phonetic-context tables (`dict2pid`) are
//! external collaborators: their on-disk format and construction are out
//! of scope here (search.md §1). What the search passes need is the
//! query surface, expressed as traits so tests can supply a small
//! in-memory dictionary (see [`crate::testutil`]).

use std::fmt;

/// Dense dictionary word id.
///
/// Unlike the teacher's `WordId` (which packs a dictionary-source nibble
/// into the high bits to distinguish system/user/OOV dictionaries),
/// multisphinx has exactly one dictionary and no OOV words, so `WordId`
/// is a plain newtype -- there is nothing to pack.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct WordId(pub u32);

impl WordId {
    pub const fn new(id: u32) -> Self {
        WordId(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

impl fmt::Display for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phone id within the acoustic model's phone set. `NO_PHONE` marks "not
/// applicable" (e.g. `second_phone` of a single-phone word).
pub type PhoneId = i16;
pub const NO_PHONE: PhoneId = -1;

/// Dictionary query surface (search.md §6).
pub trait Dictionary: Send + Sync {
    /// Number of words, including pronunciation alternates.
    fn n_words(&self) -> usize;

    /// Map a pronunciation alternate to its base word id. Base words map
    /// to themselves.
    fn base_wid(&self, w: WordId) -> WordId;

    /// Number of phones in the word's pronunciation.
    fn pronlen(&self, w: WordId) -> usize;

    fn first_phone(&self, w: WordId) -> PhoneId;
    fn second_phone(&self, w: WordId) -> PhoneId;
    fn last_phone(&self, w: WordId) -> PhoneId;
    fn second_last_phone(&self, w: WordId) -> PhoneId;

    fn is_single_phone(&self, w: WordId) -> bool {
        self.pronlen(w) <= 1
    }

    fn is_filler(&self, w: WordId) -> bool;
    fn silence_wid(&self) -> WordId;
    fn start_wid(&self) -> WordId;
    fn finish_wid(&self) -> WordId;

    /// Look up a word by its surface name, if present.
    fn wid_by_name(&self, name: &str) -> Option<WordId>;

    fn word_str(&self, w: WordId) -> &str;
}

/// Triphone right-context senone-sequence table (search.md §6's `dict2pid`).
///
/// For a word ending in `last_phone` with the preceding phone
/// `second_last_phone`, `rc_fanout` gives the number of distinct
/// right-context senone sequences a following word's first phone can
/// select -- this is the fan-out bptbl's `enter` allocates `rc` deltas
/// for (search.md §4.1).
pub trait Dict2Pid: Send + Sync {
    /// Number of distinct right contexts for a word ending in
    /// `(second_last_phone, last_phone)`. Zero for single-phone words.
    fn rc_fanout(&self, last_phone: PhoneId, second_last_phone: PhoneId) -> usize;

    /// Map a following word's first phone to a right-context slot index
    /// in `[0, rc_fanout(last_phone, second_last_phone))`.
    fn rc_index(&self, last_phone: PhoneId, second_last_phone: PhoneId, next_first_phone: PhoneId) -> usize;

    /// Word-internal triphone id for a phone at `pos` within `w`'s
    /// pronunciation, used to pick the senone sequence for the HMMs fed
    /// by search passes. Opaque to this crate beyond equality/ordering.
    fn internal_triphone(&self, w: WordId, pos: usize) -> i32;
}
