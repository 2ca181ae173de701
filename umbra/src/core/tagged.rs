/// Custom Tagged Values — Immediates Beyond Plain Integers
///
/// Custom tagged values reserve 8 more bits after the domain tag for a
/// _phylum_ tag, leaving 48 bits of payload:
///
///   63                   11        3   0
///   [      payload       ] [phylum] [100]
///
/// Booleans, null, the internal `nothing` sentinel, flag sets, relations,
/// dispatch scores, stage offsets, derived-object anchors, hash codes and
/// the zap markers all live here. None of them require heap allocation and
/// all of them can be compile-time constants.

use crate::core::value::{Domain, Value, DOMAIN_TAG_SIZE};

pub const PHYLUM_TAG_SIZE: u64 = 8;
pub const PHYLUM_TAG_MASK: u64 = (1 << PHYLUM_TAG_SIZE) - 1;

/// Payload width: 64 − 3 (domain) − 8 (phylum) rounded down to 32 + 16.
pub const CUSTOM_TAGGED_PAYLOAD_SIZE: u64 = 48;

const PAYLOAD_SHIFT: u64 = DOMAIN_TAG_SIZE + PHYLUM_TAG_SIZE;

// ---------------------------------------------------------------------------
// Phyla
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phylum {
    AsciiCharacter      = 0,
    Boolean             = 1,
    FlagSet             = 2,
    Float32             = 3,
    Nothing             = 4,
    Null                = 5,
    PromiseState        = 6,
    Relation            = 7,
    Score               = 8,
    StageOffset         = 9,
    DerivedObjectAnchor = 10,
    HashCode            = 11,
    UnusedMemory        = 148,
    AllocatedMemory     = 150,
    FreedMemory         = 152,
}

impl Phylum {
    pub fn name(self) -> &'static str {
        match self {
            Phylum::AsciiCharacter      => "AsciiCharacter",
            Phylum::Boolean             => "Boolean",
            Phylum::FlagSet             => "FlagSet",
            Phylum::Float32             => "Float32",
            Phylum::Nothing             => "Nothing",
            Phylum::Null                => "Null",
            Phylum::PromiseState        => "PromiseState",
            Phylum::Relation            => "Relation",
            Phylum::Score               => "Score",
            Phylum::StageOffset         => "StageOffset",
            Phylum::DerivedObjectAnchor => "DerivedObjectAnchor",
            Phylum::HashCode            => "HashCode",
            Phylum::UnusedMemory        => "UnusedMemory",
            Phylum::AllocatedMemory     => "AllocatedMemory",
            Phylum::FreedMemory         => "FreedMemory",
        }
    }

    /// Sort ordinal for phyla that support ordered comparison.
    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

#[inline]
pub fn fits_as_custom_tagged_payload(value: i64) -> bool {
    let shift = 64 - CUSTOM_TAGGED_PAYLOAD_SIZE;
    ((value << shift) >> shift) == value
}

#[inline]
pub const fn new_custom_tagged(phylum: Phylum, payload: i64) -> Value {
    Value::from_raw(
        ((payload as u64) << PAYLOAD_SHIFT)
            | ((phylum as u64) << DOMAIN_TAG_SIZE)
            | Domain::CustomTagged as u64,
    )
}

#[inline]
pub fn get_phylum(value: Value) -> Phylum {
    debug_assert!(value.is_custom_tagged());
    match (value.raw() >> DOMAIN_TAG_SIZE) & PHYLUM_TAG_MASK {
        0   => Phylum::AsciiCharacter,
        1   => Phylum::Boolean,
        2   => Phylum::FlagSet,
        3   => Phylum::Float32,
        4   => Phylum::Nothing,
        5   => Phylum::Null,
        6   => Phylum::PromiseState,
        7   => Phylum::Relation,
        8   => Phylum::Score,
        9   => Phylum::StageOffset,
        10  => Phylum::DerivedObjectAnchor,
        11  => Phylum::HashCode,
        148 => Phylum::UnusedMemory,
        150 => Phylum::AllocatedMemory,
        _   => Phylum::FreedMemory,
    }
}

/// Returns the sign-extended 48-bit payload.
#[inline]
pub fn get_payload(value: Value) -> i64 {
    debug_assert!(value.is_custom_tagged());
    (value.raw() as i64) >> PAYLOAD_SHIFT
}

#[inline]
pub fn in_phylum(phylum: Phylum, value: Value) -> bool {
    value.is_custom_tagged() && get_phylum(value) == phylum
}

// ---------------------------------------------------------------------------
// Singletons
// ---------------------------------------------------------------------------

/// The surface-language null value.
pub const fn null() -> Value {
    new_custom_tagged(Phylum::Null, 0)
}

/// The internal absence sentinel. Distinct from null and from any condition;
/// never visible to the surface language.
pub const fn nothing() -> Value {
    new_custom_tagged(Phylum::Nothing, 0)
}

#[inline]
pub fn is_null(value: Value) -> bool {
    value == null()
}

#[inline]
pub fn is_nothing(value: Value) -> bool {
    value == nothing()
}

// ---------------------------------------------------------------------------
// Booleans
// ---------------------------------------------------------------------------

pub const fn yes() -> Value {
    new_custom_tagged(Phylum::Boolean, 1)
}

pub const fn no() -> Value {
    new_custom_tagged(Phylum::Boolean, 0)
}

#[inline]
pub fn new_boolean(value: bool) -> Value {
    if value { yes() } else { no() }
}

#[inline]
pub fn get_boolean_value(value: Value) -> bool {
    debug_assert!(in_phylum(Phylum::Boolean, value));
    get_payload(value) != 0
}

// ---------------------------------------------------------------------------
// Ascii characters and 32-bit floats
// ---------------------------------------------------------------------------

#[inline]
pub fn new_ascii_character(ch: u8) -> Value {
    new_custom_tagged(Phylum::AsciiCharacter, ch as i64)
}

#[inline]
pub fn get_ascii_character_value(value: Value) -> u8 {
    debug_assert!(in_phylum(Phylum::AsciiCharacter, value));
    get_payload(value) as u8
}

#[inline]
pub fn new_float_32(value: f32) -> Value {
    new_custom_tagged(Phylum::Float32, value.to_bits() as i64)
}

#[inline]
pub fn get_float_32_value(value: Value) -> f32 {
    debug_assert!(in_phylum(Phylum::Float32, value));
    f32::from_bits(get_payload(value) as u32)
}

// ---------------------------------------------------------------------------
// Flag sets
// ---------------------------------------------------------------------------

/// A 48-bit bitset stored as an immediate.
#[inline]
pub fn new_flag_set(flags: u64) -> Value {
    new_custom_tagged(Phylum::FlagSet, flags as i64)
}

pub const FLAG_SET_ALL_OFF: u64 = 0;

/// True iff any of the given flags are set; the typical call passes one flag.
#[inline]
pub fn get_flag_set_at(value: Value, flags: u64) -> bool {
    debug_assert!(in_phylum(Phylum::FlagSet, value));
    (get_payload(value) as u64) & flags != 0
}

#[inline]
pub fn enable_flag_set_flags(value: Value, flags: u64) -> Value {
    debug_assert!(in_phylum(Phylum::FlagSet, value));
    new_flag_set((get_payload(value) as u64) | flags)
}

#[inline]
pub fn disable_flag_set_flags(value: Value, flags: u64) -> Value {
    debug_assert!(in_phylum(Phylum::FlagSet, value));
    new_flag_set((get_payload(value) as u64) & !flags)
}

#[inline]
pub fn is_flag_set_empty(value: Value) -> bool {
    get_payload(value) == 0
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

/// Result of an ordered comparison, encoded as a 2-bit-per-outcome mask so
/// that "less than or equal" style queries are a single bit test.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    LessThan    = 0x1,
    Equal       = 0x2,
    GreaterThan = 0x4,
    Unordered   = 0x8,
}

#[inline]
pub fn new_relation(relation: Relation) -> Value {
    new_custom_tagged(Phylum::Relation, relation as i64)
}

#[inline]
pub fn get_relation(value: Value) -> Relation {
    debug_assert!(in_phylum(Phylum::Relation, value));
    match get_payload(value) {
        0x1 => Relation::LessThan,
        0x2 => Relation::Equal,
        0x4 => Relation::GreaterThan,
        _   => Relation::Unordered,
    }
}

/// Maps a signed comparison result to a relation value.
#[inline]
pub fn relation_of(ordering: std::cmp::Ordering) -> Value {
    match ordering {
        std::cmp::Ordering::Less    => new_relation(Relation::LessThan),
        std::cmp::Ordering::Equal   => new_relation(Relation::Equal),
        std::cmp::Ordering::Greater => new_relation(Relation::GreaterThan),
    }
}

#[inline]
pub fn test_relation(value: Value, mask: u64) -> bool {
    debug_assert!(in_phylum(Phylum::Relation, value));
    (get_payload(value) as u64) & mask != 0
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

/// How well a guard matched. Categories compare before subscores and the
/// encoding is arranged so that a smaller raw word is a better score, which
/// makes comparison a single unsigned compare.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreCategory {
    Eq    = 0,
    Is    = 1,
    Extra = 2,
    Any   = 3,
    None  = 4,
}

pub const SCORE_SUBSCORE_WIDTH: u64 = 32;

#[inline]
pub fn new_score(category: ScoreCategory, subscore: u32) -> Value {
    new_custom_tagged(
        Phylum::Score,
        (((category as u64) << SCORE_SUBSCORE_WIDTH) | subscore as u64) as i64,
    )
}

#[inline]
pub fn get_score_category(score: Value) -> ScoreCategory {
    debug_assert!(in_phylum(Phylum::Score, score));
    match (get_payload(score) as u64) >> SCORE_SUBSCORE_WIDTH {
        0 => ScoreCategory::Eq,
        1 => ScoreCategory::Is,
        2 => ScoreCategory::Extra,
        3 => ScoreCategory::Any,
        _ => ScoreCategory::None,
    }
}

#[inline]
pub fn get_score_subscore(score: Value) -> u32 {
    debug_assert!(in_phylum(Phylum::Score, score));
    get_payload(score) as u32
}

/// True if a is a better score than b.
#[inline]
pub fn is_score_better(a: Value, b: Value) -> bool {
    a.raw() < b.raw()
}

/// True if the score counts as a match at all.
#[inline]
pub fn is_score_match(score: Value) -> bool {
    is_score_better(score, new_score(ScoreCategory::None, 0))
}

pub fn new_identity_match_score() -> Value {
    new_score(ScoreCategory::Eq, 0)
}

pub fn new_perfect_is_match_score() -> Value {
    new_score(ScoreCategory::Is, 0)
}

pub fn new_any_match_score() -> Value {
    new_score(ScoreCategory::Any, 0)
}

pub fn new_extra_match_score() -> Value {
    new_score(ScoreCategory::Extra, 0)
}

pub fn new_no_match_score() -> Value {
    new_score(ScoreCategory::None, 0)
}

// ---------------------------------------------------------------------------
// Stage offsets
// ---------------------------------------------------------------------------

/// A signed stage index: 0 = runtime stage, −1 = its predecessor, etc.
#[inline]
pub fn new_stage_offset(stage: i32) -> Value {
    new_custom_tagged(Phylum::StageOffset, stage as i64)
}

#[inline]
pub fn get_stage_offset_value(value: Value) -> i32 {
    debug_assert!(in_phylum(Phylum::StageOffset, value));
    get_payload(value) as i32
}

/// Adds two stage offsets; import shifts by −1 compose this way.
#[inline]
pub fn add_stage_offsets(a: Value, b: Value) -> Value {
    new_stage_offset(get_stage_offset_value(a) + get_stage_offset_value(b))
}

// ---------------------------------------------------------------------------
// Derived object anchors
// ---------------------------------------------------------------------------

/// Number of bits used for the genus; the rest of the payload is the byte
/// offset of the anchor within its host. The limit this puts on host size is
/// hard to change so the genus stays at 6 bits.
pub const GENUS_TAG_SIZE: u64 = 6;
pub const GENUS_TAG_MASK: u64 = (1 << GENUS_TAG_SIZE) - 1;

#[inline]
pub fn new_derived_object_anchor(genus: u8, host_offset: usize) -> Value {
    new_custom_tagged(
        Phylum::DerivedObjectAnchor,
        (((host_offset as u64) << GENUS_TAG_SIZE) | genus as u64) as i64,
    )
}

#[inline]
pub fn get_anchor_genus_raw(anchor: Value) -> u8 {
    debug_assert!(in_phylum(Phylum::DerivedObjectAnchor, anchor));
    ((get_payload(anchor) as u64) & GENUS_TAG_MASK) as u8
}

#[inline]
pub fn get_anchor_host_offset(anchor: Value) -> usize {
    debug_assert!(in_phylum(Phylum::DerivedObjectAnchor, anchor));
    ((get_payload(anchor) as u64) >> GENUS_TAG_SIZE) as usize
}

// ---------------------------------------------------------------------------
// Hash codes and promise states
// ---------------------------------------------------------------------------

#[inline]
pub fn new_hash_code(bits: u64) -> Value {
    new_custom_tagged(Phylum::HashCode, (bits & ((1 << 48) - 1)) as i64)
}

#[inline]
pub fn get_hash_code_value(value: Value) -> u64 {
    debug_assert!(in_phylum(Phylum::HashCode, value));
    (get_payload(value) as u64) & ((1 << 48) - 1)
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending   = 0,
    Fulfilled = 1,
    Rejected  = 2,
}

#[inline]
pub fn new_promise_state(state: PromiseState) -> Value {
    new_custom_tagged(Phylum::PromiseState, state as i64)
}

#[inline]
pub fn get_promise_state(value: Value) -> PromiseState {
    debug_assert!(in_phylum(Phylum::PromiseState, value));
    match get_payload(value) {
        0 => PromiseState::Pending,
        1 => PromiseState::Fulfilled,
        _ => PromiseState::Rejected,
    }
}

// ---------------------------------------------------------------------------
// Zap markers
// ---------------------------------------------------------------------------

/// Markers written over memory so that stale accesses read as recognizably
/// wrong values instead of silently plausible ones. The payload records the
/// word offset at which the marker was written.
#[inline]
pub fn new_unused_memory(offset: usize) -> Value {
    new_custom_tagged(Phylum::UnusedMemory, offset as i64)
}

#[inline]
pub fn new_allocated_memory(offset: usize) -> Value {
    new_custom_tagged(Phylum::AllocatedMemory, offset as i64)
}

#[inline]
pub fn new_freed_memory(offset: usize) -> Value {
    new_custom_tagged(Phylum::FreedMemory, offset as i64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_distinct() {
        assert_ne!(null(), nothing());
        assert_ne!(null(), no());
        assert_ne!(nothing(), no());
        assert!(is_null(null()));
        assert!(is_nothing(nothing()));
        assert!(!is_null(nothing()));
    }

    #[test]
    fn test_boolean_payload() {
        assert!(get_boolean_value(yes()));
        assert!(!get_boolean_value(no()));
        assert_eq!(new_boolean(true), yes());
    }

    #[test]
    fn test_payload_sign_extension() {
        let v = new_stage_offset(-3);
        assert_eq!(get_stage_offset_value(v), -3);
        assert_eq!(get_payload(v), -3);
    }

    #[test]
    fn test_float_32_roundtrip() {
        for &f in &[0.0f32, 1.5, -2.25, f32::MAX] {
            assert_eq!(get_float_32_value(new_float_32(f)), f);
        }
    }

    #[test]
    fn test_flag_set_ops() {
        let flags = new_flag_set(0);
        assert!(is_flag_set_empty(flags));
        let flags = enable_flag_set_flags(flags, 0x5);
        assert!(get_flag_set_at(flags, 0x1));
        assert!(get_flag_set_at(flags, 0x4));
        assert!(!get_flag_set_at(flags, 0x2));
        let flags = disable_flag_set_flags(flags, 0x1);
        assert!(!get_flag_set_at(flags, 0x1));
    }

    #[test]
    fn test_score_ordering() {
        let eq = new_score(ScoreCategory::Eq, 0);
        let is0 = new_score(ScoreCategory::Is, 0);
        let is3 = new_score(ScoreCategory::Is, 3);
        let any = new_score(ScoreCategory::Any, 0);
        let none = new_no_match_score();
        assert!(is_score_better(eq, is0));
        assert!(is_score_better(is0, is3));
        assert!(is_score_better(is3, any));
        assert!(is_score_better(any, none));
        assert!(is_score_match(any));
        assert!(!is_score_match(none));
    }

    #[test]
    fn test_anchor_roundtrip() {
        let anchor = new_derived_object_anchor(3, 4096);
        assert_eq!(get_anchor_genus_raw(anchor), 3);
        assert_eq!(get_anchor_host_offset(anchor), 4096);
    }

    #[test]
    fn test_hash_code_masked() {
        let h = new_hash_code(u64::MAX);
        assert_eq!(get_hash_code_value(h), (1 << 48) - 1);
    }
}
