/// Tagged Value Representation — One Machine Word Per Value
///
/// Every runtime value is a 64-bit word. The low three bits carry the
/// _domain_ tag, the remaining 61 bits the payload:
///
///   63                                            3   0
///   [                   payload                   ] [D]
///
///   000 = Integer        61-bit signed, stored shifted, sign-extended on read
///   001 = HeapObject     aligned address + 1
///   010 = Condition      out-of-band outcome: 8-bit cause + 32-bit detail
///   011 = MovedObject    forwarded heap address + 3 (gc only)
///   100 = CustomTagged   8-bit phylum + 48-bit payload
///   101 = DerivedObject  interior address + 5
///
/// Heap addresses are aligned modulo 8 so the three tag bits are free.
/// Conditions never live in the heap; fallible operations return
/// `Result<Value, Condition>` so the type system enforces that.

use std::fmt;

/// Number of bits used for the domain tag.
pub const DOMAIN_TAG_SIZE: u64 = 3;
pub const DOMAIN_TAG_MASK: u64 = (1 << DOMAIN_TAG_SIZE) - 1;

/// Size in bytes of one value word; heap object alignment.
pub const VALUE_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Integer       = 0,
    HeapObject    = 1,
    Condition     = 2,
    MovedObject   = 3,
    CustomTagged  = 4,
    DerivedObject = 5,
}

impl Domain {
    pub fn name(self) -> &'static str {
        match self {
            Domain::Integer       => "Integer",
            Domain::HeapObject    => "HeapObject",
            Domain::Condition     => "Condition",
            Domain::MovedObject   => "MovedObject",
            Domain::CustomTagged  => "CustomTagged",
            Domain::DerivedObject => "DerivedObject",
        }
    }

    /// Sort ordinal. Heap objects sort first so that key objects can come
    /// before all other values in sorted tag order.
    pub fn ordinal(self) -> u32 {
        match self {
            Domain::HeapObject    => 0,
            Domain::Integer       => 1,
            Domain::Condition     => 2,
            Domain::MovedObject   => 3,
            Domain::CustomTagged  => 4,
            Domain::DerivedObject => 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A tagged runtime value. Identity (`==`) is bitwise equality of the word;
/// two distinct strings with equal contents are *not* the same value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    #[inline]
    pub const fn from_raw(raw: u64) -> Value {
        Value(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn domain(self) -> Domain {
        match self.0 & DOMAIN_TAG_MASK {
            0 => Domain::Integer,
            1 => Domain::HeapObject,
            2 => Domain::Condition,
            3 => Domain::MovedObject,
            4 => Domain::CustomTagged,
            _ => Domain::DerivedObject,
        }
    }

    // ── Integers ─────────────────────────────────────────────────────────────

    /// True if the value survives the 3-bit shift, that is if the four most
    /// significant bits are all equal to the sign bit.
    #[inline]
    pub fn fits_as_integer(value: i64) -> bool {
        (value as u64).wrapping_add(0x1000_0000_0000_0000) < 0x2000_0000_0000_0000
    }

    #[inline]
    pub fn new_integer(value: i64) -> Value {
        debug_assert!(Value::fits_as_integer(value), "integer overflow in tag");
        Value(((value << DOMAIN_TAG_SIZE) as u64) | Domain::Integer as u64)
    }

    #[inline]
    pub fn as_integer(self) -> i64 {
        debug_assert_eq!(self.domain(), Domain::Integer);
        (self.0 as i64) >> DOMAIN_TAG_SIZE
    }

    #[inline]
    pub fn is_integer(self) -> bool {
        self.0 & DOMAIN_TAG_MASK == Domain::Integer as u64
    }

    /// An arbitrary non-condition value for callers that only care about
    /// success.
    #[inline]
    pub fn success() -> Value {
        Value::new_integer(0)
    }

    /// An arbitrary non-condition value whose concrete identity must not be
    /// depended on.
    #[inline]
    pub fn whatever() -> Value {
        Value::new_integer(1)
    }

    // ── Heap objects ─────────────────────────────────────────────────────────

    #[inline]
    pub fn new_heap_object(addr: usize) -> Value {
        debug_assert_eq!(addr % VALUE_SIZE, 0, "unaligned heap address");
        Value(addr as u64 + Domain::HeapObject as u64)
    }

    #[inline]
    pub fn heap_object_address(self) -> usize {
        debug_assert_eq!(self.domain(), Domain::HeapObject);
        (self.0 - Domain::HeapObject as u64) as usize
    }

    #[inline]
    pub fn is_heap_object(self) -> bool {
        self.0 & DOMAIN_TAG_MASK == Domain::HeapObject as u64
    }

    // ── Moved objects ────────────────────────────────────────────────────────

    /// Forward marker installed in an object header during gc. Tagged
    /// differently from a plain heap pointer so the collector can tell a
    /// moved object from one still awaiting migration.
    #[inline]
    pub fn new_moved_object(target: Value) -> Value {
        debug_assert_eq!(target.domain(), Domain::HeapObject);
        Value(target.0 + (Domain::MovedObject as u64 - Domain::HeapObject as u64))
    }

    #[inline]
    pub fn moved_object_target(self) -> Value {
        debug_assert_eq!(self.domain(), Domain::MovedObject);
        Value(self.0 - (Domain::MovedObject as u64 - Domain::HeapObject as u64))
    }

    #[inline]
    pub fn is_moved_object(self) -> bool {
        self.0 & DOMAIN_TAG_MASK == Domain::MovedObject as u64
    }

    /// Follows a forward pointer if there is one. Only meaningful during gc
    /// when the object graph is inconsistent.
    #[inline]
    pub fn chase_moved_object(self) -> Value {
        if self.is_moved_object() {
            self.moved_object_target()
        } else {
            self
        }
    }

    // ── Custom tagged ────────────────────────────────────────────────────────

    #[inline]
    pub fn is_custom_tagged(self) -> bool {
        self.0 & DOMAIN_TAG_MASK == Domain::CustomTagged as u64
    }

    // ── Derived objects ──────────────────────────────────────────────────────

    #[inline]
    pub fn new_derived_object(anchor_addr: usize) -> Value {
        debug_assert_eq!(anchor_addr % VALUE_SIZE, 0, "unaligned derived address");
        Value(anchor_addr as u64 + Domain::DerivedObject as u64)
    }

    #[inline]
    pub fn derived_object_anchor_address(self) -> usize {
        debug_assert_eq!(self.domain(), Domain::DerivedObject);
        (self.0 - Domain::DerivedObject as u64) as usize
    }

    #[inline]
    pub fn is_derived_object(self) -> bool {
        self.0 & DOMAIN_TAG_MASK == Domain::DerivedObject as u64
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.domain() {
            Domain::Integer       => write!(f, "Int({})", self.as_integer()),
            Domain::HeapObject    => write!(f, "Obj@{:#x}", self.heap_object_address()),
            Domain::Condition     => write!(f, "Cond({:#x})", self.0),
            Domain::MovedObject   => write!(f, "Moved@{:#x}", self.0 - 3),
            Domain::CustomTagged  => write!(f, "Tagged({:#x})", self.0),
            Domain::DerivedObject => {
                write!(f, "Derived@{:#x}", self.derived_object_anchor_address())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Cause of a condition. A closed enumeration; the detail word carries
/// cause-specific extra state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCause {
    Circular          = 0,
    ForceValidate     = 1,
    HeapExhausted     = 2,
    InvalidInput      = 3,
    InvalidModeChange = 4,
    InvalidSyntax     = 5,
    LookupError       = 6,
    MapFull           = 7,
    NotDeepFrozen     = 8,
    NotFound          = 9,
    Nothing           = 17,
    OutOfBounds       = 10,
    OutOfMemory       = 11,
    Signal            = 12,
    SystemError       = 13,
    UnknownBuiltin    = 14,
    ValidationFailed  = 15,
    Wat               = 16,
}

impl ConditionCause {
    pub fn name(self) -> &'static str {
        match self {
            ConditionCause::Circular          => "Circular",
            ConditionCause::ForceValidate     => "ForceValidate",
            ConditionCause::HeapExhausted     => "HeapExhausted",
            ConditionCause::InvalidInput      => "InvalidInput",
            ConditionCause::InvalidModeChange => "InvalidModeChange",
            ConditionCause::InvalidSyntax     => "InvalidSyntax",
            ConditionCause::LookupError       => "LookupError",
            ConditionCause::MapFull           => "MapFull",
            ConditionCause::NotDeepFrozen     => "NotDeepFrozen",
            ConditionCause::NotFound          => "NotFound",
            ConditionCause::Nothing           => "Nothing",
            ConditionCause::OutOfBounds       => "OutOfBounds",
            ConditionCause::OutOfMemory       => "OutOfMemory",
            ConditionCause::Signal            => "Signal",
            ConditionCause::SystemError       => "SystemError",
            ConditionCause::UnknownBuiltin    => "UnknownBuiltin",
            ConditionCause::ValidationFailed  => "ValidationFailed",
            ConditionCause::Wat               => "Wat",
        }
    }

    fn from_raw(raw: u8) -> ConditionCause {
        match raw {
            0  => ConditionCause::Circular,
            1  => ConditionCause::ForceValidate,
            2  => ConditionCause::HeapExhausted,
            3  => ConditionCause::InvalidInput,
            4  => ConditionCause::InvalidModeChange,
            5  => ConditionCause::InvalidSyntax,
            6  => ConditionCause::LookupError,
            7  => ConditionCause::MapFull,
            8  => ConditionCause::NotDeepFrozen,
            9  => ConditionCause::NotFound,
            10 => ConditionCause::OutOfBounds,
            11 => ConditionCause::OutOfMemory,
            12 => ConditionCause::Signal,
            13 => ConditionCause::SystemError,
            14 => ConditionCause::UnknownBuiltin,
            15 => ConditionCause::ValidationFailed,
            17 => ConditionCause::Nothing,
            _  => ConditionCause::Wat,
        }
    }
}

/// Kinds of dispatch failure carried in a LookupError condition's detail.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupErrorKind {
    Namespace    = 0,
    MethodLookup = 1,
    Ambiguity    = 2,
}

/// An out-of-band outcome. Encodes as a single word in the Condition domain
/// but rides in the `Err` arm of `Result<Value, Condition>` so it can never
/// be stored in the heap by accident.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Condition(u64);

const CONDITION_CAUSE_SHIFT: u64 = DOMAIN_TAG_SIZE;
const CONDITION_DETAIL_SHIFT: u64 = DOMAIN_TAG_SIZE + 8;

impl Condition {
    #[inline]
    pub fn new(cause: ConditionCause) -> Condition {
        Condition::with_detail(cause, 0)
    }

    #[inline]
    pub fn with_detail(cause: ConditionCause, detail: u32) -> Condition {
        Condition(
            ((detail as u64) << CONDITION_DETAIL_SHIFT)
                | ((cause as u64) << CONDITION_CAUSE_SHIFT)
                | Domain::Condition as u64,
        )
    }

    #[inline]
    pub fn cause(self) -> ConditionCause {
        ConditionCause::from_raw(((self.0 >> CONDITION_CAUSE_SHIFT) & 0xff) as u8)
    }

    #[inline]
    pub fn detail(self) -> u32 {
        (self.0 >> CONDITION_DETAIL_SHIFT) as u32
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn heap_exhausted(size: usize) -> Condition {
        Condition::with_detail(ConditionCause::HeapExhausted, size as u32)
    }

    pub fn not_found() -> Condition {
        Condition::new(ConditionCause::NotFound)
    }

    pub fn out_of_bounds(index: usize) -> Condition {
        Condition::with_detail(ConditionCause::OutOfBounds, index as u32)
    }

    pub fn map_full() -> Condition {
        Condition::new(ConditionCause::MapFull)
    }

    /// A signal that escaped the interpreter; detail records whether it was
    /// raised escaping (as opposed to a continuable signal).
    pub fn signal(is_escape: bool) -> Condition {
        Condition::with_detail(ConditionCause::Signal, is_escape as u32)
    }

    pub fn lookup_error(kind: LookupErrorKind) -> Condition {
        Condition::with_detail(ConditionCause::LookupError, kind as u32)
    }

    pub fn lookup_error_kind(self) -> LookupErrorKind {
        debug_assert_eq!(self.cause(), ConditionCause::LookupError);
        match self.detail() {
            0 => LookupErrorKind::Namespace,
            1 => LookupErrorKind::MethodLookup,
            _ => LookupErrorKind::Ambiguity,
        }
    }

    pub fn force_validate(serial: u64) -> Condition {
        Condition::with_detail(ConditionCause::ForceValidate, serial as u32)
    }

    pub fn validation_failed() -> Condition {
        Condition::new(ConditionCause::ValidationFailed)
    }

    /// A condition with no more specific cause. Internal invariant checks
    /// that trip without a better classification report this.
    pub fn nothing_cause() -> Condition {
        Condition::new(ConditionCause::Nothing)
    }

    pub fn system_error() -> Condition {
        Condition::new(ConditionCause::SystemError)
    }

    pub fn invalid_input() -> Condition {
        Condition::new(ConditionCause::InvalidInput)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%<condition: {}({})>", self.cause().name(), self.detail())
    }
}

/// The pervasive result type: a value or an out-of-band condition.
pub type ValueResult = Result<Value, Condition>;

/// Returns true iff the given result is a condition with the given cause.
#[inline]
pub fn in_condition_cause(cause: ConditionCause, result: &ValueResult) -> bool {
    matches!(result, Err(c) if c.cause() == cause)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_roundtrip() {
        for &k in &[0i64, 1, -1, 42, -42, 1 << 50, -(1 << 50),
                    (1 << 60) - 1, -(1 << 60)] {
            let v = Value::new_integer(k);
            assert_eq!(v.domain(), Domain::Integer);
            assert_eq!(v.as_integer(), k);
        }
    }

    #[test]
    fn test_integer_fit_boundaries() {
        assert!(Value::fits_as_integer((1 << 60) - 1));
        assert!(Value::fits_as_integer(-(1 << 60)));
        assert!(!Value::fits_as_integer(1 << 60));
        assert!(!Value::fits_as_integer(-(1 << 60) - 1));
    }

    #[test]
    fn test_heap_object_roundtrip() {
        for &addr in &[0usize, 8, 1024, 0x7fff_ffff_fff8] {
            let v = Value::new_heap_object(addr);
            assert_eq!(v.domain(), Domain::HeapObject);
            assert_eq!(v.heap_object_address(), addr);
        }
    }

    #[test]
    fn test_moved_object_roundtrip() {
        let obj = Value::new_heap_object(4096);
        let moved = Value::new_moved_object(obj);
        assert_eq!(moved.domain(), Domain::MovedObject);
        assert_eq!(moved.moved_object_target(), obj);
        assert_eq!(moved.chase_moved_object(), obj);
        assert_eq!(obj.chase_moved_object(), obj);
    }

    #[test]
    fn test_domains_disjoint() {
        let values = [
            Value::new_integer(7),
            Value::new_heap_object(64),
            Value::new_moved_object(Value::new_heap_object(64)),
            Value::new_derived_object(128),
        ];
        for (i, a) in values.iter().enumerate() {
            for (j, b) in values.iter().enumerate() {
                if i != j {
                    assert_ne!(a.domain(), b.domain());
                }
            }
        }
    }

    #[test]
    fn test_condition_cause_and_detail() {
        let c = Condition::with_detail(ConditionCause::OutOfBounds, 17);
        assert_eq!(c.cause(), ConditionCause::OutOfBounds);
        assert_eq!(c.detail(), 17);
        assert_eq!(c.raw() & DOMAIN_TAG_MASK, Domain::Condition as u64);
    }

    #[test]
    fn test_nothing_cause_roundtrip() {
        let c = Condition::nothing_cause();
        assert_eq!(c.cause(), ConditionCause::Nothing);
        assert_eq!(c.detail(), 0);
        assert_eq!(ConditionCause::from_raw(ConditionCause::Nothing as u8).name(), "Nothing");
    }

    #[test]
    fn test_lookup_error_kinds() {
        let c = Condition::lookup_error(LookupErrorKind::Ambiguity);
        assert_eq!(c.cause(), ConditionCause::LookupError);
        assert_eq!(c.lookup_error_kind(), LookupErrorKind::Ambiguity);
    }

    #[test]
    fn test_identity_is_bitwise() {
        assert_eq!(Value::new_integer(5), Value::new_integer(5));
        assert_ne!(Value::new_integer(5), Value::new_integer(6));
        assert_ne!(Value::new_integer(8), Value::new_heap_object(64));
    }
}
