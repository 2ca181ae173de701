/// Methods and Multi-Method Dispatch
///
/// A call site carries _call tags_: a pair array mapping each tag to the
/// stack offset of its argument, sorted by tag. Signatures keep their tags
/// sorted the same way, so matching scans both sequences in lockstep. The
/// sort order puts the subject key first, then the selector key, then other
/// keys by id, then integers, then strings, so the most discriminating tags
/// are compared first.
///
/// Matching scores every argument against its parameter's guard. Overload
/// resolution joins score vectors pairwise; a method wins outright only if
/// it is at least as good everywhere and strictly better somewhere. What
/// remains ambiguous at the end is a lookup error, not a pick.
///
/// Argument maps — parameter index to offset-from-frame-top — are
/// canonicalized through a trie so equal maps are pointer-equal (the
/// interpreter relies on that to share frame metadata).

use crate::core::tagged::{
    get_boolean_value, get_flag_set_at, is_nothing, is_score_better, is_score_match,
    new_any_match_score, new_boolean, new_extra_match_score, new_identity_match_score,
    new_no_match_score, new_score, nothing, ScoreCategory,
};
use crate::core::value::{Condition, LookupErrorKind, Value};
use crate::heap::{get_heap_object_field, heap_object_field_offset, set_heap_object_field, Heap};
use crate::maps::get_id_hash_map_at;
use crate::objects::{
    add_to_array_buffer, get_array_at, get_array_buffer_at, get_array_buffer_length,
    get_array_length, get_pair_array_first_at, get_pair_array_length, get_pair_array_second_at,
    is_pair_array_sorted, set_array_at,
};
use crate::runtime::{Roots, Runtime};
use crate::species::{
    self, value_identity_compare, value_identity_compare_cycle_protect,
    value_transient_identity_hash_cycle_protect, CycleDetector, Family, HashStream, PrintContext,
};
use crate::stack::Frame;

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

pub const SIGNATURE_TAGS_OFFSET: usize = heap_object_field_offset(0);
pub const SIGNATURE_PARAMETER_COUNT_OFFSET: usize = heap_object_field_offset(1);
pub const SIGNATURE_MANDATORY_COUNT_OFFSET: usize = heap_object_field_offset(2);
pub const SIGNATURE_ALLOW_EXTRA_OFFSET: usize = heap_object_field_offset(3);
pub const SIGNATURE_FIELD_COUNT: usize = 4;

/// The sorted pair array of (tag, parameter).
pub fn get_signature_tags(signature: Value) -> Value {
    get_heap_object_field(signature, SIGNATURE_TAGS_OFFSET)
}

pub fn set_signature_tags(signature: Value, tags: Value) {
    set_heap_object_field(signature, SIGNATURE_TAGS_OFFSET, tags);
}

pub fn get_signature_parameter_count(signature: Value) -> usize {
    get_heap_object_field(signature, SIGNATURE_PARAMETER_COUNT_OFFSET).as_integer() as usize
}

pub fn set_signature_parameter_count(signature: Value, count: usize) {
    set_heap_object_field(
        signature,
        SIGNATURE_PARAMETER_COUNT_OFFSET,
        Value::new_integer(count as i64),
    );
}

pub fn get_signature_mandatory_count(signature: Value) -> usize {
    get_heap_object_field(signature, SIGNATURE_MANDATORY_COUNT_OFFSET).as_integer() as usize
}

pub fn set_signature_mandatory_count(signature: Value, count: usize) {
    set_heap_object_field(
        signature,
        SIGNATURE_MANDATORY_COUNT_OFFSET,
        Value::new_integer(count as i64),
    );
}

pub fn get_signature_allow_extra(signature: Value) -> bool {
    get_boolean_value(get_heap_object_field(signature, SIGNATURE_ALLOW_EXTRA_OFFSET))
}

pub fn set_signature_allow_extra(signature: Value, allow: bool) {
    set_heap_object_field(signature, SIGNATURE_ALLOW_EXTRA_OFFSET, new_boolean(allow));
}

pub fn get_signature_tag_count(signature: Value) -> usize {
    get_pair_array_length(get_signature_tags(signature))
}

pub fn get_signature_tag_at(signature: Value, index: usize) -> Value {
    get_pair_array_first_at(get_signature_tags(signature), index)
}

pub fn get_signature_parameter_at(signature: Value, index: usize) -> Value {
    get_pair_array_second_at(get_signature_tags(signature), index)
}

pub fn signature_validate(signature: Value) -> Result<(), Condition> {
    let tags = get_signature_tags(signature);
    if !species::in_family(Family::Array, tags) || !is_pair_array_sorted(tags) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn ensure_signature_owned_values_frozen(
    runtime: &mut Runtime,
    signature: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_signature_tags(signature))
}

// ---------------------------------------------------------------------------
// Parameter
// ---------------------------------------------------------------------------

pub const PARAMETER_GUARD_OFFSET: usize = heap_object_field_offset(0);
pub const PARAMETER_IS_OPTIONAL_OFFSET: usize = heap_object_field_offset(1);
pub const PARAMETER_INDEX_OFFSET: usize = heap_object_field_offset(2);
pub const PARAMETER_TAGS_OFFSET: usize = heap_object_field_offset(3);
pub const PARAMETER_FIELD_COUNT: usize = 4;

pub fn get_parameter_guard(parameter: Value) -> Value {
    get_heap_object_field(parameter, PARAMETER_GUARD_OFFSET)
}

pub fn get_parameter_is_optional(parameter: Value) -> bool {
    get_boolean_value(get_heap_object_field(parameter, PARAMETER_IS_OPTIONAL_OFFSET))
}

pub fn get_parameter_index(parameter: Value) -> usize {
    get_heap_object_field(parameter, PARAMETER_INDEX_OFFSET).as_integer() as usize
}

pub fn get_parameter_tags(parameter: Value) -> Value {
    get_heap_object_field(parameter, PARAMETER_TAGS_OFFSET)
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardType {
    /// Match by value identity.
    Eq = 0,
    /// Match by instance-of, scored by inheritance distance.
    Is = 1,
    /// Always match, with the worst possible match score.
    Any = 2,
}

pub const GUARD_TYPE_OFFSET: usize = heap_object_field_offset(0);
pub const GUARD_VALUE_OFFSET: usize = heap_object_field_offset(1);
pub const GUARD_FIELD_COUNT: usize = 2;

pub fn get_guard_type(guard: Value) -> GuardType {
    match get_heap_object_field(guard, GUARD_TYPE_OFFSET).as_integer() {
        0 => GuardType::Eq,
        1 => GuardType::Is,
        _ => GuardType::Any,
    }
}

pub fn get_guard_value(guard: Value) -> Value {
    get_heap_object_field(guard, GUARD_VALUE_OFFSET)
}

pub fn guard_print_on(guard: Value, context: &mut PrintContext) {
    match get_guard_type(guard) {
        GuardType::Eq => {
            context.buf.push_str("eq(");
            species::value_print_on(get_guard_value(guard), context);
            context.buf.push(')');
        }
        GuardType::Is => {
            context.buf.push_str("is(");
            species::value_print_on(get_guard_value(guard), context);
            context.buf.push(')');
        }
        GuardType::Any => context.buf.push('*'),
    }
}

/// Matches the guard against a value, producing a score. A failed match
/// produces the no-match score rather than a condition.
pub fn guard_match(
    guard: Value,
    value: Value,
    roots: &Roots,
    methodspace: Value,
) -> Result<Value, Condition> {
    match get_guard_type(guard) {
        GuardType::Eq => {
            if value_identity_compare(get_guard_value(guard), value) {
                Ok(new_identity_match_score())
            } else {
                Ok(new_no_match_score())
            }
        }
        GuardType::Is => {
            let value_type = crate::instance::get_primary_type(value, roots);
            match inheritance_distance(methodspace, value_type, get_guard_value(guard)) {
                Some(distance) => Ok(new_score(ScoreCategory::Is, distance)),
                None => Ok(new_no_match_score()),
            }
        }
        GuardType::Any => Ok(new_any_match_score()),
    }
}

/// Breadth-first distance from `subtype` to `supertype` through the
/// methodspace's inheritance relation, following imports. None when the
/// supertype is not an ancestor.
fn inheritance_distance(methodspace: Value, subtype: Value, supertype: Value) -> Option<u32> {
    if value_identity_compare(subtype, supertype) {
        return Some(0);
    }
    if is_nothing(methodspace) || is_nothing(subtype) {
        return None;
    }
    let mut frontier = vec![subtype];
    let mut seen: Vec<u64> = vec![subtype.raw()];
    let mut distance = 0u32;
    while !frontier.is_empty() && distance <= 64 {
        distance += 1;
        let mut next = Vec::new();
        for &t in &frontier {
            collect_type_parents(methodspace, t, &mut |parent| {
                if !seen.contains(&parent.raw()) {
                    seen.push(parent.raw());
                    next.push(parent);
                }
                false
            });
        }
        if next.iter().any(|t| value_identity_compare(*t, supertype)) {
            return Some(distance);
        }
        frontier = next;
    }
    None
}

/// Invokes the callback for each direct parent of the type recorded in the
/// space or any space it imports.
fn collect_type_parents(space: Value, subtype: Value, callback: &mut impl FnMut(Value) -> bool) {
    if let Ok(parents) = get_id_hash_map_at(get_methodspace_inheritance(space), subtype) {
        for i in 0..get_array_buffer_length(parents) {
            if callback(get_array_buffer_at(parents, i)) {
                return;
            }
        }
    }
    let imports = get_methodspace_imports(space);
    for i in 0..get_array_buffer_length(imports) {
        collect_type_parents(get_array_buffer_at(imports, i), subtype, callback);
    }
}

// ---------------------------------------------------------------------------
// Call tags
// ---------------------------------------------------------------------------

pub const CALL_TAGS_ENTRIES_OFFSET: usize = heap_object_field_offset(0);
pub const CALL_TAGS_FIELD_COUNT: usize = 1;

/// The pair array mapping tag (sorted) to argument stack offset, where
/// offset 0 is the argument pushed last.
pub fn get_call_tags_entries(tags: Value) -> Value {
    get_heap_object_field(tags, CALL_TAGS_ENTRIES_OFFSET)
}

pub fn set_call_tags_entries(tags: Value, entries: Value) {
    set_heap_object_field(tags, CALL_TAGS_ENTRIES_OFFSET, entries);
}

pub fn get_call_tags_entry_count(tags: Value) -> usize {
    get_pair_array_length(get_call_tags_entries(tags))
}

pub fn get_call_tags_tag_at(tags: Value, index: usize) -> Value {
    get_pair_array_first_at(get_call_tags_entries(tags), index)
}

pub fn get_call_tags_offset_at(tags: Value, index: usize) -> usize {
    get_pair_array_second_at(get_call_tags_entries(tags), index).as_integer() as usize
}

pub fn call_tags_validate(tags: Value) -> Result<(), Condition> {
    let entries = get_call_tags_entries(tags);
    if !species::in_family(Family::Array, entries) || !is_pair_array_sorted(entries) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn call_tags_print_on(tags: Value, context: &mut PrintContext) {
    context.buf.push('{');
    for i in 0..get_call_tags_entry_count(tags) {
        if i > 0 {
            context.buf.push_str(", ");
        }
        species::value_print_on(get_call_tags_tag_at(tags, i), context);
        use std::fmt::Write;
        let _ = write!(context.buf, ": {}", get_call_tags_offset_at(tags, i));
    }
    context.buf.push('}');
}

pub fn call_tags_transient_identity_hash(
    tags: Value,
    stream: &mut HashStream,
    detector: &mut CycleDetector,
) -> Result<(), Condition> {
    value_transient_identity_hash_cycle_protect(get_call_tags_entries(tags), stream, detector)
}

pub fn call_tags_identity_compare(
    a: Value,
    b: Value,
    detector: &mut CycleDetector,
) -> Result<bool, Condition> {
    value_identity_compare_cycle_protect(get_call_tags_entries(a), get_call_tags_entries(b), detector)
}

pub fn ensure_call_tags_owned_values_frozen(
    runtime: &mut Runtime,
    tags: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_call_tags_entries(tags))
}

/// Builds sorted call tags entries from an array of tags in evaluation
/// order: the i'th of n tags gets offset n − 1 − i, because arguments are
/// counted backwards from the top of the stack.
pub fn build_call_tags_entries(
    heap: &mut Heap,
    roots: &Roots,
    tags: Value,
) -> Result<Value, Condition> {
    let count = get_array_length(tags);
    let entries = crate::alloc::new_heap_array(heap, roots, count * 2)?;
    for i in 0..count {
        crate::objects::set_pair_array_first_at(entries, i, get_array_at(tags, i));
        crate::objects::set_pair_array_second_at(
            entries,
            i,
            Value::new_integer((count - i - 1) as i64),
        );
    }
    crate::objects::co_sort_pair_array(entries);
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Call data
// ---------------------------------------------------------------------------

pub const CALL_DATA_TAGS_OFFSET: usize = heap_object_field_offset(0);
pub const CALL_DATA_VALUES_OFFSET: usize = heap_object_field_offset(1);
pub const CALL_DATA_FIELD_COUNT: usize = 2;

pub fn get_call_data_tags(call_data: Value) -> Value {
    get_heap_object_field(call_data, CALL_DATA_TAGS_OFFSET)
}

pub fn get_call_data_values(call_data: Value) -> Value {
    get_heap_object_field(call_data, CALL_DATA_VALUES_OFFSET)
}

// ---------------------------------------------------------------------------
// Method
// ---------------------------------------------------------------------------

pub mod method_flags {
    /// Lookup must take an extra step through the subject lambda's own
    /// methodspace.
    pub const LAMBDA_DELEGATE: u64 = 0x1;
    /// Lookup must take an extra step through the subject block's home
    /// methodspace.
    pub const BLOCK_DELEGATE: u64 = 0x2;
}

pub const METHOD_SIGNATURE_OFFSET: usize = heap_object_field_offset(0);
pub const METHOD_CODE_OFFSET: usize = heap_object_field_offset(1);
pub const METHOD_SYNTAX_OFFSET: usize = heap_object_field_offset(2);
pub const METHOD_MODULE_FRAGMENT_OFFSET: usize = heap_object_field_offset(3);
pub const METHOD_FLAGS_OFFSET: usize = heap_object_field_offset(4);
pub const METHOD_FIELD_COUNT: usize = 5;

pub fn get_method_signature(method: Value) -> Value {
    get_heap_object_field(method, METHOD_SIGNATURE_OFFSET)
}

/// The compiled implementation; nothing until first use for methods carrying
/// syntax.
pub fn get_method_code(method: Value) -> Value {
    get_heap_object_field(method, METHOD_CODE_OFFSET)
}

pub fn set_method_code(method: Value, code: Value) {
    set_heap_object_field(method, METHOD_CODE_OFFSET, code);
}

pub fn get_method_syntax(method: Value) -> Value {
    get_heap_object_field(method, METHOD_SYNTAX_OFFSET)
}

pub fn get_method_module_fragment(method: Value) -> Value {
    get_heap_object_field(method, METHOD_MODULE_FRAGMENT_OFFSET)
}

pub fn get_method_flags(method: Value) -> Value {
    get_heap_object_field(method, METHOD_FLAGS_OFFSET)
}

// ---------------------------------------------------------------------------
// Signature map
// ---------------------------------------------------------------------------

pub const SIGNATURE_MAP_ENTRIES_OFFSET: usize = heap_object_field_offset(0);
pub const SIGNATURE_MAP_FIELD_COUNT: usize = 1;

/// Alternating (signature, value) entries in an array buffer.
pub fn get_signature_map_entries(map: Value) -> Value {
    get_heap_object_field(map, SIGNATURE_MAP_ENTRIES_OFFSET)
}

pub fn add_to_signature_map(
    heap: &mut Heap,
    roots: &Roots,
    map: Value,
    signature: Value,
    value: Value,
) -> Result<(), Condition> {
    let entries = get_signature_map_entries(map);
    add_to_array_buffer(heap, roots, entries, signature)?;
    add_to_array_buffer(heap, roots, entries, value)
}

pub fn ensure_signature_map_owned_values_frozen(
    runtime: &mut Runtime,
    map: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_signature_map_entries(map))
}

// ---------------------------------------------------------------------------
// Methodspace
// ---------------------------------------------------------------------------

pub const METHODSPACE_INHERITANCE_OFFSET: usize = heap_object_field_offset(0);
pub const METHODSPACE_METHODS_OFFSET: usize = heap_object_field_offset(1);
pub const METHODSPACE_IMPORTS_OFFSET: usize = heap_object_field_offset(2);
pub const METHODSPACE_FIELD_COUNT: usize = 3;

/// Map from subtype to array buffer of direct supertypes.
pub fn get_methodspace_inheritance(space: Value) -> Value {
    get_heap_object_field(space, METHODSPACE_INHERITANCE_OFFSET)
}

pub fn get_methodspace_methods(space: Value) -> Value {
    get_heap_object_field(space, METHODSPACE_METHODS_OFFSET)
}

pub fn get_methodspace_imports(space: Value) -> Value {
    get_heap_object_field(space, METHODSPACE_IMPORTS_OFFSET)
}

pub fn methodspace_validate(space: Value) -> Result<(), Condition> {
    if !species::in_family(Family::IdHashMap, get_methodspace_inheritance(space)) {
        return Err(Condition::validation_failed());
    }
    if !species::in_family(Family::SignatureMap, get_methodspace_methods(space)) {
        return Err(Condition::validation_failed());
    }
    if !species::in_family(Family::ArrayBuffer, get_methodspace_imports(space)) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn ensure_methodspace_owned_values_frozen(
    runtime: &mut Runtime,
    space: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_methodspace_inheritance(space))?;
    species::ensure_frozen(runtime, get_methodspace_methods(space))?;
    species::ensure_frozen(runtime, get_methodspace_imports(space))
}

/// Records that subtype inherits directly from supertype.
pub fn add_methodspace_inheritance(
    heap: &mut Heap,
    roots: &Roots,
    space: Value,
    subtype: Value,
    supertype: Value,
) -> Result<(), Condition> {
    let inheritance = get_methodspace_inheritance(space);
    let parents = match get_id_hash_map_at(inheritance, subtype) {
        Ok(parents) => parents,
        Err(_) => {
            let parents = crate::alloc::new_heap_array_buffer(heap, roots, 4)?;
            crate::maps::set_id_hash_map_at(heap, roots, inheritance, subtype, parents)?;
            parents
        }
    };
    add_to_array_buffer(heap, roots, parents, supertype)
}

pub fn add_methodspace_import(
    heap: &mut Heap,
    roots: &Roots,
    space: Value,
    imported: Value,
) -> Result<(), Condition> {
    add_to_array_buffer(heap, roots, get_methodspace_imports(space), imported)
}

pub fn add_methodspace_method(
    heap: &mut Heap,
    roots: &Roots,
    space: Value,
    method: Value,
) -> Result<(), Condition> {
    add_to_signature_map(heap, roots, get_methodspace_methods(space), get_method_signature(method), method)
}

// ---------------------------------------------------------------------------
// Ambience
// ---------------------------------------------------------------------------

pub const AMBIENCE_METHODSPACE_OFFSET: usize = heap_object_field_offset(0);
pub const AMBIENCE_FIELD_COUNT: usize = 1;

/// The root methodspace of the current process.
pub fn get_ambience_methodspace(ambience: Value) -> Value {
    get_heap_object_field(ambience, AMBIENCE_METHODSPACE_OFFSET)
}

pub fn set_ambience_methodspace(ambience: Value, space: Value) {
    set_heap_object_field(ambience, AMBIENCE_METHODSPACE_OFFSET, space);
}

// ---------------------------------------------------------------------------
// Lookup input
// ---------------------------------------------------------------------------

/// Where a lookup's argument values come from: the pending arguments on a
/// frame, or a reified call data object.
pub enum SigmapInput<'a> {
    Frame { frame: &'a Frame, tags: Value },
    CallData { call_data: Value },
}

impl<'a> SigmapInput<'a> {
    pub fn tags(&self) -> Value {
        match self {
            SigmapInput::Frame { tags, .. } => *tags,
            SigmapInput::CallData { call_data } => get_call_data_tags(*call_data),
        }
    }

    pub fn argument_count(&self) -> usize {
        get_call_tags_entry_count(self.tags())
    }

    pub fn tag_at(&self, index: usize) -> Value {
        get_call_tags_tag_at(self.tags(), index)
    }

    pub fn offset_at(&self, index: usize) -> usize {
        get_call_tags_offset_at(self.tags(), index)
    }

    pub fn value_at(&self, index: usize) -> Value {
        let offset = self.offset_at(index);
        match self {
            SigmapInput::Frame { frame, .. } => frame.peek_value(offset),
            SigmapInput::CallData { call_data } => {
                get_array_at(get_call_data_values(*call_data), offset)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// There was an argument the signature doesn't expect.
    UnexpectedArgument,
    /// Multiple arguments were passed for the same parameter.
    RedundantArgument,
    /// The signature expects more arguments than were passed.
    MissingArgument,
    /// A guard rejected an argument.
    GuardRejected,
    /// The invocation matched.
    Match,
    /// The invocation matched with extra arguments the signature allows.
    ExtraMatch,
}

impl MatchResult {
    pub fn is_match(self) -> bool {
        matches!(self, MatchResult::Match | MatchResult::ExtraMatch)
    }
}

/// Offset marker for arguments that don't correspond to a parameter.
pub const NO_OFFSET: usize = usize::MAX;

/// Scratch state for one match: per-argument scores in sorted tag order and
/// the parameter-index → argument-offset mapping.
pub struct MatchInfo {
    pub scores: Vec<Value>,
    pub offsets: Vec<usize>,
}

impl MatchInfo {
    pub fn with_capacity(capacity: usize) -> MatchInfo {
        MatchInfo { scores: vec![new_no_match_score(); capacity], offsets: vec![NO_OFFSET; capacity] }
    }

    fn reset(&mut self, score_count: usize, offset_count: usize) {
        self.scores.clear();
        self.scores.resize(score_count, new_no_match_score());
        self.offsets.clear();
        self.offsets.resize(offset_count, NO_OFFSET);
    }
}

/// Matches an invocation against a signature, walking the two sorted tag
/// sequences in parallel. On a match the scores and offsets arrays hold the
/// result; on failure their contents are unspecified.
pub fn match_signature(
    signature: Value,
    input: &SigmapInput,
    roots: &Roots,
    methodspace: Value,
    info: &mut MatchInfo,
) -> Result<MatchResult, Condition> {
    let argc = input.argument_count();
    let sig_tag_count = get_signature_tag_count(signature);
    info.reset(argc, get_signature_parameter_count(signature));
    let mut params_seen = vec![false; get_signature_parameter_count(signature)];
    let mut matched = 0usize;
    let mut result = MatchResult::Match;

    let mut sig_cursor = 0usize;
    let mut call_cursor = 0usize;
    while sig_cursor < sig_tag_count && call_cursor < argc {
        let sig_tag = get_signature_tag_at(signature, sig_cursor);
        let call_tag = input.tag_at(call_cursor);
        let relation = species::value_ordering_compare(sig_tag, call_tag);
        if crate::core::tagged::test_relation(
            relation,
            crate::core::tagged::Relation::LessThan as u64,
        ) {
            // The signature has a tag the call doesn't. The argument may
            // still arrive under one of the parameter's other tags; the
            // mandatory count check at the end settles it.
            sig_cursor += 1;
        } else if crate::core::tagged::test_relation(
            relation,
            crate::core::tagged::Relation::GreaterThan as u64,
        ) {
            // The call has a tag the signature doesn't.
            if !get_signature_allow_extra(signature) {
                return Ok(MatchResult::UnexpectedArgument);
            }
            result = MatchResult::ExtraMatch;
            info.scores[call_cursor] = new_extra_match_score();
            call_cursor += 1;
        } else {
            let param = get_signature_parameter_at(signature, sig_cursor);
            let param_index = get_parameter_index(param);
            if params_seen[param_index] {
                return Ok(MatchResult::RedundantArgument);
            }
            let score = guard_match(
                get_parameter_guard(param),
                input.value_at(call_cursor),
                roots,
                methodspace,
            )?;
            if !is_score_match(score) {
                return Ok(MatchResult::GuardRejected);
            }
            params_seen[param_index] = true;
            if !get_parameter_is_optional(param) {
                matched += 1;
            }
            info.scores[call_cursor] = score;
            info.offsets[param_index] = input.offset_at(call_cursor);
            sig_cursor += 1;
            call_cursor += 1;
        }
    }
    while call_cursor < argc {
        if !get_signature_allow_extra(signature) {
            return Ok(MatchResult::UnexpectedArgument);
        }
        result = MatchResult::ExtraMatch;
        info.scores[call_cursor] = new_extra_match_score();
        call_cursor += 1;
    }
    if matched < get_signature_mandatory_count(signature) {
        return Ok(MatchResult::MissingArgument);
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Score joining
// ---------------------------------------------------------------------------

/// Outcome of joining two score vectors. The bits encode which side was
/// strictly better somewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    /// The vectors were equal.
    Equal,
    /// The target was strictly better than the source.
    Worse,
    /// The source was strictly better than the target.
    Better,
    /// Each was better somewhere.
    Ambiguous,
}

/// Joins the source vector into the target, keeping the better score in each
/// component, and reports how they compared.
pub fn join_score_vectors(target: &mut [Value], source: &[Value]) -> JoinStatus {
    debug_assert_eq!(target.len(), source.len());
    let mut target_better = false;
    let mut source_better = false;
    for (t, &s) in target.iter_mut().zip(source.iter()) {
        if is_score_better(*t, s) {
            target_better = true;
        } else if is_score_better(s, *t) {
            source_better = true;
            *t = s;
        }
    }
    match (target_better, source_better) {
        (false, false) => JoinStatus::Equal,
        (true, false) => JoinStatus::Worse,
        (false, true) => JoinStatus::Better,
        (true, true) => JoinStatus::Ambiguous,
    }
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Running state of a signature map lookup across multiple spaces.
struct SigmapState {
    best_scores: Vec<Value>,
    best_offsets: Vec<usize>,
    best_method: Value,
    scratch: MatchInfo,
    ambiguous: bool,
}

impl SigmapState {
    fn new(argc: usize) -> SigmapState {
        SigmapState {
            best_scores: vec![new_no_match_score(); argc],
            best_offsets: vec![NO_OFFSET; argc],
            best_method: nothing(),
            scratch: MatchInfo::with_capacity(argc),
            ambiguous: false,
        }
    }

    /// Matches every entry of the space's signature map, folding matches
    /// into the current best.
    fn include_space(
        &mut self,
        input: &SigmapInput,
        roots: &Roots,
        space: Value,
    ) -> Result<(), Condition> {
        let entries = get_signature_map_entries(get_methodspace_methods(space));
        let count = get_array_buffer_length(entries) / 2;
        for i in 0..count {
            let signature = get_array_buffer_at(entries, i * 2);
            let method = get_array_buffer_at(entries, i * 2 + 1);
            let result = match_signature(signature, input, roots, space, &mut self.scratch)?;
            if !result.is_match() {
                continue;
            }
            if is_nothing(self.best_method) {
                let argc = input.argument_count();
                self.best_scores.clear();
                self.best_scores.extend_from_slice(&self.scratch.scores[..argc]);
                self.best_offsets.clear();
                self.best_offsets.extend_from_slice(&self.scratch.offsets);
                self.best_method = method;
                continue;
            }
            let argc = input.argument_count();
            match join_score_vectors(&mut self.best_scores[..argc], &self.scratch.scores[..argc]) {
                JoinStatus::Better => {
                    self.best_method = method;
                    self.best_offsets.clear();
                    self.best_offsets.extend_from_slice(&self.scratch.offsets);
                    self.ambiguous = false;
                }
                JoinStatus::Worse | JoinStatus::Equal => {}
                JoinStatus::Ambiguous => {
                    self.ambiguous = true;
                }
            }
        }
        // Imported spaces participate in the same lookup.
        let imports = get_methodspace_imports(space);
        for i in 0..get_array_buffer_length(imports) {
            self.include_space(input, roots, get_array_buffer_at(imports, i))?;
        }
        Ok(())
    }

    fn finish(self) -> Result<(Value, Vec<usize>), Condition> {
        if is_nothing(self.best_method) {
            return Err(Condition::lookup_error(LookupErrorKind::MethodLookup));
        }
        if self.ambiguous {
            return Err(Condition::lookup_error(LookupErrorKind::Ambiguity));
        }
        Ok((self.best_method, self.best_offsets))
    }
}

/// Looks up a method in a single methodspace (plus its imports). On success
/// returns the method and its canonicalized argument map.
pub fn lookup_methodspace_method(
    heap: &mut Heap,
    roots: &Roots,
    input: &SigmapInput,
    space: Value,
) -> Result<(Value, Value), Condition> {
    let mut state = SigmapState::new(input.argument_count());
    state.include_space(input, roots, space)?;
    let (method, offsets) = state.finish()?;
    let arg_map = canonicalize_argument_map(heap, roots, &offsets)?;
    Ok((method, arg_map))
}

/// The full method lookup: searches the fragment's methodspaces (or the
/// ambience's root space when the fragment is nothing) and resolves
/// lambda/block delegation.
pub fn lookup_method_full(
    heap: &mut Heap,
    roots: &Roots,
    input: &SigmapInput,
    ambience: Value,
    fragment: Value,
) -> Result<(Value, Value), Condition> {
    let mut state = SigmapState::new(input.argument_count());
    if is_nothing(fragment) {
        state.include_space(input, roots, get_ambience_methodspace(ambience))?;
    } else {
        let space = crate::bind::get_module_fragment_methodspace(fragment);
        state.include_space(input, roots, space)?;
        // The ambience's built-in methods are always visible.
        state.include_space(input, roots, get_ambience_methodspace(ambience))?;
    }
    let (method, offsets) = state.finish()?;
    let flags = get_method_flags(method);
    if get_flag_set_at(flags, method_flags::LAMBDA_DELEGATE) {
        // The subject must be a lambda; redo the lookup in its own space.
        let subject = find_subject_value(input, roots)?;
        if !species::in_family(Family::Lambda, subject) {
            return Err(Condition::lookup_error(LookupErrorKind::MethodLookup));
        }
        return lookup_methodspace_method(
            heap,
            roots,
            input,
            crate::closures::get_lambda_methods(subject),
        );
    }
    if get_flag_set_at(flags, method_flags::BLOCK_DELEGATE) {
        let subject = find_subject_value(input, roots)?;
        if !species::in_family(Family::Block, subject)
            || !crate::closures::is_block_live(subject)
        {
            return Err(Condition::lookup_error(LookupErrorKind::MethodLookup));
        }
        let section = crate::closures::get_block_section(subject);
        return lookup_methodspace_method(
            heap,
            roots,
            input,
            crate::derived::get_block_section_methodspace(section),
        );
    }
    let arg_map = canonicalize_argument_map(heap, roots, &offsets)?;
    Ok((method, arg_map))
}

/// The argument passed under the subject key, if any.
fn find_subject_value(input: &SigmapInput, roots: &Roots) -> Result<Value, Condition> {
    for i in 0..input.argument_count() {
        if value_identity_compare(input.tag_at(i), roots.subject_key()) {
            return Ok(input.value_at(i));
        }
    }
    Err(Condition::lookup_error(LookupErrorKind::MethodLookup))
}

/// Scans the stack's barrier chain for signal handler sections, trying each
/// handler's methodspace from the innermost outwards. The first section
/// whose space matches wins.
pub fn lookup_signal_handler_method(
    heap: &mut Heap,
    roots: &Roots,
    input: &SigmapInput,
    frame: &Frame,
) -> Result<(Value, Value, Value), Condition> {
    let stack = crate::stack::get_stack_piece_stack(frame.stack_piece);
    let mut barrier = crate::stack::get_stack_top_barrier(stack);
    while !is_nothing(barrier) {
        if crate::derived::in_genus(crate::derived::Genus::SignalHandlerSection, barrier) {
            let space = crate::derived::get_barrier_state_payload(barrier);
            match lookup_methodspace_method(heap, roots, input, space) {
                Ok((method, arg_map)) => return Ok((method, arg_map, barrier)),
                Err(c) if c.cause() == crate::core::value::ConditionCause::LookupError => {}
                Err(c) => return Err(c),
            }
        }
        barrier = crate::derived::get_barrier_state_previous(barrier);
    }
    Err(Condition::lookup_error(LookupErrorKind::MethodLookup))
}

// ---------------------------------------------------------------------------
// Argument map trie
// ---------------------------------------------------------------------------

pub const ARGUMENT_MAP_TRIE_VALUE_OFFSET: usize = heap_object_field_offset(0);
pub const ARGUMENT_MAP_TRIE_CHILDREN_OFFSET: usize = heap_object_field_offset(1);
pub const ARGUMENT_MAP_TRIE_FIELD_COUNT: usize = 2;

/// The full argument map array accumulated along the path to this node.
pub fn get_argument_map_trie_value(trie: Value) -> Value {
    get_heap_object_field(trie, ARGUMENT_MAP_TRIE_VALUE_OFFSET)
}

pub fn set_argument_map_trie_value(trie: Value, value: Value) {
    set_heap_object_field(trie, ARGUMENT_MAP_TRIE_VALUE_OFFSET, value);
}

pub fn get_argument_map_trie_children(trie: Value) -> Value {
    get_heap_object_field(trie, ARGUMENT_MAP_TRIE_CHILDREN_OFFSET)
}

/// The child for one more argument-map key, created on first use. Children
/// are stored in an array buffer indexed by the encoded key.
pub fn get_argument_map_trie_child(
    heap: &mut Heap,
    roots: &Roots,
    trie: Value,
    key: usize,
) -> Result<Value, Condition> {
    let children = get_argument_map_trie_children(trie);
    while get_array_buffer_length(children) <= key {
        add_to_array_buffer(heap, roots, children, nothing())?;
    }
    let existing = get_array_buffer_at(children, key);
    if !is_nothing(existing) {
        return Ok(existing);
    }
    let parent_value = get_argument_map_trie_value(trie);
    let parent_length = get_array_length(parent_value);
    let child_value = crate::alloc::new_heap_array(heap, roots, parent_length + 1)?;
    for i in 0..parent_length {
        set_array_at(child_value, i, get_array_at(parent_value, i));
    }
    set_array_at(child_value, parent_length, Value::new_integer(key as i64));
    let child = crate::alloc::new_heap_argument_map_trie(heap, roots, child_value)?;
    crate::objects::set_array_buffer_at(children, key, child);
    Ok(child)
}

/// Interns the offsets vector: two lookups producing the same parameter
/// ordering get back the identical array object.
pub fn canonicalize_argument_map(
    heap: &mut Heap,
    roots: &Roots,
    offsets: &[usize],
) -> Result<Value, Condition> {
    let mut node = roots.argument_map_trie_root();
    for &offset in offsets {
        debug_assert_ne!(offset, NO_OFFSET, "unmapped parameter in argument map");
        node = get_argument_map_trie_child(heap, roots, node, offset)?;
    }
    Ok(get_argument_map_trie_value(node))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tagged::new_flag_set;

    #[test]
    fn test_join_equal() {
        let a = new_score(ScoreCategory::Is, 1);
        let mut target = vec![a];
        assert_eq!(join_score_vectors(&mut target, &[a]), JoinStatus::Equal);
    }

    #[test]
    fn test_join_better_and_worse() {
        let eq = new_identity_match_score();
        let any = new_any_match_score();
        let mut target = vec![any];
        assert_eq!(join_score_vectors(&mut target, &[eq]), JoinStatus::Better);
        assert_eq!(target[0], eq);
        let mut target = vec![eq];
        assert_eq!(join_score_vectors(&mut target, &[any]), JoinStatus::Worse);
        assert_eq!(target[0], eq);
    }

    #[test]
    fn test_join_ambiguous_keeps_best_components() {
        let eq = new_identity_match_score();
        let any = new_any_match_score();
        let mut target = vec![eq, any];
        assert_eq!(join_score_vectors(&mut target, &[any, eq]), JoinStatus::Ambiguous);
        assert_eq!(target, vec![eq, eq]);
    }

    #[test]
    fn test_flag_helpers() {
        let flags = new_flag_set(method_flags::LAMBDA_DELEGATE);
        assert!(get_flag_set_at(flags, method_flags::LAMBDA_DELEGATE));
        assert!(!get_flag_set_at(flags, method_flags::BLOCK_DELEGATE));
    }
}
