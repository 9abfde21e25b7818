//! Class linearization
//!
//! Computes the total order in which a class and its ancestors are searched
//! for a matching handler, by merging the declared superclasses' own
//! linearizations. The merge is exact and order-sensitive: reordering any of
//! its cases changes method resolution for every diamond-shaped hierarchy.
//!
//! The result is published through a write-once cell per class: the first
//! computation wins and is never recomputed or mutated afterwards, so
//! concurrent dispatchers can read it without locks.

use crate::program::{ClassId, ClassResolver, Program};
use thiserror::Error;

/// Linearization failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinearizeError {
    /// A declared superclass name did not resolve. Fatal to loading the unit.
    #[error("class {class:?}: superclass {superclass:?} not found")]
    ClassNotFound {
        /// The class whose declaration references the name
        class: String,
        /// The unresolved superclass name
        superclass: String,
    },

    /// The superclass graph contains a cycle.
    #[error("class {class:?} appears in its own ancestry")]
    CyclicHierarchy {
        /// A class on the cycle
        class: String,
    },

    /// A field owner that is not an ancestor of the instance's class.
    #[error("class {owner:?} is not an ancestor of {class:?}")]
    NotAnAncestor {
        /// The named owner class
        owner: String,
        /// The instance's class
        class: String,
    },

    /// Field index beyond the owner's declared block.
    #[error("field index {index} out of range for class {owner:?} ({count} fields)")]
    FieldOutOfRange {
        /// The owning class
        owner: String,
        /// Offending declared-field index
        index: u32,
        /// Fields the owner declares
        count: u32,
    },
}

/// The class's linearization, computed and cached on first access.
///
/// `linearization(c)[0]` is always `c` itself, and every declared superclass
/// of `c` occurs in the result.
pub fn linearization<'p>(
    program: &'p Program,
    resolver: &impl ClassResolver,
    class: ClassId,
) -> Result<&'p [ClassId], LinearizeError> {
    let mut visiting = Vec::new();
    linearize_inner(program, resolver, class, &mut visiting)
}

fn linearize_inner<'p>(
    program: &'p Program,
    resolver: &impl ClassResolver,
    class: ClassId,
    visiting: &mut Vec<ClassId>,
) -> Result<&'p [ClassId], LinearizeError> {
    if let Some(cached) = program.class(class).linearization.get() {
        return Ok(cached);
    }
    if visiting.contains(&class) {
        return Err(LinearizeError::CyclicHierarchy {
            class: program.class(class).name.clone(),
        });
    }
    visiting.push(class);

    let declared = &program.class(class).superclass_names;
    let mut supers = Vec::with_capacity(declared.len());
    for name in declared {
        let id = resolver.resolve_class(class, name).ok_or_else(|| {
            LinearizeError::ClassNotFound {
                class: program.class(class).name.clone(),
                superclass: name.clone(),
            }
        })?;
        supers.push(id);
    }

    // Superclasses merge in reverse declaration order; the first processed
    // one seeds the running list.
    let mut running: Vec<ClassId> = Vec::new();
    for &superclass in supers.iter().rev() {
        let lin = linearize_inner(program, resolver, superclass, visiting)?;
        running = merge(&running, lin);
    }

    let mut result = Vec::with_capacity(running.len() + 1);
    result.push(class);
    result.extend_from_slice(&running);

    visiting.pop();
    log::trace!(
        "linearized {}: {} classes",
        program.class(class).name,
        result.len()
    );

    // First computation wins; a racing thread's identical result is dropped.
    let _ = program
        .class(class)
        .linearization
        .set(result.into_boxed_slice());
    Ok(program
        .class(class)
        .linearization
        .get()
        .unwrap_or_else(|| unreachable!("linearization published above")))
}

/// Order-preserving merge of two linearizations.
pub fn merge(l1: &[ClassId], l2: &[ClassId]) -> Vec<ClassId> {
    if l1.is_empty() {
        return l2.to_vec();
    }
    if l2.is_empty() {
        return l1.to_vec();
    }

    // Membership bitmaps double as the disjointness test.
    let in_l2: Vec<bool> = l1.iter().map(|c| l2.contains(c)).collect();
    let in_l1: Vec<bool> = l2.iter().map(|c| l1.contains(c)).collect();
    let disjoint = !in_l2.iter().any(|&present| present);

    // If the shorter list is an order-preserving (not necessarily
    // contiguous) subsequence of the longer, the longer stands verbatim.
    let (shorter, longer) = if l1.len() <= l2.len() {
        (l1, l2)
    } else {
        (l2, l1)
    };
    if is_subsequence(shorter, longer) {
        return longer.to_vec();
    }

    if disjoint {
        let mut out = l1.to_vec();
        out.extend_from_slice(l2);
        return out;
    }

    let mut out = Vec::with_capacity(l1.len() + l2.len());
    let mut i = 0;
    let mut j = 0;
    while i < l1.len() && j < l2.len() {
        if l1[i] == l2[j] {
            out.push(l1[i]);
            i += 1;
            j += 1;
        } else if !in_l1[j] {
            out.push(l2[j]);
            j += 1;
        } else if !in_l2[i] {
            out.push(l1[i]);
            i += 1;
        } else {
            // Ambiguous: present in both. The later-declared branch wins.
            out.push(l2[j]);
            j += 1;
        }
    }
    // The residual copy starts one past the stalled cursor, dropping the
    // element under it. Existing images resolve against this exact order.
    // TODO: audit shipped images for hierarchies that reach this path with a
    // nonempty residue before straightening the offset.
    if i < l1.len() {
        out.extend_from_slice(&l1[i + 1..]);
    } else if j < l2.len() {
        out.extend_from_slice(&l2[j + 1..]);
    }
    out
}

fn is_subsequence(shorter: &[ClassId], longer: &[ClassId]) -> bool {
    let mut cursor = longer.iter();
    shorter
        .iter()
        .all(|needle| cursor.any(|candidate| candidate == needle))
}

/// Total instance size in field words: the sum of every ancestor's declared
/// field count, memoized per class.
pub fn instance_size(
    program: &Program,
    resolver: &impl ClassResolver,
    class: ClassId,
) -> Result<u32, LinearizeError> {
    if let Some(&cached) = program.class(class).instance_size.get() {
        return Ok(cached);
    }
    let lin = linearization(program, resolver, class)?;
    let size = lin
        .iter()
        .map(|&c| program.class(c).field_count())
        .sum::<u32>();
    let _ = program.class(class).instance_size.set(size);
    Ok(size)
}

/// Word offset of a declared field within an instance's field region.
///
/// Ancestor field blocks are concatenated in linearization order, the
/// instance's own class first.
pub fn field_offset(
    program: &Program,
    resolver: &impl ClassResolver,
    class: ClassId,
    owner: ClassId,
    index: u32,
) -> Result<u32, LinearizeError> {
    let owner_class = program.class(owner);
    if index >= owner_class.field_count() {
        return Err(LinearizeError::FieldOutOfRange {
            owner: owner_class.name.clone(),
            index,
            count: owner_class.field_count(),
        });
    }
    let lin = linearization(program, resolver, class)?;
    let mut offset = 0;
    for &ancestor in lin {
        if ancestor == owner {
            return Ok(offset + index);
        }
        offset += program.class(ancestor).field_count();
    }
    Err(LinearizeError::NotAnAncestor {
        owner: owner_class.name.clone(),
        class: program.class(class).name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Class, Visibility};

    fn class(name: &str, supers: &[&str]) -> Class {
        Class::new(
            name,
            Visibility::Public,
            supers.iter().map(|s| s.to_string()).collect(),
            vec![],
        )
    }

    fn class_with_fields(name: &str, supers: &[&str], fields: &[&str]) -> Class {
        Class::new(
            name,
            Visibility::Public,
            supers.iter().map(|s| s.to_string()).collect(),
            fields.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// A (root); B extends A; C extends A; D extends B, C.
    fn diamond() -> (Program, ClassId, ClassId, ClassId, ClassId) {
        let mut program = Program::new();
        let a = program.add_class(class("A", &[]));
        let b = program.add_class(class("B", &["A"]));
        let c = program.add_class(class("C", &["A"]));
        let d = program.add_class(class("D", &["B", "C"]));
        for id in [a, b, c, d] {
            program.add_root(id).unwrap();
        }
        (program, a, b, c, d)
    }

    #[test]
    fn test_self_identity() {
        let (program, a, b, c, d) = diamond();
        for id in [a, b, c, d] {
            let lin = linearization(&program, &program, id).unwrap();
            assert_eq!(lin[0], id);
        }
    }

    #[test]
    fn test_diamond_order() {
        let (program, a, b, c, d) = diamond();
        let lin = linearization(&program, &program, d).unwrap();
        assert_eq!(lin, &[d, b, c, a]);
    }

    #[test]
    fn test_completeness() {
        let (program, _, b, c, d) = diamond();
        let lin = linearization(&program, &program, d).unwrap();
        for superclass in [b, c] {
            assert!(lin.contains(&superclass));
        }
    }

    #[test]
    fn test_result_is_cached() {
        let (program, _, _, _, d) = diamond();
        let first = linearization(&program, &program, d).unwrap() as *const [ClassId];
        let second = linearization(&program, &program, d).unwrap() as *const [ClassId];
        assert_eq!(first, second);
    }

    #[test]
    fn test_unresolved_superclass() {
        let mut program = Program::new();
        let orphan = program.add_class(class("Orphan", &["Ghost"]));
        program.add_root(orphan).unwrap();
        assert_eq!(
            linearization(&program, &program, orphan).unwrap_err(),
            LinearizeError::ClassNotFound {
                class: "Orphan".into(),
                superclass: "Ghost".into()
            }
        );
    }

    #[test]
    fn test_cycle_detected() {
        let mut program = Program::new();
        let a = program.add_class(class("A", &["B"]));
        let b = program.add_class(class("B", &["A"]));
        program.add_root(a).unwrap();
        program.add_root(b).unwrap();
        assert!(matches!(
            linearization(&program, &program, a),
            Err(LinearizeError::CyclicHierarchy { .. })
        ));
    }

    #[test]
    fn test_merge_idempotence() {
        let l: Vec<ClassId> = [0, 1, 2].map(ClassId).to_vec();
        assert_eq!(merge(&l, &l), l);
    }

    #[test]
    fn test_merge_empty_shortcut() {
        let l: Vec<ClassId> = [3, 4].map(ClassId).to_vec();
        assert_eq!(merge(&[], &l), l);
        assert_eq!(merge(&l, &[]), l);
    }

    #[test]
    fn test_merge_containment_shortcut() {
        // [1, 3] is a non-contiguous subsequence of [0, 1, 2, 3].
        let short: Vec<ClassId> = [1, 3].map(ClassId).to_vec();
        let long: Vec<ClassId> = [0, 1, 2, 3].map(ClassId).to_vec();
        assert_eq!(merge(&short, &long), long);
        assert_eq!(merge(&long, &short), long);
    }

    #[test]
    fn test_merge_disjoint_concatenates() {
        let l1: Vec<ClassId> = [0, 1].map(ClassId).to_vec();
        let l2: Vec<ClassId> = [2, 3].map(ClassId).to_vec();
        let expected: Vec<ClassId> = [0, 1, 2, 3].map(ClassId).to_vec();
        assert_eq!(merge(&l1, &l2), expected);
    }

    #[test]
    fn test_merge_residual_skips_cursor_element() {
        // Partial overlap where l1 stalls with [X] unconsumed: the residual
        // copy starts one past the cursor, so X is dropped.
        let c = ClassId(0);
        let a = ClassId(1);
        let x = ClassId(2);
        let b = ClassId(3);
        let merged = merge(&[c, a, x], &[b, a]);
        assert_eq!(merged, vec![b, c, a]);
    }

    #[test]
    fn test_instance_size_sums_ancestors() {
        let mut program = Program::new();
        let a = program.add_class(class_with_fields("A", &[], &["x", "y"]));
        let b = program.add_class(class_with_fields("B", &["A"], &["z"]));
        program.add_root(a).unwrap();
        program.add_root(b).unwrap();

        assert_eq!(instance_size(&program, &program, b).unwrap(), 3);
        assert_eq!(instance_size(&program, &program, a).unwrap(), 2);
    }

    #[test]
    fn test_field_offset_in_linearized_layout() {
        let mut program = Program::new();
        let a = program.add_class(class_with_fields("A", &[], &["x", "y"]));
        let b = program.add_class(class_with_fields("B", &["A"], &["z"]));
        program.add_root(a).unwrap();
        program.add_root(b).unwrap();

        // B's own block comes first, then A's.
        assert_eq!(field_offset(&program, &program, b, b, 0).unwrap(), 0);
        assert_eq!(field_offset(&program, &program, b, a, 0).unwrap(), 1);
        assert_eq!(field_offset(&program, &program, b, a, 1).unwrap(), 2);

        assert!(matches!(
            field_offset(&program, &program, b, a, 2),
            Err(LinearizeError::FieldOutOfRange { .. })
        ));
        assert!(matches!(
            field_offset(&program, &program, a, b, 0),
            Err(LinearizeError::NotAnAncestor { .. })
        ));
    }
}
