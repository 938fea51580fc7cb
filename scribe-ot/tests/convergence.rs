//! Property tests for the transform engine.
//!
//! Operations are generated from a random action script so that every
//! generated operation is well-formed for the generated document.

use proptest::prelude::*;
use scribe_ot::{compose, transform, validate, Operation, TextOp, Tie};

type Action = (u8, usize, String);

fn action() -> impl Strategy<Value = Action> {
    (0u8..3, 1usize..6, "[A-Z]{1,3}")
}

/// Turn an action script into an operation over a document of `len` units.
fn build_op(len: usize, actions: &[Action]) -> TextOp {
    let mut op = TextOp::new();
    let mut remaining = len;
    for (kind, n, text) in actions {
        match kind {
            0 => {
                let k = (*n).min(remaining);
                op.retain(k);
                remaining -= k;
            }
            1 => {
                op.insert(text);
            }
            _ => {
                let k = (*n).min(remaining);
                op.delete(k);
                remaining -= k;
            }
        }
    }
    op.retain(remaining);
    op
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// apply(a) then b' equals apply(b) then a'.
    #[test]
    fn transform_converges(
        doc in "[a-z]{0,20}",
        a_script in prop::collection::vec(action(), 0..8),
        b_script in prop::collection::vec(action(), 0..8),
        left_first in any::<bool>(),
    ) {
        let len = doc.chars().count();
        let a = build_op(len, &a_script);
        let b = build_op(len, &b_script);
        let tie = if left_first { Tie::Left } else { Tie::Right };

        let (a2, b2) = transform(&a, &b, tie).unwrap();
        prop_assert_eq!(a2.base_len(), b.target_len());
        prop_assert_eq!(b2.base_len(), a.target_len());

        let via_a = b2.apply(&a.apply(&doc).unwrap()).unwrap();
        let via_b = a2.apply(&b.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(via_a, via_b);
    }

    /// Author-ordered transform converges regardless of which side arrives first.
    #[test]
    fn author_tie_break_is_order_independent(
        doc in "[a-z]{0,12}",
        a_script in prop::collection::vec(action(), 0..6),
        b_script in prop::collection::vec(action(), 0..6),
    ) {
        let len = doc.chars().count();
        let a = Operation::new(0, "alice", build_op(len, &a_script));
        let b = Operation::new(0, "bob", build_op(len, &b_script));

        let b_after_a = b.rebase_onto(&a).unwrap();
        let a_after_b = a.rebase_onto(&b).unwrap();

        let first = b_after_a.ops.apply(&a.ops.apply(&doc).unwrap()).unwrap();
        let second = a_after_b.ops.apply(&b.ops.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(first, second);
    }

    /// compose(a, b) behaves like applying a then b.
    #[test]
    fn compose_matches_sequential_apply(
        doc in "[a-z]{0,20}",
        a_script in prop::collection::vec(action(), 0..8),
        b_script in prop::collection::vec(action(), 0..8),
    ) {
        let a = build_op(doc.chars().count(), &a_script);
        let b = build_op(a.target_len(), &b_script);
        let composed = compose(&a, &b).unwrap();
        let sequential = b.apply(&a.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(composed.apply(&doc).unwrap(), sequential);
    }

    /// invert undoes the edit.
    #[test]
    fn invert_restores_original(
        doc in "[a-z]{0,20}",
        script in prop::collection::vec(action(), 0..8),
    ) {
        let op = build_op(doc.chars().count(), &script);
        let edited = op.apply(&doc).unwrap();
        let undo = op.invert(&doc).unwrap();
        prop_assert_eq!(undo.apply(&edited).unwrap(), doc);
    }

    /// Builder output survives validation whenever it is non-empty.
    #[test]
    fn built_ops_validate(
        doc in "[a-z]{1,20}",
        script in prop::collection::vec(action(), 0..8),
    ) {
        let len = doc.chars().count();
        let op = build_op(len, &script);
        prop_assert!(validate(&op, len).is_ok());
    }
}

#[test]
fn scenario_concurrent_inserts_at_start() {
    let mut a = TextOp::new();
    a.insert("A").retain(5);
    let mut b = TextOp::new();
    b.insert("B").retain(5);

    let p1 = Operation::new(5, "p1", a);
    let p2 = Operation::new(5, "p2", b);

    let p1_first = p2.rebase_onto(&p1).unwrap().ops.apply("Ahello").unwrap();
    let p2_first = p1.rebase_onto(&p2).unwrap().ops.apply("Bhello").unwrap();
    assert_eq!(p1_first, "ABhello");
    assert_eq!(p2_first, "ABhello");
}
