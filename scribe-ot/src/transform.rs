//! Composition and concurrent rebasing of operations.
//!
//! Convergence: for `a`, `b` defined on the same document `s`,
//!
//! ```text
//!            a
//!      s ─────────► s·a
//!      │             │
//!    b │             │ b'
//!      ▼             ▼
//!     s·b ───────► s·a·b' == s·b·a'
//!            a'
//! ```
//!
//! Both functions are pure and total over well-formed inputs; the only
//! failure is a length mismatch between the two arguments.

use crate::error::OtError;
use crate::operation::{Component, Operation, TextOp};

/// Which side's insert goes first when both insert at one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    Left,
    Right,
}

/// Sequential composition: `compose(a, b).apply(s) == b.apply(a.apply(s))`.
pub fn compose(a: &TextOp, b: &TextOp) -> Result<TextOp, OtError> {
    if a.target_len() != b.base_len() {
        return Err(OtError::IncompatibleOperation {
            expected: a.target_len(),
            actual: b.base_len(),
        });
    }

    let mut out = TextOp::new();
    let mut ia = a.components().iter().cloned();
    let mut ib = b.components().iter().cloned();
    let mut ca = ia.next();
    let mut cb = ib.next();

    loop {
        match (ca.take(), cb.take()) {
            (None, None) => break,
            // Deletes in `a` never reach `b`.
            (Some(Component::Delete(n)), rest) => {
                out.delete(n);
                ca = ia.next();
                cb = rest;
            }
            // Inserts in `b` consume nothing from `a`.
            (rest, Some(Component::Insert(s))) => {
                out.insert(&s);
                ca = rest;
                cb = ib.next();
            }
            (Some(x), Some(y)) => {
                let n = x.len().min(y.len());
                let (hx, tx) = x.split_at(n);
                let (hy, ty) = y.split_at(n);
                match (hx, hy) {
                    (Component::Retain(n), Component::Retain(_)) => {
                        out.retain(n);
                    }
                    (Component::Retain(n), Component::Delete(_)) => {
                        out.delete(n);
                    }
                    (Component::Insert(s), Component::Retain(_)) => {
                        out.insert(&s);
                    }
                    // Text inserted by `a` and deleted by `b` cancels out.
                    (Component::Insert(_), Component::Delete(_)) => {}
                    (x, y) => {
                        return Err(OtError::IncompatibleOperation {
                            expected: x.len(),
                            actual: y.len(),
                        })
                    }
                }
                ca = tx.or_else(|| ia.next());
                cb = ty.or_else(|| ib.next());
            }
            (Some(x), None) => {
                return Err(OtError::IncompatibleOperation {
                    expected: x.len(),
                    actual: 0,
                })
            }
            (None, Some(y)) => {
                return Err(OtError::IncompatibleOperation {
                    expected: 0,
                    actual: y.len(),
                })
            }
        }
    }

    Ok(out)
}

/// Compose a non-empty sequence left to right.
pub fn compose_all<'a, I>(ops: I) -> Result<Option<TextOp>, OtError>
where
    I: IntoIterator<Item = &'a TextOp>,
{
    ops.into_iter().try_fold(None, |acc: Option<TextOp>, op| match acc {
        None => Ok(Some(op.clone())),
        Some(prev) => compose(&prev, op).map(Some),
    })
}

/// Rebase two concurrent operations against each other.
///
/// Returns `(a', b')` where `a'` applies after `b` and `b'` applies after
/// `a`. `tie` decides whose insert lands first at a shared position.
pub fn transform(a: &TextOp, b: &TextOp, tie: Tie) -> Result<(TextOp, TextOp), OtError> {
    if a.base_len() != b.base_len() {
        return Err(OtError::IncompatibleOperation {
            expected: a.base_len(),
            actual: b.base_len(),
        });
    }

    let mut a_prime = TextOp::new();
    let mut b_prime = TextOp::new();
    let mut ia = a.components().iter().cloned();
    let mut ib = b.components().iter().cloned();
    let mut ca = ia.next();
    let mut cb = ib.next();

    loop {
        let a_inserts = matches!(ca, Some(Component::Insert(_)));
        let b_inserts = matches!(cb, Some(Component::Insert(_)));

        if a_inserts && (!b_inserts || tie == Tie::Left) {
            if let Some(Component::Insert(s)) = ca.take() {
                b_prime.retain(s.chars().count());
                a_prime.insert(&s);
            }
            ca = ia.next();
            continue;
        }
        if b_inserts {
            if let Some(Component::Insert(s)) = cb.take() {
                a_prime.retain(s.chars().count());
                b_prime.insert(&s);
            }
            cb = ib.next();
            continue;
        }

        match (ca.take(), cb.take()) {
            (None, None) => break,
            (Some(x), Some(y)) => {
                let n = x.len().min(y.len());
                let (hx, tx) = x.split_at(n);
                let (hy, ty) = y.split_at(n);
                match (hx, hy) {
                    (Component::Retain(n), Component::Retain(_)) => {
                        a_prime.retain(n);
                        b_prime.retain(n);
                    }
                    // Both deleted the same span: nothing left to do on either side.
                    (Component::Delete(_), Component::Delete(_)) => {}
                    (Component::Delete(n), Component::Retain(_)) => {
                        a_prime.delete(n);
                    }
                    (Component::Retain(n), Component::Delete(_)) => {
                        b_prime.delete(n);
                    }
                    (x, y) => {
                        return Err(OtError::IncompatibleOperation {
                            expected: x.len(),
                            actual: y.len(),
                        })
                    }
                }
                ca = tx.or_else(|| ia.next());
                cb = ty.or_else(|| ib.next());
            }
            (Some(x), None) => {
                return Err(OtError::IncompatibleOperation {
                    expected: x.len(),
                    actual: 0,
                })
            }
            (None, Some(y)) => {
                return Err(OtError::IncompatibleOperation {
                    expected: 0,
                    actual: y.len(),
                })
            }
        }
    }

    Ok((a_prime, b_prime))
}

impl Operation {
    /// Transform two concurrent operations, breaking insert ties by
    /// [`Operation::orders_before`]. Metadata is carried over unchanged.
    pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
        let tie = if a.orders_before(b) { Tie::Left } else { Tie::Right };
        let (a_ops, b_ops) = transform(&a.ops, &b.ops, tie)?;
        Ok((
            Operation { ops: a_ops, ..a.clone() },
            Operation { ops: b_ops, ..b.clone() },
        ))
    }

    /// Rebase `self` so it applies after `applied`, which was accepted
    /// concurrently.
    pub fn rebase_onto(&self, applied: &Operation) -> Result<Operation, OtError> {
        Operation::transform(self, applied).map(|(rebased, _)| rebased)
    }
}
