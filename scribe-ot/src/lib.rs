//! # scribe-ot: Operation model and transform engine
//!
//! Pure, synchronous building blocks for real-time text collaboration:
//!
//! - [`operation`]: Retain/Insert/Delete operations, validation, the
//!   canonical wire codec (bincode) and `apply`
//! - [`transform`]: `compose` for sequential edits and `transform` for
//!   concurrent ones, with a deterministic insert tie-break
//! - [`hash`]: BLAKE3 content hashes recorded with every accepted edit
//!
//! No I/O and no async here; the collaboration engine lives in
//! `scribe-collab`.

pub mod error;
pub mod hash;
pub mod operation;
pub mod transform;

pub use error::OtError;
pub use hash::ContentHash;
pub use operation::{now_millis, validate, Component, Operation, TextOp};
pub use transform::{compose, compose_all, transform, Tie};
