//! Document Model - the shared template value and its patch representation
//!
//! This crate provides the editable [`Template`] document together with the
//! patch engine used to describe every change to it. Edits are expressed as
//! closures over a mutable draft; the engine diffs the draft against the
//! original snapshot and yields forward and inverse [`Patch`] sequences.
//!
//! # Example
//!
//! ```
//! use doc_model::{apply_patches, produce_with_patches, DocModelError, Template};
//!
//! let base = Template::new("demo");
//! let produced = produce_with_patches(&base, |draft: &mut Template| {
//!     draft.resize(100, 100);
//!     Ok::<(), DocModelError>(())
//! })
//! .unwrap();
//!
//! assert_eq!(produced.next.color, "blue");
//! let restored: Template = apply_patches(&produced.next, &produced.inverse_patches).unwrap();
//! assert_eq!(restored, base);
//! ```

mod engine;
mod error;
mod patch;
mod template;

pub use engine::*;
pub use error::*;
pub use patch::*;
pub use template::*;
