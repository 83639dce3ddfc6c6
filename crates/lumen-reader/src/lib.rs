//! Reader and widget annotator for Lumen source.
//!
//! The reader turns buffer text into [`Form`]s carrying source spans and
//! `^metadata` tags. The annotator walks those forms and reports the regions
//! the display swaps for embedded widgets.

pub mod annotate;
pub mod error;
pub mod form;
pub mod reader;

pub use annotate::{annotate, WidgetRegion, EDITOR_TAG};
pub use error::ReadError;
pub use form::{Atom, CollKind, Descend, Form, FormKind, FormVisitor, Position, Span};
pub use reader::{read_all, Reader, MAX_DEPTH};
