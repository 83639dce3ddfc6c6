//! Locates source regions that the display replaces with embedded widgets.
//!
//! A collection form tagged exactly `^editor` marks a widget region. Regions
//! are reported in zero-based, inclusive `(line, column)` coordinates.

use serde::Serialize;

use crate::form::{CollKind, Descend, Form, FormVisitor, Position};
use crate::reader::Reader;

/// Tag that marks a form as a widget.
pub const EDITOR_TAG: &str = "editor";

/// A source range to be replaced by a widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WidgetRegion {
    pub start: Position,
    pub end: Position,
}

impl WidgetRegion {
    fn from_form(form: &Form) -> Self {
        Self {
            start: form.span.start.to_zero_based(),
            end: form.span.end.to_zero_based(),
        }
    }

    /// True when the two regions share at least one character.
    pub fn overlaps(&self, other: &WidgetRegion) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Collects editor-tagged collections in document order.
#[derive(Default)]
struct RegionCollector {
    regions: Vec<WidgetRegion>,
}

impl FormVisitor for RegionCollector {
    fn visit_collection(&mut self, form: &Form, _kind: CollKind, _items: &[Form]) -> Descend {
        if form.has_exact_tag(EDITOR_TAG) {
            self.regions.push(WidgetRegion::from_form(form));
            // Nested widgets would overlap their parent.
            Descend::No
        } else {
            Descend::Yes
        }
    }
}

/// Find every widget region in `source`.
///
/// Reading stops at the first malformed or incomplete form; the regions found
/// before it are returned.
pub fn annotate(source: &str) -> Vec<WidgetRegion> {
    let mut collector = RegionCollector::default();
    for result in Reader::new(source) {
        match result {
            Ok(form) => form.accept(&mut collector),
            Err(e) => {
                tracing::debug!("annotation stopped at {}: {}", e.position(), e);
                break;
            }
        }
    }
    collector.regions
}
