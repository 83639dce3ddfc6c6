//! The output sink: printed text of the active run, in execution order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Whether a fragment is program output or an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Output,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub text: String,
}

/// Append-only log of printed fragments.
///
/// Cloning yields another handle to the same log, so the runtime can write
/// while the display reads.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    fragments: Arc<Mutex<Vec<Fragment>>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Fragment>> {
        self.fragments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append program output.
    pub fn print(&self, text: impl Into<String>) {
        self.push(FragmentKind::Output, text.into());
    }

    /// Append an error report.
    pub fn error(&self, text: impl Into<String>) {
        self.push(FragmentKind::Error, text.into());
    }

    fn push(&self, kind: FragmentKind, text: String) {
        self.lock().push(Fragment { kind, text });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of every fragment so far.
    pub fn fragments(&self) -> Vec<Fragment> {
        self.lock().clone()
    }

    /// Fragments appended at or after index `from`.
    pub fn fragments_since(&self, from: usize) -> Vec<Fragment> {
        self.lock().iter().skip(from).cloned().collect()
    }

    /// Text of every fragment, in order.
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().map(|f| f.text.clone()).collect()
    }

    /// The whole log joined by newlines, as the display renders it.
    pub fn contents(&self) -> String {
        self.lines().join("\n")
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_keep_order_and_kind() {
        let sink = OutputSink::new();
        sink.print("one");
        sink.error("boom");
        sink.print("two");

        assert_eq!(sink.contents(), "one\nboom\ntwo");
        let kinds: Vec<_> = sink.fragments().iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FragmentKind::Output, FragmentKind::Error, FragmentKind::Output]);
        assert_eq!(sink.fragments_since(2).len(), 1);
    }

    #[test]
    fn test_clones_share_the_log() {
        let sink = OutputSink::new();
        let display = sink.clone();
        sink.print("hello");
        assert_eq!(display.lines(), vec!["hello".to_string()]);

        display.clear();
        assert!(sink.is_empty());
    }
}
