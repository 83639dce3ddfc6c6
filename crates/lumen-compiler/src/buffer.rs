//! Editor buffers and the save/load primitives.

use std::path::{Path, PathBuf};

use lumen_reader::{annotate, WidgetRegion};

use crate::error::Result;
use crate::module::Extensions;
use crate::vfs::FileSystem;

/// Text being edited, with its widget regions and a pending-changes flag.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    text: String,
    dirty: bool,
    regions: Vec<WidgetRegion>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clean buffer holding `text`.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let regions = annotate(&text);
        Self {
            text,
            dirty: false,
            regions,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn regions(&self) -> &[WidgetRegion] {
        &self.regions
    }

    /// Replace the text and re-annotate the whole buffer.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.regions = annotate(&self.text);
        self.dirty = true;
    }

    /// Write the buffer to `folder/file` and clear the pending-changes flag.
    pub fn save<F: FileSystem>(&mut self, fs: &F, folder: impl AsRef<Path>, file: &str) -> Result<PathBuf> {
        let path = folder.as_ref().join(file);
        fs.write_file_sync(&path, &self.text)?;
        self.dirty = false;
        tracing::debug!("saved {}", path.display());
        Ok(path)
    }

    /// Read `folder/file` into a clean buffer.
    pub fn load<F: FileSystem>(fs: &F, folder: impl AsRef<Path>, file: &str) -> Result<Buffer> {
        let path = folder.as_ref().join(file);
        let text = fs.read_file_sync(&path)?;
        Ok(Buffer::from_text(text))
    }
}

/// Names of the loadable files directly inside `folder`, sorted.
pub fn list_files<F: FileSystem>(fs: &F, folder: impl AsRef<Path>, extensions: &Extensions) -> Result<Vec<String>> {
    let loadable = extensions.loadable();
    let mut names: Vec<String> = fs
        .read_dir_sync(folder.as_ref())?
        .into_iter()
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| loadable.contains(&ext))
        })
        .filter_map(|path| Some(path.file_name()?.to_str()?.to_string()))
        .collect();
    names.sort();
    Ok(names)
}
