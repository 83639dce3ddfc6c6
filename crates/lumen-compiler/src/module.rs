//! Module resolution against a [`FileSystem`].
//!
//! A require of `app.widgets.slider-knob` is looked up as
//! `app/widgets/slider_knob.<ext>`, trying each candidate extension in order.
//! The first file that exists wins. Nothing is cached: every call reads the
//! filesystem again.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{CompileError, Result};
use crate::vfs::FileSystem;

/// A request to load the namespace `name` from `path` (without extension).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    pub name: String,
    /// Macro namespaces only resolve to macro or combined sources.
    pub is_macro: bool,
    pub path: PathBuf,
}

impl ModuleRequest {
    pub fn new(name: impl Into<String>, is_macro: bool, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            is_macro,
            path: path.into(),
        }
    }

    /// Derive the path from the namespace name: dots separate directories and
    /// dashes become underscores.
    pub fn for_namespace(name: &str, is_macro: bool) -> Self {
        let path: PathBuf = name.split('.').map(|segment| segment.replace('-', "_")).collect();
        Self::new(name, is_macro, path)
    }
}

/// Whether a resolved file still needs compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// Language source, compiled before evaluation.
    Source,
    /// Already compiled, evaluated as is.
    Compiled,
}

/// A resolved module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub kind: ModuleKind,
    pub source: String,
    pub path: PathBuf,
}

/// File extensions tried by the resolver, without the leading dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extensions {
    pub macro_source: String,
    pub combined: String,
    pub source: String,
    pub script: String,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            macro_source: "clj".to_string(),
            combined: "cljc".to_string(),
            source: "cljs".to_string(),
            script: "js".to_string(),
        }
    }
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn macro_source(mut self, ext: impl Into<String>) -> Self {
        self.macro_source = ext.into();
        self
    }

    pub fn combined(mut self, ext: impl Into<String>) -> Self {
        self.combined = ext.into();
        self
    }

    pub fn source(mut self, ext: impl Into<String>) -> Self {
        self.source = ext.into();
        self
    }

    pub fn script(mut self, ext: impl Into<String>) -> Self {
        self.script = ext.into();
        self
    }

    /// Extensions a buffer can be saved as or loaded from.
    pub fn loadable(&self) -> [&str; 3] {
        [self.source.as_str(), self.combined.as_str(), self.macro_source.as_str()]
    }
}

/// Resolves module requests against a filesystem.
pub struct ModuleResolver<F> {
    fs: F,
    /// Directory that request paths are relative to.
    root: PathBuf,
    extensions: Extensions,
}

impl<F: FileSystem> ModuleResolver<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            root: PathBuf::new(),
            extensions: Extensions::default(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Candidate files for `request`, in the order they are tried.
    pub fn candidates(&self, request: &ModuleRequest) -> Vec<(PathBuf, ModuleKind)> {
        let ext = &self.extensions;
        let tried: Vec<(&str, ModuleKind)> = if request.is_macro {
            vec![
                (ext.macro_source.as_str(), ModuleKind::Source),
                (ext.combined.as_str(), ModuleKind::Source),
            ]
        } else {
            vec![
                (ext.source.as_str(), ModuleKind::Source),
                (ext.combined.as_str(), ModuleKind::Source),
                (ext.script.as_str(), ModuleKind::Compiled),
            ]
        };
        let base = self.root.join(&request.path);
        tried
            .into_iter()
            .map(|(extension, kind)| (base.with_extension(extension), kind))
            .collect()
    }

    /// Resolve `request` to the first candidate that exists.
    ///
    /// `Ok(None)` when no candidate exists; other read failures are errors.
    pub async fn resolve(&self, request: &ModuleRequest) -> Result<Option<ModuleRecord>> {
        for (path, kind) in self.candidates(request) {
            match self.fs.read_file(&path).await {
                Ok(source) => {
                    tracing::debug!("resolved {} to {}", request.name, path.display());
                    return Ok(Some(ModuleRecord { kind, source, path }));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CompileError::ModuleResolution {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        tracing::debug!("no file found for {}", request.name);
        Ok(None)
    }
}
