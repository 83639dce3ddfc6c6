//! The built-in compiler service.
//!
//! Compiling a unit reads it, loads everything its `ns` form requires, expands
//! macros into core forms and hands the result to the eval strategy as text.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use lumen_eval::{is_builtin_namespace, transform_forms, Value};
use lumen_reader::{read_all, CollKind, Form, Position, Span};

use crate::analyzer::{Analyzer, NsDecl, Require};
use crate::error::{CompileError, Result};
use crate::module::{ModuleKind, ModuleRequest};
use crate::service::{CompiledUnit, CompilerService, Strategies};

type UnitFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + 'a>>;

/// Compiles Lumen source into core-form units.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    _private: (),
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile_unit<'a, S: Strategies>(
        &'a self,
        source: &'a str,
        namespace: &'a str,
        cache_hint: Option<PathBuf>,
        strategies: &'a mut S,
    ) -> UnitFuture<'a> {
        Box::pin(async move {
            let forms = read_all(source).map_err(|e| CompileError::read(namespace, e))?;
            let analyzer = Analyzer::new();

            let declared = forms
                .first()
                .map(|form| analyzer.parse_ns(form))
                .transpose()
                .map_err(|message| CompileError::semantic(namespace, message))?
                .flatten();
            let (decl, body) = match declared {
                Some(decl) => (decl, &forms[1..]),
                None => (
                    NsDecl {
                        name: namespace.to_string(),
                        requires: Vec::new(),
                    },
                    &forms[..],
                ),
            };

            for require in &decl.requires {
                if is_builtin_namespace(&require.namespace) || !strategies.mark_loaded(&loaded_key(require)) {
                    continue;
                }
                let request = ModuleRequest::for_namespace(&require.namespace, require.is_macro);
                let record = strategies.load(&request).await?.ok_or_else(|| CompileError::ModuleNotFound {
                    module: require.namespace.clone(),
                    from: decl.name.clone(),
                })?;
                tracing::debug!("loading {} from {}", require.namespace, record.path.display());
                match record.kind {
                    ModuleKind::Source => {
                        self.compile_unit(&record.source, &require.namespace, Some(record.path.clone()), strategies)
                            .await?;
                    }
                    ModuleKind::Compiled => {
                        strategies
                            .eval(CompiledUnit {
                                source_text: record.source,
                                namespace: require.namespace.clone(),
                                cache_hint: Some(record.path),
                            })
                            .await?;
                    }
                }
            }

            let mut unit = Vec::with_capacity(body.len() + 1);
            unit.push(header(&decl));
            for form in body {
                let expanded = analyzer
                    .expand(form)
                    .map_err(|message| CompileError::semantic(&decl.name, message))?;
                unit.push(expanded);
            }

            if let Err(e) = transform_forms(&unit, &decl.name) {
                return Err(match e {
                    lumen_eval::Error::Syntax(message) => CompileError::semantic(&decl.name, message),
                    other => CompileError::Eval(other),
                });
            }

            let source_text = unit.iter().map(Form::to_string).collect::<Vec<_>>().join("\n");
            tracing::debug!("compiled {} ({} forms)", decl.name, unit.len());
            strategies
                .eval(CompiledUnit {
                    source_text,
                    namespace: decl.name.clone(),
                    cache_hint,
                })
                .await
        })
    }
}

impl CompilerService for Compiler {
    async fn compile<S: Strategies>(&self, source: &str, namespace: &str, strategies: &mut S) -> Result<Value> {
        self.compile_unit(source, namespace, None, strategies).await
    }
}

/// Entry in the loaded set. Macro and runtime loads of one namespace
/// resolve to different files, so they are tracked apart.
fn loaded_key(require: &Require) -> String {
    if require.is_macro {
        format!("{}$macros", require.namespace)
    } else {
        require.namespace.clone()
    }
}

/// `(ns* name {alias ns ...} {referred-name ns ...})`
fn header(decl: &NsDecl) -> Form {
    let span = Span::point(Position::new(1, 1));
    let table = |entries: std::collections::BTreeMap<&str, &str>| {
        let items = entries
            .into_iter()
            .flat_map(|(key, ns)| [Form::symbol(key, span), Form::symbol(ns, span)])
            .collect();
        Form::collection(CollKind::Map, items, span)
    };
    Form::list(
        vec![
            Form::symbol("ns*", span),
            Form::symbol(decl.name.as_str(), span),
            table(decl.aliases()),
            table(decl.refers()),
        ],
        span,
    )
}
