//! Sandboxed runtime for Lumen programs.
//!
//! Programs are lowered into [`Code`] by [`transform`], which inserts a
//! checkpoint before every call and loop iteration. A [`Sandbox`] runs them
//! on an explicit interpreter loop that polls for halt requests at those
//! checkpoints and periodically yields to the host scheduler. Uncaught
//! `throw`s surface as `Error::Exception`, native failures as
//! `Error::Runtime`, and a halt as `Error::Halted`.

mod bridge;
mod builtins;
mod code;
mod env;
mod error;
mod machine;
mod output;
mod runtime;
mod stack;
mod transform;
mod value;

pub use bridge::{HostBridge, CORE_NS, HOST_NS};
pub use builtins::{NativeCtx, MAX_RANGE};
pub use code::{Code, Program};
pub use error::Error;
pub use output::{Fragment, FragmentKind, OutputSink};
pub use runtime::{HaltHandle, RuntimeOptions, RuntimeState, Sandbox};
pub use transform::{is_builtin_namespace, transform, transform_forms};
pub use value::{ErrorValue, Namespace, Seq, Value};

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
