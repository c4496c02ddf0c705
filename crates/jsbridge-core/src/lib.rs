//! jsbridge-core: Host/JavaScript marshaling and embedding layer
//!
//! This crate lets a Rust host embed objects, types and callbacks into a
//! script runtime and exchange values with it. The runtime itself sits
//! behind the [`runtime::ScriptRuntime`] trait; [`memory::MemoryRuntime`] is
//! the bundled in-process backend.
//!
//! # Architecture
//!
//! ```text
//! caller thread ──► ScriptEngine ──► ScriptDispatcher (worker thread)
//!                                          │
//!                      ValueCodec ◄────────┼────────► PropertyPathResolver
//!                          │               │
//!                EmbeddingRegistry    ScriptRuntime ──► MemberDispatcher
//!                                          │
//!                                   ErrorTranslator ──► Error
//! ```
//!
//! # Modules
//!
//! - `engine`: `ScriptEngine` façade and builder
//! - `dispatcher`: Dedicated script thread with FIFO task queue
//! - `codec`: Host ↔ script value conversion and numeric narrowing
//! - `registry`: Identity-keyed embedding store with finalize-driven eviction
//! - `member`: Field/property/method/delegate dispatch with reflection gating
//! - `path`: Dotted property paths and their resolution
//! - `error`: Error taxonomy and native error translation
//! - `runtime`: Script-runtime contract consumed by the layer
//! - `memory`: In-process reference runtime
//! - `host`: Host object, type and delegate model
//! - `value`: Host value model and typed extraction
//! - `backend`: Process-wide backend conflict coordination
//! - `config`: Engine settings (TOML)
//! - `logging`: Tracing subscriber setup
//! - `shard`: Sharded concurrent map
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod host;
pub mod logging;
pub mod member;
pub mod memory;
pub mod path;
pub mod registry;
pub mod runtime;
pub mod shard;
pub mod value;

pub use backend::{BackendCoordinator, BackendLease};
pub use config::{Config, EngineSettings};
pub use engine::{DEFAULT_DOCUMENT_NAME, PrecompiledScript, ScriptEngine, ScriptEngineBuilder};
pub use error::{CallStackFrame, Error, ErrorCategory, ErrorRecord, Result};
pub use host::{HostDelegate, HostError, HostObjectRef, HostType, HostTypeRef, ParamKind};
pub use memory::{MemoryRuntime, MemoryRuntimeFactory};
pub use runtime::{CallingConvention, RuntimeFactory, RuntimeLimits, ScriptRuntime};
pub use value::{FromHostValue, HostValue, ScriptRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
