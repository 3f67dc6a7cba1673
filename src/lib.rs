//! # Promptwright
//!
//! Declarative LLM tasks for Rust: describe a unit of work as a typed signature plus a
//! natural-language instruction block, and let the pipeline turn it into a backend request and
//! the backend's raw text back into a value of the declared type.
//!
//! ## Features
//!
//! - **Typed Schemas**: Declared types become textual schemas embedded in the prompt
//! - **Tolerant Parsing**: JSON fragments are extracted from free text and coerced into the declared type
//! - **Chain of Thought**: A graph of deferred calls compiles into a single request
//! - **Hooks & Streaming**: Middleware around every invocation, streamed answers with deferred cleanup
//! - **Optional LLM Integration**: A blocking Ollama backend behind the `llm` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use promptwright::prelude::*;
//! use std::sync::Arc;
//!
//! # fn backend() -> Arc<dyn Backend> { unimplemented!() }
//! let task = Task::builder()
//!     .name("extract_phone_numbers")
//!     .instructions("Extract the phone numbers from the text\n:param text: the text to scan")
//!     .signature(signature!("text: string -> List[string]"))
//!     .build();
//!
//! let runtime = TaskRuntime::new(backend(), RuntimeConfig::default());
//! let mut args = Args::new();
//! args.insert("text".into(), "call 555-1234".into());
//! let numbers: Vec<String> = runtime.call_as(&task, args)?;
//! # Ok::<(), TaskError>(())
//! ```
//!
//! ## Module Organization
//!
//! - [`llm`]: Messages, backend trait and (feature `llm`) the Ollama backend
//! - [`prelude`]: Commonly used types and traits (import with `use promptwright::prelude::*`)

// ============================================================================
// Core Module
// ============================================================================

mod core;

pub mod llm;

// ============================================================================
// Public Re-exports - Granular Imports
// ============================================================================

// Types and schemas
pub use crate::core::schema::{TypeSchemaResolver, escape_braces, unescape_braces};
pub use crate::core::types::{Describe, Primitive, RecordBuilder, RecordField, TypeDescriptor};

// Declarations
pub use crate::core::semantic::{InstructionModel, Param, ReturnDoc, SignatureModel, TaskMetadata};
pub use crate::core::task::{Task, TaskBuilder};

// Compilation and parsing
pub use crate::core::parser::{ResponseParser, ResultMode, coerce};
pub use crate::core::prompt::{
    CompileWarning, CompiledPrompt, DEFAULT_RETURN_NAME, MessageTemplate, PromptCompiler,
    ReturnSchema, TemplateSyntax,
};
pub use crate::core::template::{
    Args, Template, has_control_syntax, render_control, render_placeholders,
};

// Deferred calls and chains
pub use crate::core::chain::{ChainCompiler, ChainStep, CompiledChain};
pub use crate::core::future::{Arg, FutureTask, PREVIOUS_STEP_SENTINEL};

// Execution
pub use crate::core::hooks::{InterceptHook, LoggingHook, RecordingHook, TaskHook, TraceEntry};
pub use crate::core::runtime::{Invocation, InvocationState, RuntimeConfig, TaskRuntime};
pub use crate::core::stream::{Completion, ResponseStream};

// Conversations
pub use crate::core::chat::{Chat, ChatBuilder};
pub use crate::core::history::{FileHistory, HistoryStore, InMemoryHistory};

// Errors
pub use crate::core::error::{HistoryError, ParseFailure, ParseFailureKind, TaskError};
pub use llm::BackendError;

// ============================================================================
// Prelude Module - Convenient Bulk Imports
// ============================================================================

/// The main prelude: imports everything needed to declare, run and chain tasks.
///
/// # Example
/// ```rust
/// use promptwright::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        // Deferred calls
        Arg,
        Args,
        // Conversations
        Chat,
        Describe,
        FutureTask,
        HistoryStore,
        InMemoryHistory,
        // Execution
        LoggingHook,
        RecordingHook,
        ResponseStream,
        RuntimeConfig,
        SignatureModel,
        // Declarations
        Task,
        TaskError,
        TaskHook,
        TaskMetadata,
        TaskRuntime,
        TypeDescriptor,
    };
    pub use crate::llm::{Backend, LlmParams, LlmResponse, Message, Role};
    pub use crate::signature;
}

// ============================================================================
// Re-export commonly used external types for convenience
// ============================================================================

pub use serde_json::Value as JsonValue;

// ============================================================================
// Library Metadata
// ============================================================================

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate.
pub const NAME: &str = env!("CARGO_PKG_NAME");
