pub mod chain;
pub mod chat;
pub mod error;
pub mod future;
pub mod history;
pub mod hooks;
pub mod parser;
pub mod prompt;
pub mod runtime;
pub mod schema;
pub mod semantic;
pub mod stream;
pub mod task;
pub mod template;
pub mod types;
