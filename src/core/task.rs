use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;

use crate::core::error::{ParseFailure, TaskError};
use crate::core::future::{Arg, FutureTask};
use crate::core::parser::ResponseParser;
use crate::core::prompt::{CompiledPrompt, PromptCompiler, ReturnSchema};
use crate::core::semantic::{InstructionModel, SignatureModel, TaskMetadata};
use crate::core::template::Args;
use crate::core::types::{Describe, TypeDescriptor};
use crate::llm::{LlmParams, Message};

/// A declared unit of work: a typed signature, natural-language instructions and the request
/// template compiled from them.
///
/// Everything is derived once in [`TaskBuilder::build`]; calling a task only substitutes
/// argument values.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    signature: SignatureModel,
    instructions: InstructionModel,
    prompt: CompiledPrompt,
    params: Option<LlmParams>,
    signature_hash: String,
    instruction_hash: String,
}

impl Task {
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &SignatureModel {
        &self.signature
    }

    pub fn instructions(&self) -> &InstructionModel {
        &self.instructions
    }

    pub fn prompt(&self) -> &CompiledPrompt {
        &self.prompt
    }

    pub fn return_schema(&self) -> &ReturnSchema {
        &self.prompt.return_schema
    }

    /// Task-level backend parameters, layered over the runtime's.
    pub fn params(&self) -> Option<&LlmParams> {
        self.params.as_ref()
    }

    pub fn signature_hash(&self) -> &str {
        &self.signature_hash
    }

    pub fn instruction_hash(&self) -> &str {
        &self.instruction_hash
    }

    /// Check call arguments against the signature.
    ///
    /// Unknown names are rejected. A declared parameter that is absent is filled with `null`
    /// when its type accepts it and reported as missing otherwise. Tasks without declared
    /// parameters accept any arguments.
    pub fn prepare_args(&self, mut args: Args) -> Result<Args, TaskError> {
        if self.signature.params.is_empty() {
            return Ok(args);
        }
        if let Some(unknown) = args.keys().find(|k| !self.signature.has_param(k)) {
            return Err(TaskError::InvalidArguments(format!(
                "task '{}' has no parameter '{}'",
                self.name, unknown
            )));
        }
        for param in &self.signature.params {
            if args.contains_key(&param.name) {
                continue;
            }
            if param.ty.is_nullable() {
                args.insert(param.name.clone(), Value::Null);
            } else {
                return Err(TaskError::MissingArgument(param.name.clone()));
            }
        }
        Ok(args)
    }

    /// Render the request messages for one call.
    pub fn render(&self, args: &Args) -> Result<Vec<Message>, TaskError> {
        self.prompt.render(args)
    }

    /// Parse a raw backend answer into the declared return value.
    pub fn parse(&self, raw: &str) -> Result<Value, ParseFailure> {
        ResponseParser::new(self.return_schema()).parse(raw)
    }

    /// Defer a call: bind arguments, some of which may be other deferred calls.
    pub fn plan<K, I>(self: &Arc<Self>, args: I) -> Result<Arc<FutureTask>, TaskError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Arg)>,
    {
        let bound: Vec<(String, Arg)> = args.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let unknown = bound
            .iter()
            .find(|(k, _)| !self.signature.params.is_empty() && !self.signature.has_param(k));
        if let Some((unknown, _)) = unknown {
            return Err(TaskError::InvalidArguments(format!(
                "task '{}' has no parameter '{}'",
                self.name, unknown
            )));
        }
        Ok(Arc::new(FutureTask::new(Arc::clone(self), bound)))
    }
}

/// Builder for [`Task`].
#[derive(Debug, Clone, Default)]
pub struct TaskBuilder {
    name: Option<String>,
    instructions: Option<String>,
    signature: SignatureModel,
    metadata: TaskMetadata,
    params: Option<LlmParams>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The instruction block: freeform text followed by `:param` / `:return` lines.
    pub fn instructions(mut self, block: impl Into<String>) -> Self {
        self.instructions = Some(block.into());
        self
    }

    pub fn signature(mut self, signature: impl Into<SignatureModel>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn param(mut self, name: impl Into<String>, ty: TypeDescriptor) -> Self {
        self.signature = self.signature.param(name, ty);
        self
    }

    pub fn param_of<T: Describe + ?Sized>(mut self, name: impl Into<String>) -> Self {
        self.signature = self.signature.param_of::<T>(name);
        self
    }

    pub fn returns(mut self, ty: TypeDescriptor) -> Self {
        self.signature = self.signature.returns(ty);
        self
    }

    pub fn returns_of<T: Describe + ?Sized>(mut self) -> Self {
        self.signature = self.signature.returns_of::<T>();
        self
    }

    pub fn metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Shorthand for [`TaskMetadata::return_name`].
    pub fn return_name(mut self, name: impl Into<String>) -> Self {
        self.metadata = self.metadata.return_name(name);
        self
    }

    pub fn llm_params(mut self, params: LlmParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn build(self) -> Arc<Task> {
        let name = self.name.unwrap_or_else(|| {
            let id = format!("autogen_{}", uuid::Uuid::new_v4().simple());
            log::warn!(
                "Auto-generated task name '{}'. For stable traces, use .name().",
                id
            );
            id
        });

        let mut instructions = InstructionModel::parse(self.instructions.as_deref().unwrap_or_default());
        self.metadata.apply(&mut instructions);

        let prompt = PromptCompiler::compile(&instructions, &self.signature);
        for warning in &prompt.warnings {
            log::warn!("Task '{}': {}", name, warning);
        }

        let signature_hash = self.signature.structural_hash();
        let instruction_hash = instruction_hash(&instructions);
        log::debug!(
            "Compiled task '{}' (signature {}, instructions {}, structured: {})",
            name,
            signature_hash,
            instruction_hash,
            prompt.return_schema.structured
        );

        Arc::new(Task {
            name,
            signature: self.signature,
            instructions,
            prompt,
            params: self.params,
            signature_hash,
            instruction_hash,
        })
    }
}

fn instruction_hash(instructions: &InstructionModel) -> String {
    let mut hasher = DefaultHasher::new();
    instructions.freeform.hash(&mut hasher);
    for (name, doc) in &instructions.params {
        name.hash(&mut hasher);
        doc.hash(&mut hasher);
    }
    instructions.return_name().hash(&mut hasher);
    instructions.return_doc().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Args {
        value.as_object().cloned().unwrap_or_default()
    }

    fn extractor() -> Arc<Task> {
        Task::builder()
            .name("extract_phone_numbers")
            .instructions("Extract the phone numbers from the provided text\n:param text: the text to scan")
            .signature(crate::signature!("text: string, country: Optional[string] -> List[string]"))
            .build()
    }

    #[test]
    fn test_build_compiles_prompt() {
        let task = extractor();
        assert_eq!(task.name(), "extract_phone_numbers");
        assert!(task.return_schema().structured);
        assert_eq!(task.signature_hash(), task.signature().structural_hash());
        assert_eq!(task.prompt().messages.len(), 2);
    }

    #[test]
    fn test_autogenerated_name() {
        let task = Task::builder().instructions("Say hi").build();
        assert!(task.name().starts_with("autogen_"));
    }

    #[test]
    fn test_prepare_args() {
        let task = extractor();
        let prepared = task.prepare_args(args(json!({"text": "x"}))).unwrap();
        assert_eq!(prepared.get("country"), Some(&Value::Null));

        assert!(matches!(
            task.prepare_args(args(json!({"text": "x", "bogus": 1}))),
            Err(TaskError::InvalidArguments(_))
        ));
        assert!(matches!(
            task.prepare_args(Args::new()),
            Err(TaskError::MissingArgument(ref n)) if n == "text"
        ));
    }

    #[test]
    fn test_metadata_names_result() {
        let task = Task::builder()
            .name("summarize")
            .instructions("Summarize the text")
            .param_of::<String>("text")
            .returns_of::<String>()
            .return_name("summary")
            .build();
        assert_eq!(task.return_schema().name, "summary");
        assert_eq!(task.parse(r#"{"summary": "short"}"#).unwrap(), json!("short"));
    }

    #[test]
    fn test_plan_rejects_unknown_parameter() {
        let task = extractor();
        assert!(task.plan([("text", Arg::from("hi"))]).is_ok());
        assert!(task.plan([("nope", Arg::from("hi"))]).is_err());
    }

    #[test]
    fn test_instruction_hash_tracks_docs() {
        let a = Task::builder().name("a").instructions("Do\n:param x: one").param_of::<i32>("x").build();
        let b = Task::builder().name("b").instructions("Do\n:param x: two").param_of::<i32>("x").build();
        assert_eq!(a.signature_hash(), b.signature_hash());
        assert_ne!(a.instruction_hash(), b.instruction_hash());
    }
}
