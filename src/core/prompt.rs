use std::fmt;

use crate::core::error::TaskError;
use crate::core::schema::{TypeSchemaResolver, escape_braces, unescape_braces};
use crate::core::semantic::{InstructionModel, SignatureModel};
use crate::core::template::{self, Args};
use crate::core::types::TypeDescriptor;
use crate::llm::{Message, Role};

/// Key the backend answers under when a task does not name its result.
pub const DEFAULT_RETURN_NAME: &str = "declarai_result";

// ============================================================================
// Return schema
// ============================================================================

/// How a task's answer is requested and read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnSchema {
    /// Top-level key of a structured answer. Never empty.
    pub name: String,
    /// Whether the answer is a JSON object keyed by `name`.
    pub structured: bool,
    /// Resolved type schema, brace-escaped for placeholder templates.
    pub schema: String,
    /// Type the parsed value is coerced into. `None` keeps the raw text.
    pub target: Option<TypeDescriptor>,
    pub doc: Option<String>,
}

impl ReturnSchema {
    /// A structured schema answering under `name`. An empty name falls back to
    /// [`DEFAULT_RETURN_NAME`].
    pub fn structured(name: impl Into<String>, target: TypeDescriptor) -> Self {
        let name = name.into();
        Self {
            name: if name.trim().is_empty() {
                DEFAULT_RETURN_NAME.to_string()
            } else {
                name
            },
            structured: true,
            schema: TypeSchemaResolver::resolve(&target),
            target: Some(target),
            doc: None,
        }
    }

    /// Raw text answer, returned verbatim.
    pub fn text() -> Self {
        Self {
            name: DEFAULT_RETURN_NAME.to_string(),
            structured: false,
            schema: TypeSchemaResolver::resolve(&TypeDescriptor::string()),
            target: None,
            doc: None,
        }
    }

    /// An unstructured answer coerced into `target`.
    pub fn unstructured(target: TypeDescriptor) -> Self {
        Self {
            schema: TypeSchemaResolver::resolve(&target),
            target: Some(target),
            ..Self::text()
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into()).filter(|d: &String| !d.trim().is_empty());
        self
    }

    /// Derive the schema from a task's declarations.
    ///
    /// The answer is structured when the result is named or its type is not a primitive. With
    /// no return name, type or doc at all the schema degrades to raw text and a
    /// [`CompileWarning::MissingReturnMetadata`] is reported.
    pub fn derive(
        instructions: &InstructionModel,
        signature: &SignatureModel,
    ) -> (Self, Option<CompileWarning>) {
        let name = instructions.return_name();
        let doc = instructions.return_doc();
        let target = signature.returns.clone();

        if name.is_none() && target.is_none() && doc.is_none() {
            return (Self::text(), Some(CompileWarning::MissingReturnMetadata));
        }

        let structured = name.is_some() || target.as_ref().is_some_and(|t| !t.is_primitive());
        let schema = if structured {
            Self::structured(
                name.unwrap_or(DEFAULT_RETURN_NAME),
                target.unwrap_or_else(TypeDescriptor::any),
            )
        } else {
            match target {
                Some(target) => Self::unstructured(target),
                None => Self::text(),
            }
        };
        (schema.with_doc(doc.unwrap_or_default()), None)
    }

    /// True when the parsed value is the raw text.
    pub fn is_text(&self) -> bool {
        !self.structured && self.target.as_ref().is_none_or(TypeDescriptor::is_text)
    }

    /// `"name": schema  # doc`, escaped for placeholder templates.
    pub fn output_schema(&self) -> String {
        let mut line = format!("\"{}\": {}", self.name, self.schema);
        if let Some(doc) = &self.doc {
            line.push_str("  # ");
            line.push_str(&escape_braces(doc.trim()));
        }
        line
    }

    /// [`Self::output_schema`] as the backend reads it.
    pub fn plain_output_schema(&self) -> String {
        unescape_braces(&self.output_schema())
    }

    /// System instruction for a one-shot structured answer.
    pub fn instruction_prompt(&self) -> String {
        format!(
            "You are a REST api endpoint.You only answer in JSON structures\nwith a single key named '{}', nothing else.\nThe expected format is:\n{}",
            self.name,
            self.output_schema()
        )
    }

    /// System instruction appended to a chat's system message.
    pub fn chat_prompt(&self) -> String {
        format!(
            "Your responses should be a JSON structure with a single key named '{}', nothing else. The expected format is: {}",
            self.name,
            self.output_schema()
        )
    }

    /// `respond only with the value of type ...` for unstructured answers of non-text type.
    pub fn unstructured_prompt(&self) -> Option<String> {
        if self.structured || self.is_text() {
            return None;
        }
        let mut line = format!("respond only with the value of type {}:", self.schema);
        if let Some(doc) = &self.doc {
            line.push_str("  # ");
            line.push_str(&escape_braces(doc.trim()));
        }
        Some(line)
    }
}

// ============================================================================
// Compiled prompt
// ============================================================================

/// Something the compiler recovered from on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileWarning {
    /// No return name, type or doc: the answer is read back as raw text.
    MissingReturnMetadata,
}

impl fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileWarning::MissingReturnMetadata => f.write_str(
                "couldn't create an output schema, falling back to unstructured output \
                 (add a return type, a return doc or a return name)",
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSyntax {
    /// `{name}` placeholders with `{{`/`}}` escapes.
    Placeholder,
    /// Control template (`{{ path }}`, `{% for %}`, `{% if %}`).
    Control,
}

/// A role-tagged message whose text still holds placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub role: Role,
    pub text: String,
    pub syntax: TemplateSyntax,
}

impl MessageTemplate {
    pub fn new(role: Role, text: impl Into<String>, syntax: TemplateSyntax) -> Self {
        Self {
            role,
            text: text.into(),
            syntax,
        }
    }

    pub fn render_text(&self, args: &Args) -> Result<String, TaskError> {
        match self.syntax {
            TemplateSyntax::Placeholder => template::render_placeholders(&self.text, args),
            TemplateSyntax::Control => template::render_control(&self.text, args),
        }
    }

    pub fn render(&self, args: &Args) -> Result<Message, TaskError> {
        Ok(Message::new(self.role, self.render_text(args)?))
    }
}

/// The request template of a task. Fixed at definition time, rendered on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPrompt {
    pub messages: Vec<MessageTemplate>,
    pub return_schema: ReturnSchema,
    pub warnings: Vec<CompileWarning>,
}

impl CompiledPrompt {
    /// Substitute argument values into every message.
    pub fn render(&self, args: &Args) -> Result<Vec<Message>, TaskError> {
        self.messages.iter().map(|m| m.render(args)).collect()
    }

    /// The user instruction message.
    pub fn instruction(&self) -> Option<&MessageTemplate> {
        self.messages.iter().find(|m| m.role == Role::User)
    }
}

// ============================================================================
// Compiler
// ============================================================================

/// Turns instructions and a signature into a [`CompiledPrompt`].
pub struct PromptCompiler;

impl PromptCompiler {
    pub fn compile(instructions: &InstructionModel, signature: &SignatureModel) -> CompiledPrompt {
        let (return_schema, warning) = ReturnSchema::derive(instructions, signature);
        Self::compile_with(instructions, signature, return_schema, warning.into_iter().collect())
    }

    /// Compile against an already derived return schema.
    pub fn compile_with(
        instructions: &InstructionModel,
        signature: &SignatureModel,
        return_schema: ReturnSchema,
        warnings: Vec<CompileWarning>,
    ) -> CompiledPrompt {
        let mut messages = Vec::with_capacity(2);

        if return_schema.structured {
            messages.push(MessageTemplate::new(
                Role::System,
                return_schema.instruction_prompt(),
                TemplateSyntax::Placeholder,
            ));
        }

        let syntax = if template::has_control_syntax(&instructions.freeform) {
            TemplateSyntax::Control
        } else {
            TemplateSyntax::Placeholder
        };

        let mut instruction = match syntax {
            TemplateSyntax::Control => instructions.freeform.clone(),
            TemplateSyntax::Placeholder => {
                let inputs = Self::inputs_block(instructions, signature);
                if inputs.is_empty() {
                    instructions.freeform.clone()
                } else {
                    format!("{}\n{}\n", instructions.freeform, inputs)
                }
            }
        };

        if let Some(line) = return_schema.unstructured_prompt() {
            let line = match syntax {
                TemplateSyntax::Control => unescape_braces(&line),
                TemplateSyntax::Placeholder => line,
            };
            if !instruction.is_empty() && !instruction.ends_with('\n') {
                instruction.push('\n');
            }
            instruction.push_str(&line);
        }

        messages.push(MessageTemplate::new(Role::User, instruction, syntax));

        CompiledPrompt {
            messages,
            return_schema,
            warnings,
        }
    }

    /// `Inputs:` followed by one `name: {name}` line per parameter, with its doc inlined.
    fn inputs_block(instructions: &InstructionModel, signature: &SignatureModel) -> String {
        if signature.params.is_empty() {
            return String::new();
        }
        let lines: Vec<String> = signature
            .param_names()
            .map(|name| match instructions.param_doc(name) {
                Some(doc) => format!("{name}: {{{name}}}  # {}", escape_braces(doc)),
                None => format!("{name}: {{{name}}}"),
            })
            .collect();
        format!("Inputs:\n{}\n", lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: serde_json::Value) -> Args {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_plain_string_task() {
        let instructions = InstructionModel::parse("This is a test task");
        let signature: SignatureModel = "argument: str -> str".parse().unwrap();
        let prompt = PromptCompiler::compile(&instructions, &signature);

        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(
            prompt.messages[0].text,
            "This is a test task\nInputs:\nargument: {argument}\n\n"
        );
        assert!(!prompt.return_schema.structured);
        assert!(prompt.warnings.is_empty());
    }

    #[test]
    fn test_structured_task() {
        let instructions = InstructionModel::parse("extract phone numbers");
        let signature: SignatureModel = "text: string -> List[string]".parse().unwrap();
        let prompt = PromptCompiler::compile(&instructions, &signature);

        assert_eq!(prompt.messages.len(), 2);
        assert_eq!(prompt.messages[0].role, Role::System);
        assert!(prompt.messages[0].text.contains("single key named 'declarai_result'"));
        assert!(prompt.messages[0].text.ends_with("\"declarai_result\": List[string]"));
        assert!(prompt.messages[1].text.contains("Inputs:\ntext: {text}"));

        let rendered = prompt.render(&args(json!({"text": "call 555-1234"}))).unwrap();
        assert_eq!(rendered[1].text, "extract phone numbers\nInputs:\ntext: call 555-1234\n\n");
    }

    #[test]
    fn test_named_return_and_param_docs() {
        let instructions = InstructionModel::parse(
            "Summarize\n:param text: the {raw} input\n:return summary: a short summary",
        );
        let signature: SignatureModel = "text: str -> str".parse().unwrap();
        let prompt = PromptCompiler::compile(&instructions, &signature);

        assert!(prompt.return_schema.structured);
        assert_eq!(prompt.return_schema.name, "summary");
        assert!(prompt.messages[0]
            .text
            .ends_with("\"summary\": string  # a short summary"));

        let rendered = prompt.render(&args(json!({"text": "abc"}))).unwrap();
        assert!(rendered[1].text.contains("text: abc  # the {raw} input"));
    }

    #[test]
    fn test_unstructured_typed_return() {
        let instructions = InstructionModel::parse("Count words\n:return: the count");
        let signature: SignatureModel = "text: str -> int".parse().unwrap();
        let prompt = PromptCompiler::compile(&instructions, &signature);

        assert_eq!(prompt.messages.len(), 1);
        assert!(prompt.messages[0]
            .text
            .ends_with("\nrespond only with the value of type integer:  # the count"));
    }

    #[test]
    fn test_missing_return_metadata_warns() {
        let instructions = InstructionModel::parse("Say hello");
        let signature: SignatureModel = "name: str ->".parse().unwrap();
        let prompt = PromptCompiler::compile(&instructions, &signature);

        assert_eq!(prompt.warnings, vec![CompileWarning::MissingReturnMetadata]);
        assert!(prompt.return_schema.is_text());
    }

    #[test]
    fn test_record_schema_survives_substitution() {
        let person = TypeDescriptor::record()
            .field("name", TypeDescriptor::string())
            .field(
                "tags",
                TypeDescriptor::list(
                    TypeDescriptor::record()
                        .documented_field("label", TypeDescriptor::string(), "uses {braces}")
                        .build(),
                ),
            )
            .build();
        let signature = SignatureModel::new()
            .param("text", TypeDescriptor::string())
            .returns(person.clone());
        let prompt = PromptCompiler::compile(&InstructionModel::parse("Extract"), &signature);

        for data in ["plain", "{", "}", "{text}", "}{{}}{", "{{nested}}"] {
            let rendered = prompt.render(&args(json!({ "text": data }))).unwrap();
            assert!(rendered[0]
                .text
                .ends_with(&format!("\"declarai_result\": {}", TypeSchemaResolver::render_plain(&person))));
            assert!(rendered[1].text.contains(&format!("text: {data}")));
        }
    }

    #[test]
    fn test_control_template_has_no_inputs_block() {
        let instructions =
            InstructionModel::parse("Rank:{% for item in items %}\n- {{ item }}{% endfor %}");
        let signature: SignatureModel = "items: List[str] -> List[str]".parse().unwrap();
        let prompt = PromptCompiler::compile(&instructions, &signature);

        let user = prompt.instruction().unwrap();
        assert_eq!(user.syntax, TemplateSyntax::Control);
        assert!(!user.text.contains("Inputs:"));
        assert_eq!(
            user.render_text(&args(json!({"items": ["a", "b"]}))).unwrap(),
            "Rank:\n- a\n- b"
        );
    }

    #[test]
    fn test_unpadded_expression_is_control_syntax() {
        let instructions = InstructionModel::parse("Greet {{name}} warmly");
        let signature: SignatureModel = "name: str -> str".parse().unwrap();
        let prompt = PromptCompiler::compile(&instructions, &signature);

        let rendered = prompt.render(&args(json!({"name": "Ada"}))).unwrap();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].text, "Greet Ada warmly");
    }

    #[test]
    fn test_missing_argument_at_render() {
        let prompt = PromptCompiler::compile(
            &InstructionModel::parse("Do"),
            &"a: str, b: str -> str".parse().unwrap(),
        );
        let err = prompt.render(&args(json!({"a": "x"}))).unwrap_err();
        assert!(matches!(err, TaskError::MissingArgument(ref n) if n == "b"));
    }
}
