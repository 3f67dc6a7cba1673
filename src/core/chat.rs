use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::error::TaskError;
use crate::core::history::{HistoryStore, InMemoryHistory};
use crate::core::parser::ResponseParser;
use crate::core::prompt::{DEFAULT_RETURN_NAME, ReturnSchema};
use crate::core::runtime::TaskRuntime;
use crate::core::schema::unescape_braces;
use crate::core::semantic::InstructionModel;
use crate::core::stream::ResponseStream;
use crate::core::template::{self, Args};
use crate::core::types::{Describe, TypeDescriptor};
use crate::llm::{LlmResponse, Message};

/// A multi-turn conversation with a fixed system instruction.
///
/// Every request carries the system message, the greeting (if any) and the whole history.
/// Each exchange is appended to the history store once the backend has answered.
pub struct Chat {
    name: String,
    system: String,
    greeting: Option<String>,
    reply: ReturnSchema,
    history: Arc<dyn HistoryStore>,
    runtime: TaskRuntime,
}

impl Chat {
    pub fn builder(runtime: TaskRuntime) -> ChatBuilder {
        ChatBuilder::new(runtime)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The rendered system message, including the reply format instruction.
    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }

    pub fn reply_schema(&self) -> &ReturnSchema {
        &self.reply
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    /// Greeting followed by the stored history.
    pub fn conversation(&self) -> Result<Vec<Message>, TaskError> {
        let mut messages: Vec<Message> = self.greeting.iter().map(Message::assistant).collect();
        messages.extend(self.history.list()?);
        Ok(messages)
    }

    /// The request that sending `message` would issue.
    pub fn compile(&self, message: Option<&str>) -> Result<Vec<Message>, TaskError> {
        let mut messages = Vec::new();
        if !self.system.is_empty() {
            messages.push(Message::system(self.system.clone()));
        }
        messages.extend(self.conversation()?);
        messages.extend(message.map(Message::user));
        Ok(messages)
    }

    pub fn send(&self, message: &str) -> Result<Value, TaskError> {
        let messages = self.compile(Some(message))?;
        let exchange = self.exchange(message);
        self.runtime.execute(
            self.name.as_str(),
            message_args(message),
            messages,
            self.params(),
            move |response| exchange(response),
        )
    }

    pub fn send_as<T: DeserializeOwned>(&self, message: &str) -> Result<T, TaskError> {
        serde_json::from_value(self.send(message)?).map_err(TaskError::Deserialize)
    }

    /// Send with a streamed answer. The exchange is stored once the stream is exhausted.
    pub fn send_streaming(&self, message: &str) -> Result<ResponseStream, TaskError> {
        let messages = self.compile(Some(message))?;
        let exchange = self.exchange(message);
        self.runtime.execute_streaming(
            self.name.as_str(),
            message_args(message),
            messages,
            self.params(),
            Box::new(move |outcome: Result<&LlmResponse, TaskError>| exchange(outcome?)),
        )
    }

    pub fn clear(&self) -> Result<(), TaskError> {
        Ok(self.history.clear()?)
    }

    fn params(&self) -> crate::llm::LlmParams {
        self.runtime
            .config()
            .params
            .clone()
            .json_mode(self.reply.structured)
    }

    /// Stores the user message and the raw answer as one batch, then parses the answer.
    fn exchange(
        &self,
        message: &str,
    ) -> impl FnOnce(&LlmResponse) -> Result<Value, TaskError> + Send + 'static {
        let history = Arc::clone(&self.history);
        let reply = self.reply.clone();
        let message = message.to_string();
        move |response: &LlmResponse| {
            history.append_all(&[
                Message::user(message),
                Message::assistant(response.text.clone()),
            ])?;
            Ok(ResponseParser::new(&reply).parse(&response.text)?)
        }
    }
}

fn message_args(message: &str) -> Args {
    let mut args = Args::new();
    args.insert("message".to_string(), Value::from(message));
    args
}

/// Builder for [`Chat`].
pub struct ChatBuilder {
    runtime: TaskRuntime,
    name: Option<String>,
    system: String,
    args: Args,
    greeting: Option<String>,
    reply: Option<TypeDescriptor>,
    reply_name: Option<String>,
    history: Option<Arc<dyn HistoryStore>>,
}

impl ChatBuilder {
    pub fn new(runtime: TaskRuntime) -> Self {
        Self {
            runtime,
            name: None,
            system: String::new(),
            args: Args::new(),
            greeting: None,
            reply: None,
            reply_name: None,
            history: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The system instruction block. May hold placeholders (or control syntax) filled from
    /// [`Self::arg`], and a `:return <name>: <doc>` line describing replies.
    pub fn system(mut self, block: impl Into<String>) -> Self {
        self.system = block.into();
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn reply(mut self, ty: TypeDescriptor) -> Self {
        self.reply = Some(ty);
        self
    }

    pub fn reply_of<T: Describe + ?Sized>(self) -> Self {
        self.reply(T::describe())
    }

    pub fn reply_name(mut self, name: impl Into<String>) -> Self {
        self.reply_name = Some(name.into());
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn build(self) -> Result<Chat, TaskError> {
        let name = self.name.unwrap_or_else(|| {
            let id = format!("autogen_{}", uuid::Uuid::new_v4().simple());
            log::warn!(
                "Auto-generated chat name '{}'. For stable traces, use .name().",
                id
            );
            id
        });

        let instructions = InstructionModel::parse(&self.system);
        let reply_name = self
            .reply_name
            .or_else(|| instructions.return_name().map(str::to_string));
        let structured = reply_name.is_some() || self.reply.as_ref().is_some_and(|t| !t.is_primitive());
        let reply = match (structured, self.reply) {
            (true, ty) => ReturnSchema::structured(
                reply_name.unwrap_or_else(|| DEFAULT_RETURN_NAME.to_string()),
                ty.unwrap_or_else(TypeDescriptor::any),
            ),
            (false, Some(ty)) => ReturnSchema::unstructured(ty),
            (false, None) => ReturnSchema::text(),
        }
        .with_doc(instructions.return_doc().unwrap_or_default());

        let mut system = if template::has_control_syntax(&instructions.freeform) {
            template::render_control(&instructions.freeform, &self.args)?
        } else {
            template::render_placeholders(&instructions.freeform, &self.args)?
        };
        let format_instruction = if reply.structured {
            Some(reply.chat_prompt())
        } else {
            reply.unstructured_prompt()
        };
        if let Some(instruction) = format_instruction {
            if !system.is_empty() {
                system.push('\n');
            }
            system.push_str(&unescape_braces(&instruction));
        }

        log::debug!("Built chat '{}' (structured replies: {})", name, reply.structured);
        Ok(Chat {
            name,
            system,
            greeting: self.greeting,
            reply,
            history: self
                .history
                .unwrap_or_else(|| Arc::new(InMemoryHistory::new())),
            runtime: self.runtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::HistoryError;
    use crate::core::runtime::RuntimeConfig;
    use crate::llm::{Backend, BackendError, LlmParams};
    use serde_json::json;

    struct Echo;

    impl Backend for Echo {
        fn predict(&self, messages: &[Message], _params: &LlmParams) -> Result<LlmResponse, BackendError> {
            let last = messages.last().map(|m| m.text.clone()).unwrap_or_default();
            Ok(LlmResponse::new(format!("echo: {}", last)))
        }
    }

    fn runtime() -> TaskRuntime {
        TaskRuntime::new(Arc::new(Echo), RuntimeConfig::default())
    }

    #[test]
    fn test_system_rendering_and_greeting() {
        let chat = Chat::builder(runtime())
            .name("tutor")
            .system("You are a {subject} tutor.")
            .arg("subject", "math")
            .greeting("Hi! What shall we study?")
            .build()
            .unwrap();

        assert_eq!(chat.system(), "You are a math tutor.");
        let request = chat.compile(Some("fractions")).unwrap();
        assert_eq!(
            request,
            vec![
                Message::system("You are a math tutor."),
                Message::assistant("Hi! What shall we study?"),
                Message::user("fractions"),
            ]
        );
    }

    #[test]
    fn test_send_appends_exchange() {
        let chat = Chat::builder(runtime()).name("echo").system("Echo").build().unwrap();
        assert_eq!(chat.send("one").unwrap(), json!("echo: one"));
        assert_eq!(chat.send("two").unwrap(), json!("echo: two"));

        let history = chat.history().list().unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[3], Message::assistant("echo: two"));

        chat.clear().unwrap();
        assert!(chat.conversation().unwrap().is_empty());
    }

    /// Accepts a fixed number of writes, then fails every one after.
    struct LimitedWrites {
        inner: InMemoryHistory,
        writes_left: std::sync::Mutex<usize>,
    }

    impl LimitedWrites {
        fn new(writes: usize) -> Self {
            Self {
                inner: InMemoryHistory::new(),
                writes_left: std::sync::Mutex::new(writes),
            }
        }

        fn take_write(&self) -> Result<(), HistoryError> {
            let mut left = self.writes_left.lock().unwrap();
            if *left == 0 {
                return Err(std::io::Error::other("disk full").into());
            }
            *left -= 1;
            Ok(())
        }
    }

    impl HistoryStore for LimitedWrites {
        fn append(&self, message: Message) -> Result<(), HistoryError> {
            self.take_write()?;
            self.inner.append(message)
        }

        fn append_all(&self, messages: &[Message]) -> Result<(), HistoryError> {
            self.take_write()?;
            self.inner.append_all(messages)
        }

        fn list(&self) -> Result<Vec<Message>, HistoryError> {
            self.inner.list()
        }

        fn clear(&self) -> Result<(), HistoryError> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_failed_store_leaves_no_partial_exchange() {
        let store = Arc::new(LimitedWrites::new(1));
        let chat = Chat::builder(runtime())
            .name("echo")
            .history(store.clone())
            .build()
            .unwrap();

        assert_eq!(chat.send("one").unwrap(), json!("echo: one"));
        assert_eq!(
            store.list().unwrap(),
            vec![Message::user("one"), Message::assistant("echo: one")]
        );

        assert!(matches!(chat.send("two"), Err(TaskError::History(_))));
        let stream = chat.send_streaming("three").unwrap();
        assert!(stream.finish().is_err());
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_structured_reply_instruction() {
        let chat = Chat::builder(runtime())
            .name("scorer")
            .system("Score the essay\n:return score: from 1 to 10")
            .reply_of::<i64>()
            .build()
            .unwrap();

        assert!(chat.reply_schema().structured);
        assert_eq!(
            chat.system(),
            "Score the essay\nYour responses should be a JSON structure with a single key named 'score', nothing else. The expected format is: \"score\": integer  # from 1 to 10"
        );
    }

    #[test]
    fn test_missing_system_argument() {
        let result = Chat::builder(runtime()).system("About {topic}").build();
        assert!(matches!(result, Err(TaskError::MissingArgument(_))));
    }
}
