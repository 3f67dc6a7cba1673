use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::core::chain::ChainCompiler;
use crate::core::error::TaskError;
use crate::core::future::FutureTask;
use crate::core::hooks::TaskHook;
use crate::core::parser::ResponseParser;
use crate::core::stream::{Completion, ResponseStream};
use crate::core::task::Task;
use crate::core::template::Args;
use crate::llm::{Backend, LlmParams, LlmResponse, Message, TokenUsage};

// ============================================================================
// Configuration
// ============================================================================

/// Runtime settings, resolved once and handed to [`TaskRuntime::new`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Backend parameters for every call. Task-level parameters take precedence.
    pub params: LlmParams,
    /// Request answers as chunk streams, even for plain `call`s.
    pub streaming: bool,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn params(mut self, params: LlmParams) -> Self {
        self.params = params;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.params = self.params.model(model);
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

// ============================================================================
// Invocation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationState {
    Created,
    /// Arguments substituted into the request template.
    Compiled,
    /// Request issued to the backend.
    Invoked,
    /// Chunks are being received.
    Streaming,
    Completed(Value),
    Failed(String),
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationState::Completed(_) | InvocationState::Failed(_))
    }
}

/// One call of a task (or chain) as hooks see it.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: Uuid,
    /// Name of the task, or `chain:<root task>` for a compiled chain.
    pub task: String,
    pub args: Args,
    pub messages: Vec<Message>,
    pub params: LlmParams,
    pub raw_text: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    started: Instant,
    state: InvocationState,
}

impl Invocation {
    fn new(task: impl Into<String>, args: Args, params: LlmParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            args,
            messages: Vec::new(),
            params,
            raw_text: None,
            model: None,
            usage: None,
            started: Instant::now(),
            state: InvocationState::Created,
        }
    }

    pub fn state(&self) -> &InvocationState {
        &self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn advance(&mut self, state: InvocationState) {
        log::debug!(
            "Invocation {} of '{}': {:?} -> {:?}",
            self.id,
            self.task,
            self.state,
            state
        );
        self.state = state;
    }

    fn compiled(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self.advance(InvocationState::Compiled);
        self
    }

    fn record_response(&mut self, response: &LlmResponse) {
        self.raw_text = Some(response.text.clone());
        self.model = response.model.clone().or_else(|| self.params.model.clone());
        self.usage = response.usage;
    }

    fn conclude(&mut self, result: &Result<Value, TaskError>) {
        match result {
            Ok(value) => self.advance(InvocationState::Completed(value.clone())),
            Err(err) => self.advance(InvocationState::Failed(err.to_string())),
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Runs tasks against a backend: render, call, parse, with hooks around each invocation.
#[derive(Clone)]
pub struct TaskRuntime {
    backend: Arc<dyn Backend>,
    config: RuntimeConfig,
    hooks: Vec<Arc<dyn TaskHook>>,
}

impl TaskRuntime {
    pub fn new(backend: Arc<dyn Backend>, config: RuntimeConfig) -> Self {
        Self {
            backend,
            config,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn TaskHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// A runtime sharing this one's backend and hooks, with `params` layered over its own.
    pub fn with_params(&self, params: &LlmParams) -> Self {
        let mut runtime = self.clone();
        runtime.config.params = runtime.config.params.overlay(params);
        runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Call a task and parse its answer into the declared return value.
    pub fn call(&self, task: &Task, args: Args) -> Result<Value, TaskError> {
        if self.config.streaming {
            return self.stream(task, args)?.finish();
        }
        let (args, messages) = Self::prepare(task, args)?;
        let schema = task.return_schema().clone();
        self.execute(
            task.name(),
            args,
            messages,
            self.params_for(task),
            move |response| Ok(ResponseParser::new(&schema).parse(&response.text)?),
        )
    }

    /// [`Self::call`] and convert the result into `T`.
    pub fn call_as<T: DeserializeOwned>(&self, task: &Task, args: Args) -> Result<T, TaskError> {
        serde_json::from_value(self.call(task, args)?).map_err(TaskError::Deserialize)
    }

    /// Call a task with a streamed answer. The value is parsed once the stream is exhausted.
    pub fn stream(&self, task: &Task, args: Args) -> Result<ResponseStream, TaskError> {
        let (args, messages) = Self::prepare(task, args)?;
        let schema = task.return_schema().clone();
        self.execute_streaming(
            task.name(),
            args,
            messages,
            self.params_for(task),
            Box::new(move |outcome: Result<&LlmResponse, TaskError>| {
                Ok(ResponseParser::new(&schema).parse(&outcome?.text)?)
            }),
        )
    }

    /// Execute a deferred call. Future-valued arguments run first, each shared dependency
    /// exactly once, and their results are passed on as plain values.
    pub fn run_future(&self, future: &Arc<FutureTask>) -> Result<Value, TaskError> {
        let mut results = HashMap::new();
        let mut on_path = HashSet::new();
        self.resolve(future, &mut results, &mut on_path)
    }

    /// Compile a deferred call graph into one request and return every step's result, keyed
    /// by step result name.
    pub fn run_chain(&self, root: &Arc<FutureTask>) -> Result<Value, TaskError> {
        let chain = ChainCompiler::compile(root)?;
        let params = self.params_for(root.task()).json_mode(true);
        self.execute(
            format!("chain:{}", root.task().name()),
            Args::new(),
            chain.messages().to_vec(),
            params,
            move |response| Ok(chain.parse(&response.text)?),
        )
    }

    fn resolve(
        &self,
        future: &Arc<FutureTask>,
        results: &mut HashMap<Uuid, Value>,
        on_path: &mut HashSet<Uuid>,
    ) -> Result<Value, TaskError> {
        if let Some(value) = results.get(&future.id()) {
            return Ok(value.clone());
        }
        if !on_path.insert(future.id()) {
            return Err(TaskError::CyclicDependency(future.to_string()));
        }
        let args = future.derive_args(|dependency| self.resolve(dependency, results, on_path))?;
        on_path.remove(&future.id());

        let value = self.call(future.task(), args)?;
        results.insert(future.id(), value.clone());
        Ok(value)
    }

    fn prepare(task: &Task, args: Args) -> Result<(Args, Vec<Message>), TaskError> {
        let args = task.prepare_args(args)?;
        let messages = task.render(&args)?;
        Ok((args, messages))
    }

    fn params_for(&self, task: &Task) -> LlmParams {
        let params = match task.params() {
            Some(params) => self.config.params.clone().overlay(params),
            None => self.config.params.clone(),
        };
        params.json_mode(task.return_schema().structured)
    }

    fn intercepted(&self, invocation: &Invocation) -> Option<Result<Value, TaskError>> {
        for (i, hook) in self.hooks.iter().enumerate() {
            if let Some(result) = hook.intercept(invocation) {
                log::warn!(
                    "Invocation {} of '{}' short-circuited by hook #{}",
                    invocation.id,
                    invocation.task,
                    i
                );
                return Some(result);
            }
        }
        None
    }

    /// Run a fully rendered request through hooks, backend and `finish`.
    pub(crate) fn execute<F>(
        &self,
        label: impl Into<String>,
        args: Args,
        messages: Vec<Message>,
        params: LlmParams,
        finish: F,
    ) -> Result<Value, TaskError>
    where
        F: FnOnce(&LlmResponse) -> Result<Value, TaskError>,
    {
        let mut invocation = Invocation::new(label, args, params).compiled(messages);
        for hook in &self.hooks {
            hook.before(&invocation);
        }

        let result = match self.intercepted(&invocation) {
            Some(result) => result,
            None => {
                invocation.advance(InvocationState::Invoked);
                match self.backend.predict(&invocation.messages, &invocation.params) {
                    Ok(response) => {
                        invocation.record_response(&response);
                        finish(&response)
                    }
                    Err(err) => Err(err.into()),
                }
            }
        };

        invocation.conclude(&result);
        for hook in self.hooks.iter().rev() {
            hook.after(&invocation);
        }
        result
    }

    /// Streaming counterpart of [`Self::execute`]: `finish` and the `after` hooks run once
    /// the returned stream is exhausted, or fails mid-way.
    pub(crate) fn execute_streaming(
        &self,
        label: impl Into<String>,
        args: Args,
        messages: Vec<Message>,
        params: LlmParams,
        finish: Completion,
    ) -> Result<ResponseStream, TaskError> {
        let mut invocation = Invocation::new(label, args, params).compiled(messages);
        for hook in &self.hooks {
            hook.before(&invocation);
        }
        let hooks = self.hooks.clone();

        if let Some(result) = self.intercepted(&invocation) {
            invocation.conclude(&result);
            return Ok(ResponseStream::ready(
                result,
                Box::new(move || {
                    for hook in hooks.iter().rev() {
                        hook.after(&invocation);
                    }
                }),
            ));
        }

        invocation.advance(InvocationState::Invoked);
        let chunks = match self
            .backend
            .predict_stream(&invocation.messages, &invocation.params)
        {
            Ok(chunks) => chunks,
            Err(err) => {
                let err = TaskError::from(err);
                invocation.advance(InvocationState::Failed(err.to_string()));
                for hook in hooks.iter().rev() {
                    hook.after(&invocation);
                }
                return Err(err);
            }
        };
        invocation.advance(InvocationState::Streaming);

        Ok(ResponseStream::new(
            chunks,
            Box::new(move |outcome: Result<&LlmResponse, TaskError>| {
                if let Ok(response) = &outcome {
                    invocation.record_response(response);
                }
                let result = finish(outcome);
                invocation.conclude(&result);
                for hook in hooks.iter().rev() {
                    hook.after(&invocation);
                }
                result
            }),
        ))
    }
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("config", &self.config)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
