use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::core::error::TaskError;
use crate::core::task::Task;
use crate::core::template::Args;

/// Stands in for an argument whose value another step of the same request produces.
pub const PREVIOUS_STEP_SENTINEL: &str = "value supplied by a previous step";

/// A bound argument of a deferred call.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    /// The result of another deferred call.
    Future(Arc<FutureTask>),
}

impl Arg {
    pub fn value(value: impl Into<Value>) -> Self {
        Arg::Value(value.into())
    }

    pub fn as_future(&self) -> Option<&Arc<FutureTask>> {
        match self {
            Arg::Future(future) => Some(future),
            Arg::Value(_) => None,
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<Arc<FutureTask>> for Arg {
    fn from(future: Arc<FutureTask>) -> Self {
        Arg::Future(future)
    }
}

impl From<&Arc<FutureTask>> for Arg {
    fn from(future: &Arc<FutureTask>) -> Self {
        Arg::Future(Arc::clone(future))
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Value(Value::from(value))
    }
}

/// A task call that has not run yet.
///
/// Arguments may be other deferred calls, forming a graph. The graph is immutable: executing
/// or chaining it derives new argument maps and never rewrites the bound ones.
#[derive(Debug)]
pub struct FutureTask {
    id: Uuid,
    task: Arc<Task>,
    bound_args: Vec<(String, Arg)>,
}

impl FutureTask {
    pub(crate) fn new(task: Arc<Task>, bound_args: Vec<(String, Arg)>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            bound_args,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn bound_args(&self) -> &[(String, Arg)] {
        &self.bound_args
    }

    /// Deferred calls this one depends on directly, in argument order.
    pub fn dependencies(&self) -> impl Iterator<Item = &Arc<FutureTask>> {
        self.bound_args.iter().filter_map(|(_, arg)| arg.as_future())
    }

    /// Argument map with every future-valued argument replaced by `resolve(future)`.
    pub fn derive_args<F>(&self, mut resolve: F) -> Result<Args, TaskError>
    where
        F: FnMut(&Arc<FutureTask>) -> Result<Value, TaskError>,
    {
        let mut args = Args::new();
        for (name, arg) in &self.bound_args {
            let value = match arg {
                Arg::Value(value) => value.clone(),
                Arg::Future(future) => resolve(future)?,
            };
            args.insert(name.clone(), value);
        }
        Ok(args)
    }

    /// The user instruction as it reads with dependencies replaced by
    /// [`PREVIOUS_STEP_SENTINEL`].
    pub fn rendered_text(&self) -> Result<String, TaskError> {
        let args = self.derive_args(|_| Ok(Value::from(PREVIOUS_STEP_SENTINEL)))?;
        let args = self.task.prepare_args(args)?;
        match self.task.prompt().instruction() {
            Some(instruction) => instruction.render_text(&args),
            None => Ok(String::new()),
        }
    }
}

impl fmt::Display for FutureTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.task.name(), self.id.simple())
    }
}
