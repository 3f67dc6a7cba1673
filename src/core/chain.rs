//! Chain-of-thought composition: a graph of deferred calls compiled into one request.
//!
//! Steps are numbered in post-order (dependencies first). A call reachable from several
//! parents is emitted once; every dependent refers to it through
//! [`PREVIOUS_STEP_SENTINEL`](crate::core::future::PREVIOUS_STEP_SENTINEL).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::error::{ParseFailure, ParseFailureKind, TaskError};
use crate::core::future::{FutureTask, PREVIOUS_STEP_SENTINEL};
use crate::core::parser::{ResponseParser, ResultMode, coerce};
use crate::core::prompt::{DEFAULT_RETURN_NAME, ReturnSchema};
use crate::core::schema::TypeSchemaResolver;
use crate::core::types::{RecordField, TypeDescriptor};
use crate::llm::Message;

/// One numbered step of a compiled chain.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub number: usize,
    pub future: Arc<FutureTask>,
    /// Key the step's result is answered under.
    pub result_name: String,
    /// The step's instruction with dependencies replaced by the sentinel.
    pub text: String,
}

impl ChainStep {
    /// The step's `Step N:` block.
    pub fn block(&self) -> String {
        let schema = self.future.task().return_schema();
        let mut block = format!("Step {}:\n{}", self.number, self.text.trim_end());
        block.push_str(&format!(
            "\nAnswer this step under the key '{}' with format: {}",
            self.result_name,
            TypeSchemaResolver::render_plain(&step_target(schema))
        ));
        block
    }
}

/// A dependency graph compiled into one request.
#[derive(Debug, Clone)]
pub struct CompiledChain {
    steps: Vec<ChainStep>,
    messages: Vec<Message>,
    schema: ReturnSchema,
}

impl CompiledChain {
    /// Steps in execution order. The last one is the root.
    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn root(&self) -> Option<&ChainStep> {
        self.steps.last()
    }

    /// The request, ready to send.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Combined schema of all step results.
    pub fn return_schema(&self) -> &ReturnSchema {
        &self.schema
    }

    /// Parse the combined answer into an object holding every step's result.
    ///
    /// All object fragments are merged. The root step's result is required; an intermediate
    /// result that is missing is left out with a warning.
    pub fn parse(&self, raw: &str) -> Result<Value, ParseFailure> {
        let merged = ResponseParser::new(&self.schema)
            .mode(ResultMode::Multi)
            .extract(raw)?;

        let mut results = Map::new();
        for (i, step) in self.steps.iter().enumerate() {
            let target = step_target(step.future.task().return_schema());
            let failure = |kind, detail: String| {
                ParseFailure::new(kind, detail, raw, self.schema.plain_output_schema())
            };
            match merged.get(&step.result_name) {
                Some(value) => {
                    let value = coerce(value, &target).map_err(|detail| {
                        failure(
                            ParseFailureKind::TypeCoercion,
                            format!("step {} ('{}'): {}", step.number, step.result_name, detail),
                        )
                    })?;
                    results.insert(step.result_name.clone(), value);
                }
                None if i + 1 == self.steps.len() => {
                    return Err(failure(
                        ParseFailureKind::KeyMissing,
                        format!("no '{}' key for the final step", step.result_name),
                    ));
                }
                None => log::warn!(
                    "Chain answer has no result for step {} ('{}')",
                    step.number,
                    step.result_name
                ),
            }
        }
        Ok(Value::Object(results))
    }

    /// The root step's value out of a parsed chain answer.
    pub fn root_value(&self, parsed: &Value) -> Option<Value> {
        let root = self.root()?;
        parsed.get(&root.result_name).cloned()
    }
}

/// Compiles a [`FutureTask`] graph into a [`CompiledChain`].
pub struct ChainCompiler;

impl ChainCompiler {
    pub fn compile(root: &Arc<FutureTask>) -> Result<CompiledChain, TaskError> {
        let mut walk = Walk::default();
        walk.visit(root)?;
        let steps = walk.steps;

        let mut names: HashMap<&str, usize> = HashMap::new();
        for step in &steps {
            if let Some(previous) = names.insert(step.result_name.as_str(), step.number) {
                log::warn!(
                    "Steps {} and {} both answer under '{}'; the later result wins",
                    previous,
                    step.number,
                    step.result_name
                );
            }
        }

        let fields = steps
            .iter()
            .map(|step| {
                let schema = step.future.task().return_schema();
                RecordField {
                    name: step.result_name.clone(),
                    ty: step_target(schema),
                    doc: schema.doc.clone(),
                }
            })
            .collect();
        let root_name = steps
            .last()
            .map(|s| s.result_name.clone())
            .unwrap_or_else(|| DEFAULT_RETURN_NAME.to_string());
        let schema = ReturnSchema::structured(root_name, TypeDescriptor::Record(fields));

        let system = format!(
            "You are a REST api endpoint.You only answer in JSON structures\nwith one key for the result of each step, nothing else.\nThe expected format is:\n{}",
            TypeSchemaResolver::render_plain(schema.target.as_ref().unwrap_or(&TypeDescriptor::any()))
        );
        let blocks: Vec<String> = steps.iter().map(ChainStep::block).collect();
        let user = format!(
            "Think through the following {} steps in order. A step input marked as \"{}\" is the result of an earlier step.\n\n{}\n\nReturn the results of all {} steps in a single JSON object.",
            steps.len(),
            PREVIOUS_STEP_SENTINEL,
            blocks.join("\n\n"),
            steps.len()
        );

        log::debug!("Compiled chain of {} steps rooted at {}", steps.len(), root);
        Ok(CompiledChain {
            steps,
            messages: vec![Message::system(system), Message::user(user)],
            schema,
        })
    }
}

/// Post-order walk state.
#[derive(Default)]
struct Walk {
    steps: Vec<ChainStep>,
    visited: HashSet<Uuid>,
    on_path: HashSet<Uuid>,
}

impl Walk {
    fn visit(&mut self, future: &Arc<FutureTask>) -> Result<(), TaskError> {
        if !self.on_path.insert(future.id()) {
            return Err(TaskError::CyclicDependency(future.to_string()));
        }
        for dependency in future.dependencies() {
            if !self.visited.contains(&dependency.id()) {
                self.visit(dependency)?;
            }
        }
        self.on_path.remove(&future.id());
        self.visited.insert(future.id());

        let number = self.steps.len() + 1;
        self.steps.push(ChainStep {
            number,
            future: Arc::clone(future),
            result_name: step_result_name(future, number),
            text: future.rendered_text()?,
        });
        Ok(())
    }
}

/// A step answers under its task's result name, or `step_<n>` when the task did not name it.
fn step_result_name(future: &FutureTask, number: usize) -> String {
    let task = future.task();
    match task.instructions().return_name() {
        Some(name) => name.to_string(),
        None if task.return_schema().name != DEFAULT_RETURN_NAME => {
            task.return_schema().name.clone()
        }
        None => format!("step_{}", number),
    }
}

fn step_target(schema: &ReturnSchema) -> TypeDescriptor {
    schema.target.clone().unwrap_or_else(TypeDescriptor::string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::future::Arg;
    use crate::core::task::Task;
    use serde_json::json;

    fn task(name: &str, instructions: &str, signature: &str) -> Arc<Task> {
        Task::builder()
            .name(name)
            .instructions(instructions)
            .signature(signature.parse::<crate::SignatureModel>().unwrap())
            .build()
    }

    #[test]
    fn test_linear_chain() {
        let task1 = task("task1", "Invent a product name about {theme}", "theme: str -> str");
        let task2 = task("task2", "Write a slogan", "name: str -> str");
        let task3 = task("task3", "Translate to French", "slogan: str -> str");

        let f1 = task1.plan([("theme", Arg::from("coffee"))]).unwrap();
        let f2 = task2.plan([("name", Arg::from(&f1))]).unwrap();
        let f3 = task3.plan([("slogan", Arg::from(&f2))]).unwrap();

        let chain = ChainCompiler::compile(&f3).unwrap();
        let numbers: Vec<usize> = chain.steps().iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let user = &chain.messages()[1].text;
        let p1 = user.find("Step 1:").unwrap();
        let p2 = user.find("Step 2:").unwrap();
        let p3 = user.find("Step 3:").unwrap();
        assert!(p1 < p2 && p2 < p3);

        let task1_text = &chain.steps()[0].text;
        assert!(task1_text.contains("coffee"));
        for step in &chain.steps()[1..] {
            assert!(!step.block().contains(task1_text.trim_end()));
            assert!(step.text.contains(PREVIOUS_STEP_SENTINEL));
        }
    }

    #[test]
    fn test_diamond_emits_shared_step_once() {
        let task0 = task("task0", "Pick a city", "region: str -> str");
        let task1 = task("task1", "Describe the weather", "city: str -> str");
        let task2 = task("task2", "Describe the food", "city: str -> str");
        let task3 = task("task3", "Write a travel note", "weather: str, food: str -> str");

        let f0 = task0.plan([("region", Arg::from("Andalusia"))]).unwrap();
        let f1 = task1.plan([("city", Arg::from(&f0))]).unwrap();
        let f2 = task2.plan([("city", Arg::from(&f0))]).unwrap();
        let f3 = task3
            .plan([("weather", Arg::from(&f1)), ("food", Arg::from(&f2))])
            .unwrap();

        let chain = ChainCompiler::compile(&f3).unwrap();
        assert_eq!(chain.steps().len(), 4);

        let user = &chain.messages()[1].text;
        assert_eq!(user.matches("Pick a city").count(), 1);
        assert_eq!(user.matches("Andalusia").count(), 1);
        assert_eq!(chain.steps()[0].future.id(), f0.id());
        assert_eq!(chain.root().unwrap().future.id(), f3.id());
    }

    #[test]
    fn test_parse_chain_answer() {
        let count = task("count", "Count the words\n:return words: word count", "text: str -> int");
        let label = task("label", "Label the size", "words: int -> str");

        let f1 = count.plan([("text", Arg::from("a b c"))]).unwrap();
        let f2 = label.plan([("words", Arg::from(&f1))]).unwrap();
        let chain = ChainCompiler::compile(&f2).unwrap();
        assert_eq!(chain.steps()[0].result_name, "words");
        assert_eq!(chain.steps()[1].result_name, "step_2");

        let parsed = chain
            .parse("Step 1 gives {\"words\": \"3\"}\nthen {\"step_2\": \"small\"}")
            .unwrap();
        assert_eq!(parsed, json!({"words": 3, "step_2": "small"}));
        assert_eq!(chain.root_value(&parsed), Some(json!("small")));

        let failure = chain.parse("{\"words\": 3}").unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::KeyMissing);
    }

    #[test]
    fn test_combined_schema() {
        let t = task("t", "Extract\n:return names: the names", "text: str -> List[str]");
        let f = t.plan([("text", Arg::from("x"))]).unwrap();
        let chain = ChainCompiler::compile(&f).unwrap();
        assert!(chain.messages()[0]
            .text
            .ends_with("{\n    \"names\": List[string]  # the names\n}"));
    }
}
