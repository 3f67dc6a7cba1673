pub mod instruction;
pub mod signature;

use std::collections::BTreeMap;

pub use instruction::{InstructionModel, ReturnDoc};
pub use signature::{Param, SignatureModel};

/// Declarative metadata supplied when a task is defined.
///
/// Every entry overrides what the instruction block says about the same item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetadata {
    /// Key the backend must answer under.
    pub return_name: Option<String>,
    pub input_descriptions: BTreeMap<String, String>,
    pub output_description: Option<String>,
}

impl TaskMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn return_name(mut self, name: impl Into<String>) -> Self {
        self.return_name = Some(name.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.input_descriptions.insert(name.into(), description.into());
        self
    }

    pub fn output(mut self, description: impl Into<String>) -> Self {
        self.output_description = Some(description.into());
        self
    }

    /// Fold this metadata into an instruction model.
    pub(crate) fn apply(&self, instructions: &mut InstructionModel) {
        for (name, description) in &self.input_descriptions {
            instructions.params.insert(name.clone(), description.clone());
        }
        if self.return_name.is_none() && self.output_description.is_none() {
            return;
        }
        let returns = instructions.returns.get_or_insert_with(ReturnDoc::default);
        if let Some(name) = &self.return_name {
            returns.name = Some(name.clone());
        }
        if let Some(doc) = &self.output_description {
            returns.doc = doc.clone();
        }
    }
}
