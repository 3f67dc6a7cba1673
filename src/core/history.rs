//! Conversation history stores used by [`Chat`](crate::core::chat::Chat).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::core::error::HistoryError;
use crate::llm::Message;

/// Ordered storage of the messages exchanged in a conversation.
pub trait HistoryStore: Send + Sync {
    fn append(&self, message: Message) -> Result<(), HistoryError>;

    /// Append a batch of messages. Stores that can should apply it all or nothing.
    fn append_all(&self, messages: &[Message]) -> Result<(), HistoryError> {
        messages
            .iter()
            .try_for_each(|message| self.append(message.clone()))
    }

    /// All messages, oldest first.
    fn list(&self) -> Result<Vec<Message>, HistoryError>;

    fn clear(&self) -> Result<(), HistoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryHistory {
    messages: Mutex<Vec<Message>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for InMemoryHistory {
    fn append(&self, message: Message) -> Result<(), HistoryError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    fn append_all(&self, messages: &[Message]) -> Result<(), HistoryError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(messages);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Message>, HistoryError> {
        Ok(self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn clear(&self) -> Result<(), HistoryError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// History kept in a JSON file, rewritten on every change.
#[derive(Debug)]
pub struct FileHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<Message>, HistoryError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, messages: &[Message]) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(messages)?)?;
        Ok(())
    }
}

impl HistoryStore for FileHistory {
    fn append(&self, message: Message) -> Result<(), HistoryError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages = self.read()?;
        messages.push(message);
        self.write(&messages)
    }

    fn append_all(&self, batch: &[Message]) -> Result<(), HistoryError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages = self.read()?;
        messages.extend_from_slice(batch);
        self.write(&messages)
    }

    fn list(&self) -> Result<Vec<Message>, HistoryError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
    }

    fn clear(&self) -> Result<(), HistoryError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(&[])
    }
}
