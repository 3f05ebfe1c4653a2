//! Conversation state for one chat session.
//!
//! A [`ConversationSession`] pairs the visible history shown to the user with
//! the [`AgentMemory`] replayed to the model. The two are only ever cleared
//! together.

use crate::llm::ChatMessage;
use crate::models::Turn;

/// Past user/assistant exchanges replayed to the model.
///
/// Tool traffic from earlier turns is not kept; only the question and the
/// final answer of each turn are.
#[derive(Debug, Clone)]
pub struct AgentMemory {
    messages: Vec<ChatMessage>,
    window: usize,
}

impl AgentMemory {
    /// Memory replaying at most `window` past turns.
    pub fn new(window: usize) -> Self {
        Self {
            messages: Vec::new(),
            window,
        }
    }

    /// Remember one exchange, dropping turns that fall outside the window.
    pub fn record(&mut self, user: &str, response: &str) {
        self.messages.push(ChatMessage::user(user));
        self.messages.push(ChatMessage::assistant(response));
        let cap = self.window.saturating_mul(2);
        if self.messages.len() > cap {
            let excess = self.messages.len() - cap;
            self.messages.drain(..excess);
        }
    }

    /// The most recent turns, oldest first.
    pub fn replay(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Turns currently held, at most `window`.
    pub fn turns(&self) -> usize {
        self.messages.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn clear(&mut self) {
        self.messages.clear();
    }
}

impl Default for AgentMemory {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Visible history plus agent memory.
#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    history: Vec<Turn>,
    memory: AgentMemory,
}

impl ConversationSession {
    pub fn new(memory_window: usize) -> Self {
        Self {
            history: Vec::new(),
            memory: AgentMemory::new(memory_window),
        }
    }

    pub fn append(&mut self, user: &str, response: &str) {
        self.history.push(Turn {
            user: user.to_string(),
            response: response.to_string(),
        });
        self.memory.record(user, response);
    }

    /// Empty both history and memory.
    pub fn clear(&mut self) {
        self.history.clear();
        self.memory.clear();
    }

    pub fn current_history(&self) -> &[Turn] {
        &self.history
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }
}
