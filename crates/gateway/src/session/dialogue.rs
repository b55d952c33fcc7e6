//! The session's conversation log.
//!
//! Index 0 is always the system prompt. Truncation keeps the system
//! message plus the most recent N non-system messages, and never lets
//! a tool-result message lead the window without the assistant message
//! that requested it.

use vx_domain::message::{Message, Role};

pub struct DialogueBuffer {
    system: Message,
    messages: Vec<Message>,
    max_history: usize,
}

impl DialogueBuffer {
    pub fn new(system_prompt: &str, max_history: usize) -> Self {
        Self {
            system: Message::system(system_prompt),
            messages: Vec::new(),
            max_history,
        }
    }

    /// Replace the system prompt (persona changes).
    pub fn set_system_prompt(&mut self, prompt: &str) {
        self.system = Message::system(prompt);
    }

    /// Append a message, truncating the history if needed.
    pub fn put(&mut self, msg: Message) {
        self.messages.push(msg);
        if self.messages.len() > self.max_history {
            let excess = self.messages.len() - self.max_history;
            self.messages.drain(..excess);
            // A tool result must follow its requesting assistant
            // message; drop orphaned leaders.
            while self
                .messages
                .first()
                .is_some_and(|m| m.role == Role::Tool)
            {
                self.messages.remove(0);
            }
        }
    }

    /// The messages for the next LLM call: system prompt first.
    pub fn get_llm_dialogue(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(self.system.clone());
        out.extend(self.messages.iter().cloned());
        out
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
