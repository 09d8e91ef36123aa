use crate::chat::types::ChatMessage;

/// Answering persona. Seeded exactly once per session; always the first
/// message and never touched by later turns.
const PERSONA: &str = "Answer the user query faithfully using the information in the context. \
Structure the answer in a way that is easy to read and educational, using markdown. \
Do not start your answer with a markdown heading; you can use headings further down to mark sections.\n\n\
If the context doesn't answer the question, do not answer the question, just say 'I don't know'.\n\n\
Don't start your answer with something like 'Based on the context...'. Do not mention the context \
in your answer. This is very important! Return the answer directly.";

/// Ordered, append-only message history for one session.
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            messages: vec![ChatMessage::system(PERSONA)],
        }
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
