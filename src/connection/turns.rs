//! Per-turn fragment reconciliation. Fragments can arrive before their
//! turn's authoritative identifier is known; they buffer under a
//! locally-generated placeholder and migrate in place, with no loss and
//! no duplication, once the real identifier shows up.

use std::collections::HashMap;

use uuid::Uuid;

use super::transport::Usage;

#[derive(Debug, Clone, Default)]
pub struct Turn {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Default)]
pub struct TurnLedger {
    turns: HashMap<String, Turn>,
    /// At most one placeholder is live; identifier-less fragments share it
    /// until an authoritative id appears.
    placeholder: Option<String>,
}

impl TurnLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an event's response identifier. An authoritative id wins and
    /// absorbs any placeholder-buffered text; otherwise the (lazily created)
    /// placeholder is shared by subsequent identifier-less fragments.
    pub fn resolve(&mut self, explicit: Option<&str>) -> String {
        if let Some(id) = explicit {
            if let Some(placeholder) = self.placeholder.take() {
                if placeholder != id {
                    if let Some(buffered) = self.turns.remove(&placeholder) {
                        let turn = self.turns.entry(id.to_string()).or_default();
                        turn.text.push_str(&buffered.text);
                        turn.usage.input_tokens += buffered.usage.input_tokens;
                        turn.usage.output_tokens += buffered.usage.output_tokens;
                    }
                }
            }
            return id.to_string();
        }

        if let Some(placeholder) = &self.placeholder {
            return placeholder.clone();
        }
        let placeholder = format!("pending-{}", Uuid::new_v4());
        self.placeholder = Some(placeholder.clone());
        placeholder
    }

    pub fn append_text(&mut self, id: &str, text: &str) {
        self.turns.entry(id.to_string()).or_default().text.push_str(text);
    }

    /// Finalize the turn: remove and return it, and clear the placeholder so
    /// the next turn starts fresh.
    pub fn complete(&mut self, id: &str, usage: Usage) -> Turn {
        let mut turn = self.turns.remove(id).unwrap_or_default();
        turn.usage = usage;
        self.placeholder = None;
        turn
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.placeholder = None;
    }

    #[cfg(test)]
    fn buffered_text(&self, id: &str) -> Option<&str> {
        self.turns.get(id).map(|t| t.text.as_str())
    }
}
