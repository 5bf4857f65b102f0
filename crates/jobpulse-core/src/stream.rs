use crate::normalize::StreamEvent;
use crate::{StreamSnapshot, StreamState, ToolEntry, ToolStatus};

/// Per-conversation state machine for incrementally produced responses.
#[derive(Debug, Clone, Default)]
pub struct StreamAggregator {
    snapshot: StreamSnapshot,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &StreamSnapshot {
        &self.snapshot
    }

    pub fn reset(&mut self) {
        self.snapshot = StreamSnapshot::default();
    }

    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Start { message_id } => {
                self.snapshot = StreamSnapshot {
                    state: StreamState::Streaming,
                    message_id: message_id.clone(),
                    ..StreamSnapshot::default()
                };
                true
            }
            StreamEvent::Delta { delta } => {
                if !self.snapshot.is_streaming() || delta.is_empty() {
                    return false;
                }
                self.snapshot.content.push_str(delta);
                true
            }
            StreamEvent::End {
                content,
                model,
                tokens_used,
            } => {
                if !self.snapshot.is_streaming() {
                    return false;
                }
                self.snapshot.state = StreamState::Finalized;
                if self.snapshot.content.is_empty() {
                    if let Some(content) = content {
                        self.snapshot.content = content.clone();
                    }
                }
                self.snapshot.model = model.clone();
                self.snapshot.tokens_used = *tokens_used;
                true
            }
            StreamEvent::ToolStart { tool_name, input } => {
                self.snapshot.tools.insert(
                    tool_name.clone(),
                    ToolEntry {
                        status: ToolStatus::Running,
                        input: input.clone(),
                        error: None,
                    },
                );
                true
            }
            StreamEvent::ToolComplete { tool_name, input } => {
                let entry = self
                    .snapshot
                    .tools
                    .entry(tool_name.clone())
                    .or_insert_with(|| ToolEntry {
                        status: ToolStatus::Running,
                        input: None,
                        error: None,
                    });
                entry.status = ToolStatus::Complete;
                if input.is_some() {
                    entry.input = input.clone();
                }
                true
            }
            StreamEvent::ToolError { tool_name, error } => {
                let entry = self
                    .snapshot
                    .tools
                    .entry(tool_name.clone())
                    .or_insert_with(|| ToolEntry {
                        status: ToolStatus::Running,
                        input: None,
                        error: None,
                    });
                entry.status = ToolStatus::Error;
                entry.error = Some(error.clone().unwrap_or_else(|| "Tool failed".to_string()));
                true
            }
            StreamEvent::SessionError { error } => {
                if !self.snapshot.is_streaming() {
                    return false;
                }
                self.snapshot.state = StreamState::Error;
                self.snapshot.error = Some(error.clone());
                for entry in self.snapshot.tools.values_mut() {
                    if entry.status == ToolStatus::Running {
                        entry.status = ToolStatus::Error;
                        entry.error = Some(error.clone());
                    }
                }
                true
            }
        }
    }
}
