//! Raw producer events -> canonical transitions.
//!
//! Producers name the same transition differently (`job-progress` from the
//! job queue, `generation-progress` from the media pipeline, `agent-*` from
//! the agent runner). Everything that knows about those names lives in
//! [`RAW_EVENT_TABLE`]; the aggregators only see [`CanonicalEvent`].

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    JobProgress,
    JobComplete,
    JobFailed,
    StreamStart,
    StreamDelta,
    StreamEnd,
    ToolStart,
    ToolComplete,
    ToolError,
    SessionError,
}

pub const RAW_EVENT_TABLE: &[(&str, Transition)] = &[
    ("job-progress", Transition::JobProgress),
    ("generation-progress", Transition::JobProgress),
    ("agent-tool-complete", Transition::JobProgress),
    ("job-complete", Transition::JobComplete),
    ("generation-complete", Transition::JobComplete),
    ("agent-complete", Transition::JobComplete),
    ("job-failed", Transition::JobFailed),
    ("generation-error", Transition::JobFailed),
    ("agent-tool-error", Transition::JobFailed),
    ("message-start", Transition::StreamStart),
    ("message-delta", Transition::StreamDelta),
    ("message-end", Transition::StreamEnd),
    ("tool-start", Transition::ToolStart),
    ("tool-complete", Transition::ToolComplete),
    ("tool-error", Transition::ToolError),
    ("session-error", Transition::SessionError),
    ("message-error", Transition::SessionError),
    ("stream-error", Transition::SessionError),
];

pub fn transition_for(event: &str) -> Option<Transition> {
    RAW_EVENT_TABLE
        .iter()
        .find(|(name, _)| *name == event)
        .map(|(_, transition)| *transition)
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress {
        job_id: Option<String>,
        progress: Option<u8>,
        status: Option<String>,
        message: Option<String>,
    },
    Complete {
        job_id: Option<String>,
        result: Value,
    },
    Failed {
        job_id: Option<String>,
        error: String,
        retries_left: Option<u32>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobEvent::Progress { job_id, .. }
            | JobEvent::Complete { job_id, .. }
            | JobEvent::Failed { job_id, .. } => job_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        message_id: Option<String>,
    },
    Delta {
        delta: String,
    },
    End {
        content: Option<String>,
        model: Option<String>,
        tokens_used: Option<u64>,
    },
    ToolStart {
        tool_name: String,
        input: Option<Value>,
    },
    ToolComplete {
        tool_name: String,
        input: Option<Value>,
    },
    ToolError {
        tool_name: String,
        error: Option<String>,
    },
    SessionError {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    Job(JobEvent),
    Stream(StreamEvent),
}

/// Returns `None` for unknown event names and for payloads missing a field
/// the transition cannot do without (tool events without a tool name).
pub fn normalize(event: &str, payload: &Value) -> Option<CanonicalEvent> {
    let transition = transition_for(event)?;
    let normalized = match transition {
        Transition::JobProgress => CanonicalEvent::Job(JobEvent::Progress {
            job_id: job_id(payload),
            progress: progress_field(payload),
            status: str_field(payload, &["status", "stage"]),
            message: str_field(payload, &["message"]),
        }),
        Transition::JobComplete => CanonicalEvent::Job(JobEvent::Complete {
            job_id: job_id(payload),
            result: field(payload, &["result", "output"])
                .cloned()
                .unwrap_or(Value::Null),
        }),
        Transition::JobFailed => CanonicalEvent::Job(JobEvent::Failed {
            job_id: job_id(payload),
            error: error_text(payload).unwrap_or_else(|| "Unknown error".to_string()),
            retries_left: field(payload, &["retriesLeft", "retries_left"])
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok()),
        }),
        Transition::StreamStart => CanonicalEvent::Stream(StreamEvent::Start {
            message_id: str_field(payload, &["messageId", "message_id"]),
        }),
        Transition::StreamDelta => CanonicalEvent::Stream(StreamEvent::Delta {
            delta: str_field(payload, &["delta", "content"]).unwrap_or_default(),
        }),
        Transition::StreamEnd => CanonicalEvent::Stream(StreamEvent::End {
            content: str_field(payload, &["content"]),
            model: str_field(payload, &["model"]),
            tokens_used: field(payload, &["tokensUsed", "tokens_used"]).and_then(Value::as_u64),
        }),
        Transition::ToolStart => CanonicalEvent::Stream(StreamEvent::ToolStart {
            tool_name: tool_name(payload)?,
            input: tool_input(payload),
        }),
        Transition::ToolComplete => CanonicalEvent::Stream(StreamEvent::ToolComplete {
            tool_name: tool_name(payload)?,
            input: tool_input(payload),
        }),
        Transition::ToolError => CanonicalEvent::Stream(StreamEvent::ToolError {
            tool_name: tool_name(payload)?,
            error: error_text(payload),
        }),
        Transition::SessionError => CanonicalEvent::Stream(StreamEvent::SessionError {
            error: error_text(payload).unwrap_or_else(|| "Stream failed".to_string()),
        }),
    };
    Some(normalized)
}

fn field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let object = payload.as_object()?;
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

fn str_field(payload: &Value, keys: &[&str]) -> Option<String> {
    field(payload, keys)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn job_id(payload: &Value) -> Option<String> {
    match field(payload, &["jobId", "job_id", "generationId"])? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn progress_field(payload: &Value) -> Option<u8> {
    let raw = match field(payload, &["progress", "percent"])? {
        Value::Number(value) => value.as_f64()?,
        Value::String(value) => value.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

fn error_text(payload: &Value) -> Option<String> {
    match field(payload, &["error", "message"])? {
        Value::String(value) => Some(value.clone()),
        Value::Object(object) => object
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        other => Some(other.to_string()),
    }
}

fn tool_name(payload: &Value) -> Option<String> {
    str_field(payload, &["toolName", "tool_name", "name"]).filter(|name| !name.trim().is_empty())
}

fn tool_input(payload: &Value) -> Option<Value> {
    field(payload, &["toolInput", "tool_input", "input"]).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_progress_alias_maps_to_progress_update() {
        for name in ["job-progress", "generation-progress", "agent-tool-complete"] {
            let event = normalize(name, &json!({"jobId": "J1", "progress": 40, "status": "processing"}))
                .expect("known event");
            assert_eq!(
                event,
                CanonicalEvent::Job(JobEvent::Progress {
                    job_id: Some("J1".to_string()),
                    progress: Some(40),
                    status: Some("processing".to_string()),
                    message: None,
                }),
                "{name}"
            );
        }
    }

    #[test]
    fn completion_and_failure_aliases() {
        for name in ["job-complete", "generation-complete", "agent-complete"] {
            assert!(matches!(
                normalize(name, &json!({"result": {"url": "x"}})),
                Some(CanonicalEvent::Job(JobEvent::Complete { .. }))
            ));
        }
        for name in ["job-failed", "generation-error", "agent-tool-error"] {
            assert!(matches!(
                normalize(name, &json!({"error": "boom"})),
                Some(CanonicalEvent::Job(JobEvent::Failed { .. }))
            ));
        }
    }

    #[test]
    fn failure_reads_nested_error_and_retry_hint() {
        let event = normalize(
            "job-failed",
            &json!({"job_id": 7, "error": {"message": "quota"}, "retriesLeft": 2}),
        );
        assert_eq!(
            event,
            Some(CanonicalEvent::Job(JobEvent::Failed {
                job_id: Some("7".to_string()),
                error: "quota".to_string(),
                retries_left: Some(2),
            }))
        );
    }

    #[test]
    fn progress_accepts_strings_and_clamps() {
        let parse = |value: Value| match normalize("job-progress", &json!({ "progress": value })) {
            Some(CanonicalEvent::Job(JobEvent::Progress { progress, .. })) => progress,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(parse(json!("55%")), Some(55));
        assert_eq!(parse(json!(140)), Some(100));
        assert_eq!(parse(json!(-3)), Some(0));
        assert_eq!(parse(json!(12.6)), Some(13));
        assert_eq!(parse(json!(true)), None);
    }

    #[test]
    fn tool_events_require_a_name() {
        assert_eq!(normalize("tool-start", &json!({"toolInput": {"q": 1}})), None);
        assert_eq!(
            normalize("tool-start", &json!({"toolName": "search", "toolInput": {"q": 1}})),
            Some(CanonicalEvent::Stream(StreamEvent::ToolStart {
                tool_name: "search".to_string(),
                input: Some(json!({"q": 1})),
            }))
        );
    }

    #[test]
    fn unknown_names_are_dropped() {
        assert_eq!(normalize("job-progressed", &json!({})), None);
        assert_eq!(transition_for("message-end"), Some(Transition::StreamEnd));
    }
}
