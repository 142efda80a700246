//! ReAct Engine (spec §4.5, component C5).
//!
//! Drives a Thought/Action/Observation/Answer reasoning loop against
//! [`ModelClient::chat_stream`], publishing events to the event bus as
//! complete semantic units are recognised. Knows nothing about HTTP: it is
//! parameterised entirely by the event-bus producer and the tool registry.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::PipelineError;
use crate::event_bus::EventBusProducer;
use crate::model_clients::{ChatMessage, ModelClient, StreamEvent};
use crate::tools::knowledge_search::CitationSink;
use crate::tools::ToolRegistry;
use crate::wire::{DocumentRef, WireEvent};

pub struct ReactEngine {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    max_iterations: usize,
    observation_limit: usize,
    tool_timeout_secs: u64,
}

/// The finalised result of one reasoning run: what gets persisted as the
/// assistant message's content and `extra_data` side channels (spec §6.3).
pub struct ReactOutcome {
    pub answer: String,
    pub thoughts: Vec<String>,
    pub actions: Vec<String>,
    pub observations: Vec<String>,
    pub iteration_budget_exceeded: bool,
}

impl ReactEngine {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        max_iterations: usize,
        observation_limit: usize,
        tool_timeout_secs: u64,
    ) -> Self {
        Self { model, tools, max_iterations, observation_limit, tool_timeout_secs }
    }

    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        bus: &EventBusProducer,
        citations: &CitationSink,
    ) -> ReactOutcome {
        let mut thoughts = Vec::new();
        let mut actions_log = Vec::new();
        let mut observations_log = Vec::new();
        let mut answer = String::new();
        let mut previous_action: Option<String> = None;
        let mut consecutive_duplicates = 0usize;
        let mut exhausted_budget = true;

        'outer: for _iteration in 0..self.max_iterations {
            if bus.is_cancelled() {
                exhausted_budget = false;
                break;
            }

            let IterationResult { thought_lines, action, answer_text, observation_violation } =
                self.run_one_completion(&messages, bus).await;

            thoughts.extend(thought_lines);
            if observation_violation {
                warn!("model fabricated an Observation: line, discarding and continuing");
            }

            if !answer_text.is_empty() {
                answer = answer_text;
                exhausted_budget = false;
                break;
            }

            let Some(action_line) = action else {
                // No Action and no Answer this iteration: nothing to dispatch, try again.
                continue;
            };

            actions_log.push(action_line.clone());
            bus.publish(WireEvent::Action { content: action_line.clone() }).await;

            let is_duplicate = previous_action.as_deref() == Some(action_line.as_str());
            if is_duplicate {
                consecutive_duplicates += 1;
                if consecutive_duplicates >= 2 {
                    // Two duplicates in a row: terminate with the best partial
                    // answer, not an iteration-budget error.
                    exhausted_budget = false;
                    break 'outer;
                }
                let observation = "Duplicate action detected; please answer based on prior observations.".to_string();
                observations_log.push(observation.clone());
                bus.publish(WireEvent::Observation { content: observation.clone() }).await;
                messages.push(ChatMessage::assistant(format!("Action: {action_line}")));
                messages.push(ChatMessage::user(format!(
                    "Observation: {observation}\nPlease produce an Answer: now based on what you already know."
                )));
                previous_action = Some(action_line);
                continue;
            }
            consecutive_duplicates = 0;
            previous_action = Some(action_line.clone());

            let (tool_name, tool_args) = match parse_action(&action_line) {
                Some(parts) => parts,
                None => {
                    let observation = format!("Error: could not parse action '{action_line}'");
                    observations_log.push(observation.clone());
                    bus.publish(WireEvent::Observation { content: observation.clone() }).await;
                    messages.push(ChatMessage::assistant(format!("Action: {action_line}")));
                    messages.push(ChatMessage::user(format!("Observation: {observation}")));
                    continue;
                }
            };

            let raw_observation = tokio::time::timeout(
                std::time::Duration::from_secs(self.tool_timeout_secs),
                self.tools.invoke(tool_name, tool_args),
            )
            .await
            .unwrap_or_else(|_| format!("Error: tool {tool_name} timed out"));

            let observation = ragchat_core::excerpts::truncate_with_ellipsis(&raw_observation, self.observation_limit);
            observations_log.push(observation.clone());
            bus.publish(WireEvent::Observation { content: observation.clone() }).await;

            messages.push(ChatMessage::assistant(format!("Thought: (tool call)\nAction: {action_line}")));
            messages.push(ChatMessage::user(format!("Observation: {observation}")));
        }

        let budget_exceeded = answer.is_empty() && exhausted_budget;
        if budget_exceeded {
            bus.publish(WireEvent::Error {
                message: PipelineError::IterationBudgetExceeded.to_string(),
                kind: Some(PipelineError::IterationBudgetExceeded.wire_kind().to_string()),
            })
            .await;
        }
        if answer.is_empty() && !bus.is_cancelled() {
            answer = best_effort_answer(&thoughts, &observations_log);
        }

        let cited = citations.take_deduplicated();
        if !cited.is_empty() {
            let documents = cited
                .into_iter()
                .map(|p| DocumentRef { uuid: p.document_id, name: p.filename })
                .collect();
            bus.publish(WireEvent::Documents { documents }).await;
        }

        ReactOutcome {
            answer,
            thoughts,
            actions: actions_log,
            observations: observations_log,
            iteration_budget_exceeded: budget_exceeded,
        }
    }

    /// Drive one streaming completion to the point where it either starts an
    /// `Answer:` region (in which case every subsequent token is streamed as
    /// `AnswerChunk` until the stream ends) or ends without one.
    async fn run_one_completion(&self, messages: &[ChatMessage], bus: &EventBusProducer) -> IterationResult {
        let (tx, mut rx) = mpsc::channel(64);
        let model = self.model.clone();
        let request = messages.to_vec();
        let handle = tokio::spawn(async move { model.chat_stream(request, true, tx).await });

        let mut parser = TagParser::new();
        let mut thought_lines = Vec::new();
        let mut action = None;
        let mut answer_text = String::new();
        let mut observation_violation = false;
        let mut cancelled_early = false;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta(delta) => {
                    for parsed in parser.feed(&delta) {
                        match parsed {
                            ParseEvent::Thought(content) => {
                                bus.publish(WireEvent::Thought { content: content.clone() }).await;
                                thought_lines.push(content);
                            }
                            ParseEvent::Action(content) => {
                                action = Some(content);
                            }
                            ParseEvent::AnswerChunk(text) => {
                                answer_text.push_str(&text);
                                bus.publish(WireEvent::AnswerChunk { text }).await;
                            }
                            ParseEvent::ObservationViolation => {
                                observation_violation = true;
                            }
                        }
                    }
                    if observation_violation {
                        break;
                    }
                    if bus.is_cancelled() {
                        cancelled_early = true;
                        break;
                    }
                }
                StreamEvent::Usage(_) => {}
                StreamEvent::Done => break,
                StreamEvent::Error(message) => {
                    bus.publish(WireEvent::Error { message, kind: Some("BackendProtocolError".into()) }).await;
                    break;
                }
            }
        }

        // The backend task may keep producing deltas after an early exit; the
        // bounded channel would otherwise let it block forever on a full
        // buffer that nothing drains anymore.
        if observation_violation || cancelled_early {
            handle.abort();
        } else {
            let _ = handle.await;
        }
        IterationResult { thought_lines, action, answer_text, observation_violation }
    }
}

struct IterationResult {
    thought_lines: Vec<String>,
    action: Option<String>,
    answer_text: String,
    observation_violation: bool,
}

fn best_effort_answer(thoughts: &[String], observations: &[String]) -> String {
    observations
        .last()
        .or_else(|| thoughts.last())
        .cloned()
        .unwrap_or_else(|| "I was unable to complete this within the allotted reasoning steps.".to_string())
}

/// Parse `tool_name(arguments)`; the arguments string is handed verbatim to
/// [`ToolRegistry::invoke`], which does its own CSV/JSON parsing.
fn parse_action(action_line: &str) -> Option<(&str, &str)> {
    let open = action_line.find('(')?;
    let close = action_line.rfind(')')?;
    if close < open {
        return None;
    }
    let name = action_line[..open].trim();
    let args = &action_line[open + 1..close];
    if name.is_empty() {
        return None;
    }
    Some((name, args))
}

enum ParseEvent {
    Thought(String),
    Action(String),
    AnswerChunk(String),
    ObservationViolation,
}

/// Stateful line-oriented tag recogniser. Outside an `Answer:` region, text
/// is buffered to end-of-line; once inside one, every subsequent byte is
/// forwarded immediately (true token-level streaming, spec §4.5).
struct TagParser {
    line_buf: String,
    in_answer: bool,
}

impl TagParser {
    fn new() -> Self {
        Self { line_buf: String::new(), in_answer: false }
    }

    fn feed(&mut self, delta: &str) -> Vec<ParseEvent> {
        if self.in_answer {
            return vec![ParseEvent::AnswerChunk(delta.to_string())];
        }

        self.line_buf.push_str(delta);
        let mut out = Vec::new();

        while !self.in_answer {
            let Some(pos) = self.line_buf.find('\n') else { break };
            let line: String = self.line_buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(rest) = line.strip_prefix("Thought:") {
                out.push(ParseEvent::Thought(rest.trim().to_string()));
            } else if let Some(rest) = line.strip_prefix("Action:") {
                out.push(ParseEvent::Action(rest.trim().to_string()));
            } else if let Some(rest) = line.strip_prefix("Answer:") {
                self.in_answer = true;
                let rest = rest.trim_start().to_string();
                if !rest.is_empty() {
                    out.push(ParseEvent::AnswerChunk(rest));
                }
            } else if line.trim_start().starts_with("Observation:") {
                out.push(ParseEvent::ObservationViolation);
                break;
            }
        }

        if self.in_answer && !self.line_buf.is_empty() {
            out.push(ParseEvent::AnswerChunk(std::mem::take(&mut self.line_buf)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thought_and_action_lines() {
        let mut parser = TagParser::new();
        let events = parser.feed("Thought: I should search\nAction: knowledge_search(\"x\")\n");
        assert!(matches!(&events[0], ParseEvent::Thought(t) if t == "I should search"));
        assert!(matches!(&events[1], ParseEvent::Action(a) if a == "knowledge_search(\"x\")"));
    }

    #[test]
    fn answer_region_streams_token_by_token_without_line_buffering() {
        let mut parser = TagParser::new();
        let first = parser.feed("Answer: Par");
        assert!(matches!(&first[0], ParseEvent::AnswerChunk(t) if t == "Par"));
        let second = parser.feed("is is the capital");
        assert!(matches!(&second[0], ParseEvent::AnswerChunk(t) if t == "is is the capital"));
    }

    #[test]
    fn fabricated_observation_is_flagged_not_emitted_as_text() {
        let mut parser = TagParser::new();
        let events = parser.feed("Observation: I made this up\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ParseEvent::ObservationViolation));
    }

    #[test]
    fn split_line_across_chunks_still_parses() {
        let mut parser = TagParser::new();
        assert!(parser.feed("Thought: partial ").is_empty());
        let events = parser.feed("thought\n");
        assert!(matches!(&events[0], ParseEvent::Thought(t) if t == "partial thought"));
    }

    #[test]
    fn parse_action_splits_name_and_arguments() {
        assert_eq!(parse_action("knowledge_search(query=\"x\", k=3)"), Some(("knowledge_search", "query=\"x\", k=3")));
        assert_eq!(parse_action("malformed"), None);
    }

    #[test]
    fn best_effort_answer_prefers_last_observation() {
        let thoughts = vec!["thinking".to_string()];
        let observations = vec!["last result".to_string()];
        assert_eq!(best_effort_answer(&thoughts, &observations), "last result");
    }
}
