//! Tool Registry (spec §4.4, component C4).
//!
//! A name → descriptor map exposed to the ReAct engine. Invocations never
//! raise: schema violations and handler exceptions both come back as a
//! human-readable observation prefixed `Error:`, matching the convention the
//! rest of the stack uses for tool failures.

pub mod external;
pub mod knowledge_search;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Argument type as declared in a [`ToolDescriptor`]'s schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
}

#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub ty: ArgType,
    pub required: bool,
}

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub args: Vec<ArgSpec>,
    pub handler: Arc<dyn ToolHandler>,
}

/// A tool's actual behaviour, given already-validated arguments.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: HashMap<String, Value>) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name, descriptor);
    }

    /// Rendered textual catalogue for the system prompt: name, description,
    /// and argument list, one tool per paragraph.
    pub fn describe_all(&self) -> String {
        let mut names: Vec<&&str> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let tool = &self.tools[name];
                let args = tool
                    .args
                    .iter()
                    .map(|a| {
                        format!(
                            "{}: {}{}",
                            a.name,
                            arg_type_name(a.ty),
                            if a.required { "" } else { " (optional)" }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}({}) - {}", tool.name, args, tool.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parse `argument_string` against the named tool's schema (CSV or JSON
    /// object), then invoke its handler. Never returns `Err`: every failure
    /// mode becomes an `Error:`-prefixed observation string instead.
    pub async fn invoke(&self, name: &str, argument_string: &str) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("Error: unknown tool '{name}'");
        };

        let args = match parse_arguments(argument_string, &tool.args) {
            Ok(args) => args,
            Err(e) => return format!("Error: {e}"),
        };

        match tool.handler.call(args).await {
            Ok(observation) => observation,
            Err(e) => {
                warn!(tool = name, error = %e, "tool handler failed");
                format!("Error: {e}")
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn arg_type_name(ty: ArgType) -> &'static str {
    match ty {
        ArgType::String => "string",
        ArgType::Integer => "integer",
        ArgType::Number => "number",
        ArgType::Boolean => "boolean",
    }
}

/// Accept either a JSON object (`{"query": "x", "k": 3}`) or a lenient
/// positional CSV (`x, 3`) matched in schema-declared order.
fn parse_arguments(raw: &str, schema: &[ArgSpec]) -> anyhow::Result<HashMap<String, Value>> {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        let parsed: HashMap<String, Value> = serde_json::from_str(trimmed)
            .map_err(|e| anyhow::anyhow!("invalid JSON arguments: {e}"))?;
        return validate(parsed, schema);
    }

    let positional: Vec<&str> = if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split(',').map(|s| s.trim()).collect()
    };

    let mut parsed = HashMap::new();
    for (spec, value) in schema.iter().zip(positional.iter()) {
        let value = strip_quotes(value);
        let coerced = coerce(spec, value)?;
        parsed.insert(spec.name.to_string(), coerced);
    }
    validate(parsed, schema)
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches('"').trim_matches('\'')
}

fn coerce(spec: &ArgSpec, raw: &str) -> anyhow::Result<Value> {
    match spec.ty {
        ArgType::String => Ok(Value::String(raw.to_string())),
        ArgType::Integer => raw
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| anyhow::anyhow!("argument '{}' expects an integer, got '{raw}'", spec.name)),
        ArgType::Number => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| anyhow::anyhow!("argument '{}' expects a number, got '{raw}'", spec.name)),
        ArgType::Boolean => raw
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|_| anyhow::anyhow!("argument '{}' expects a boolean, got '{raw}'", spec.name)),
    }
}

fn validate(args: HashMap<String, Value>, schema: &[ArgSpec]) -> anyhow::Result<HashMap<String, Value>> {
    for spec in schema {
        if spec.required && !args.contains_key(spec.name) {
            return Err(anyhow::anyhow!("missing required argument '{}'", spec.name));
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: HashMap<String, Value>) -> anyhow::Result<String> {
            Ok(format!("{args:?}"))
        }
    }

    struct Boom;

    #[async_trait]
    impl ToolHandler for Boom {
        async fn call(&self, _args: HashMap<String, Value>) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("handler exploded"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(ToolDescriptor {
            name: "echo",
            description: "echoes its arguments",
            args: vec![ArgSpec { name: "text", ty: ArgType::String, required: true }],
            handler: Arc::new(Echo),
        });
        reg.register(ToolDescriptor {
            name: "boom",
            description: "always fails",
            args: vec![],
            handler: Arc::new(Boom),
        });
        reg
    }

    #[tokio::test]
    async fn invoke_parses_json_arguments() {
        let reg = registry();
        let out = reg.invoke("echo", r#"{"text": "hi"}"#).await;
        assert!(out.contains("hi"));
    }

    #[tokio::test]
    async fn invoke_parses_csv_arguments() {
        let reg = registry();
        let out = reg.invoke("echo", "hello world").await;
        assert!(out.contains("hello world"));
    }

    #[tokio::test]
    async fn invoke_reports_unknown_tool_as_error_string() {
        let reg = registry();
        let out = reg.invoke("nope", "").await;
        assert!(out.starts_with("Error:"));
    }

    #[tokio::test]
    async fn invoke_reports_missing_required_argument_as_error_string() {
        let reg = registry();
        let out = reg.invoke("echo", "").await;
        assert!(out.starts_with("Error:"));
    }

    #[tokio::test]
    async fn invoke_reports_handler_exception_as_error_string_not_panic() {
        let reg = registry();
        let out = reg.invoke("boom", "").await;
        assert!(out.starts_with("Error:"));
    }

    #[test]
    fn describe_all_lists_name_and_args() {
        let reg = registry();
        let desc = reg.describe_all();
        assert!(desc.contains("echo(text: string) - echoes its arguments"));
    }
}
