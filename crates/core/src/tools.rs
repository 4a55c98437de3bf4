//! Tool Dispatcher
//!
//! The remote model can ask the client to run a named function. This module
//! owns the registry of such functions and turns a [`ToolCall`] into response
//! text. Dispatch never fails: unknown tools get [`FALLBACK_RESPONSE`] and
//! unparsable arguments are treated as empty.

use crate::error::ToolDispatchError;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::{collections::HashMap, marker::PhantomData};
use tracing::{info, warn};

/// Response returned for tool names that are not registered.
pub const FALLBACK_RESPONSE: &str = "La herramienta solicitada no está disponible.";

/// A function invocation requested by the remote model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub name: String,
    /// Raw JSON text of the arguments, as sent on the wire.
    pub arguments_json: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments_json: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments_json: arguments_json.into(),
        }
    }
}

/// A locally implemented function the remote model may call.
///
/// Implementations must be pure: no network or media I/O. Dispatch happens
/// synchronously on the session's event path.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object. Informational only.
    fn parameters(&self) -> Value;

    /// Runs the tool. `arguments` is an empty object when the caller sent
    /// nothing usable.
    fn call(&self, arguments: Value) -> String;
}

/// A [`Tool`] backed by a closure over typed arguments.
///
/// Arguments that do not deserialize into `A` fall back to `A::default()`, so
/// the handler decides what a missing or malformed field means.
pub struct FunctionTool<A> {
    name: String,
    description: String,
    handler: Box<dyn Fn(A) -> String + Send + Sync>,
    _args: PhantomData<fn(A)>,
}

impl<A> FunctionTool<A>
where
    A: DeserializeOwned + JsonSchema + Default + 'static,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl Fn(A) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            handler: Box::new(handler),
            _args: PhantomData,
        }
    }
}

impl<A> Tool for FunctionTool<A>
where
    A: DeserializeOwned + JsonSchema + Default + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(A)).unwrap_or(Value::Null)
    }

    fn call(&self, arguments: Value) -> String {
        let parsed = serde_json::from_value::<A>(arguments).unwrap_or_else(|e| {
            warn!(tool = %self.name, error = %e, "Arguments do not match the tool schema; using defaults.");
            A::default()
        });
        (self.handler)(parsed)
    }
}

/// Immutable registry of tools, keyed by name.
pub struct ToolDispatcher {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolDispatcher {
    /// Builds the registry. A later tool replaces an earlier one with the same name.
    pub fn new(tools: impl IntoIterator<Item = Box<dyn Tool>>) -> Self {
        let mut registry: HashMap<String, Box<dyn Tool>> = HashMap::new();
        for tool in tools {
            let name = tool.name().to_string();
            if registry.insert(name.clone(), tool).is_some() {
                warn!(tool = %name, "Tool registered twice; keeping the last registration.");
            }
        }
        Self { tools: registry }
    }

    /// Creates a dispatcher with no tools; every call gets the fallback.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Runs the tool named by `call` and returns its response text.
    pub fn dispatch(&self, call: &ToolCall) -> String {
        match self.try_dispatch(call) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Tool call could not be dispatched; replying with fallback.");
                FALLBACK_RESPONSE.to_string()
            }
        }
    }

    fn try_dispatch(&self, call: &ToolCall) -> Result<String, ToolDispatchError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolDispatchError::UnknownTool(call.name.clone()))?;

        let arguments = match serde_json::from_str::<Value>(&call.arguments_json) {
            Ok(value) => value,
            Err(source) => {
                let e = ToolDispatchError::MalformedArguments {
                    name: call.name.clone(),
                    source,
                };
                warn!(error = %e, "Treating tool arguments as empty.");
                json!({})
            }
        };

        info!(tool = %call.name, "Executing tool");
        Ok(tool.call(arguments))
    }

    /// OpenAI-style function definitions for every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<Value> {
        let mut tools: Vec<&dyn Tool> = self.tools.values().map(|tool| tool.as_ref()).collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema, Default)]
    struct EchoArgs {
        #[serde(default)]
        word: String,
    }

    fn echo_tool(name: &str, prefix: &'static str) -> Box<dyn Tool> {
        Box::new(FunctionTool::new(name, "Echoes a word.", move |args: EchoArgs| {
            format!("{}{}", prefix, args.word)
        }))
    }

    #[test]
    fn test_dispatch_registered_tool() {
        let dispatcher = ToolDispatcher::new(vec![echo_tool("echo", "")]);
        let response = dispatcher.dispatch(&ToolCall::new("echo", r#"{"word":"hola"}"#));
        assert_eq!(response, "hola");
    }

    #[test]
    fn test_unknown_tool_gets_fallback() {
        let dispatcher = ToolDispatcher::new(vec![echo_tool("echo", "")]);
        let response = dispatcher.dispatch(&ToolCall::new("unregistered_tool", "{}"));
        assert_eq!(response, FALLBACK_RESPONSE);

        let response = ToolDispatcher::empty().dispatch(&ToolCall::new("echo", "{}"));
        assert_eq!(response, FALLBACK_RESPONSE);
    }

    #[test]
    fn test_malformed_arguments_degrade_to_defaults() {
        let dispatcher = ToolDispatcher::new(vec![echo_tool("echo", ">")]);

        // Not JSON at all.
        assert_eq!(dispatcher.dispatch(&ToolCall::new("echo", "{word:")), ">");
        // JSON, but the wrong shape for the arguments.
        assert_eq!(dispatcher.dispatch(&ToolCall::new("echo", r#"{"word":42}"#)), ">");
        // Empty string.
        assert_eq!(dispatcher.dispatch(&ToolCall::new("echo", "")), ">");
    }

    #[test]
    fn test_duplicate_registration_keeps_last() {
        let dispatcher =
            ToolDispatcher::new(vec![echo_tool("echo", "first:"), echo_tool("echo", "second:")]);
        assert_eq!(
            dispatcher.dispatch(&ToolCall::new("echo", r#"{"word":"x"}"#)),
            "second:x"
        );
    }

    #[test]
    fn test_definitions_expose_schema() {
        let dispatcher = ToolDispatcher::new(vec![echo_tool("echo", "")]);
        let definitions = dispatcher.definitions();
        assert_eq!(definitions.len(), 1);

        let function = &definitions[0]["function"];
        assert_eq!(definitions[0]["type"], "function");
        assert_eq!(function["name"], "echo");
        assert_eq!(function["description"], "Echoes a word.");
        assert!(function["parameters"]["properties"]["word"].is_object());
    }
}
