//! The built-in `decir_chiste` tool.

use crate::tools::{FunctionTool, Tool, ToolDispatcher};
use schemars::JsonSchema;
use serde::Deserialize;

pub const TOOL_NAME: &str = "decir_chiste";

pub const PROGRAMMER_JOKE: &str =
    "¿Por qué los programadores prefieren el tema oscuro? Porque la luz atrae a los bugs.";
pub const DEFAULT_JOKE: &str = "¿Qué le dice un pez a otro? ¡Nada!";

/// Arguments for `decir_chiste`.
#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct JokeArgs {
    #[schemars(description = "El tema sobre el que debe ser el chiste, por ejemplo, 'programadores'")]
    #[serde(default)]
    pub tema: String,
}

/// Picks a joke for the requested topic.
pub fn tell_joke(args: JokeArgs) -> String {
    match args.tema.trim().to_lowercase().as_str() {
        "programadores" => PROGRAMMER_JOKE,
        _ => DEFAULT_JOKE,
    }
    .to_string()
}

pub fn joke_tool() -> Box<dyn Tool> {
    Box::new(FunctionTool::new(
        TOOL_NAME,
        "Cuenta un chiste al usuario sobre un tema específico.",
        tell_joke,
    ))
}

/// The registry used by the `charla` binary.
pub fn registry() -> ToolDispatcher {
    ToolDispatcher::new(vec![joke_tool()])
}
