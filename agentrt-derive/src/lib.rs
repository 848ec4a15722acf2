//! Procedural macros for the `agentrt` agent runtime.
//!
//! - [`tool`] - attribute macro for turning a plain function into an
//!   in-process `agentrt::tool::Tool` implementation, with its JSON schema
//!   derived from the function signature.

extern crate proc_macro;

use proc_macro::TokenStream;
use syn::{ItemFn, parse_macro_input};

mod tool;

/// Attribute macro that turns a function into an `agentrt::tool::Tool`.
///
/// # Arguments
///
/// - `description` - optional description of the tool for LLM context
/// - `params(...)` - optional per-parameter descriptions
/// - `required(...)` - which parameters are required (defaults to all of
///   them if omitted)
///
/// # Examples
///
/// ```rust,ignore
/// use agentrt_derive::tool;
///
/// #[tool(description = "Add two integers")]
/// async fn add(a: i64, b: i64) -> agentrt::error::Result<i64> {
///     Ok(a + b)
/// }
/// ```
///
/// ```rust,ignore
/// #[tool(
///     description = "Read a slice of a file",
///     params(path = "File to read", lines = "How many lines to read"),
///     required(path)
/// )]
/// async fn read_file(path: String, lines: Option<u32>) -> agentrt::error::Result<String> {
///     // ...
/// #   Ok(String::new())
/// }
/// ```
///
/// # Generated code
///
/// For a function `my_tool` this expands to:
/// - `MyToolArgs` - a `serde::Deserialize` struct holding the parameters
/// - `MyTool` - a unit struct implementing `agentrt::tool::Tool`, whose
///   `call` deserializes the input `Value` into `MyToolArgs` and forwards
///   the fields to the original function
#[proc_macro_attribute]
pub fn tool(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args as tool::ToolMacroArgs);
    let input_fn = parse_macro_input!(input as ItemFn);

    tool::expand_tool(args, input_fn)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
