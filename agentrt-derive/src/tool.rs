//! Implementation of the `#[tool]` attribute macro.

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use std::collections::HashMap;
use syn::{
    Expr, ExprLit, FnArg, Ident, ItemFn, Lit, Meta, Pat, PathArguments, ReturnType, Token, Type,
    parse::{Parse, ParseStream},
    punctuated::Punctuated,
};

/// Parsed arguments from the `#[tool(...)]` attribute.
#[derive(Default)]
pub(crate) struct ToolMacroArgs {
    pub description: Option<String>,
    pub param_descriptions: HashMap<String, String>,
    pub required: Vec<String>,
}

impl Parse for ToolMacroArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut result = Self::default();

        if input.is_empty() {
            return Ok(result);
        }

        let meta_list: Punctuated<Meta, Token![,]> = Punctuated::parse_terminated(input)?;

        for meta in meta_list {
            result.parse_meta_item(meta)?;
        }

        Ok(result)
    }
}

impl ToolMacroArgs {
    /// Parse a single meta item from the attribute arguments.
    fn parse_meta_item(&mut self, meta: Meta) -> syn::Result<()> {
        match meta {
            Meta::NameValue(nv) => {
                let ident = nv
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&nv.path, "expected identifier"))?;

                if ident == "description" {
                    self.description = Some(extract_string_lit(&nv.value)?);
                }
                // Silently ignore unknown name-value pairs for forward compatibility
            }
            Meta::List(list) if list.path.is_ident("params") => {
                self.parse_params_list(&list)?;
            }
            Meta::List(list) if list.path.is_ident("required") => {
                self.parse_required_list(&list)?;
            }
            _ => {
                // Silently ignore unknown meta items for forward compatibility
            }
        }
        Ok(())
    }

    /// Parse the `params(...)` nested list.
    fn parse_params_list(&mut self, list: &syn::MetaList) -> syn::Result<()> {
        let nested: Punctuated<Meta, Token![,]> =
            list.parse_args_with(Punctuated::parse_terminated)?;

        for meta in nested {
            if let Meta::NameValue(nv) = meta {
                let param_name = nv
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&nv.path, "expected parameter name"))?
                    .to_string();
                let description = extract_string_lit(&nv.value)?;
                self.param_descriptions.insert(param_name, description);
            }
        }
        Ok(())
    }

    /// Parse the `required(...)` nested list.
    fn parse_required_list(&mut self, list: &syn::MetaList) -> syn::Result<()> {
        let idents: Punctuated<Ident, Token![,]> =
            list.parse_args_with(Punctuated::parse_terminated)?;

        self.required = idents.into_iter().map(|id| id.to_string()).collect();
        Ok(())
    }
}

/// Extract a string literal from an expression.
fn extract_string_lit(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(lit_str),
            ..
        }) => Ok(lit_str.value()),
        _ => Err(syn::Error::new_spanned(expr, "expected string literal")),
    }
}

/// Extract the `T` out of a `agentrt::error::Result<T>` (or bare `Result<T>`)
/// return type.
fn extract_output_type(return_type: &ReturnType) -> syn::Result<TokenStream> {
    let ReturnType::Type(_, ty) = return_type else {
        return Err(syn::Error::new_spanned(
            return_type,
            "function must return `agentrt::error::Result<T>`",
        ));
    };

    let Type::Path(type_path) = ty.as_ref() else {
        return Err(syn::Error::new_spanned(
            ty,
            "return type must be a path type (e.g., `Result<T>`)",
        ));
    };

    let last_segment = type_path
        .path
        .segments
        .last()
        .ok_or_else(|| syn::Error::new_spanned(&type_path.path, "invalid return type path"))?;

    if last_segment.ident != "Result" {
        return Err(syn::Error::new_spanned(
            &last_segment.ident,
            "return type must be `Result<T>`",
        ));
    }

    let PathArguments::AngleBracketed(args) = &last_segment.arguments else {
        return Err(syn::Error::new_spanned(
            &last_segment.arguments,
            "expected angle bracketed type parameter for Result",
        ));
    };

    let output = args
        .args
        .first()
        .ok_or_else(|| syn::Error::new_spanned(args, "Result must carry a success type"))?;

    Ok(quote!(#output))
}

/// Information about a single function parameter.
struct ParamInfo<'a> {
    name: &'a Ident,
    ty: &'a Type,
    description: String,
}

/// Extract parameter information from function arguments.
fn extract_params<'a>(
    inputs: impl Iterator<Item = &'a FnArg>,
    param_descriptions: &HashMap<String, String>,
) -> Vec<ParamInfo<'a>> {
    inputs
        .filter_map(|arg| {
            let FnArg::Typed(pat_type) = arg else {
                return None;
            };
            let Pat::Ident(param_ident) = pat_type.pat.as_ref() else {
                return None;
            };

            let name = &param_ident.ident;
            let name_str = name.to_string();
            let ty = pat_type.ty.as_ref();
            let description = param_descriptions
                .get(&name_str)
                .cloned()
                .unwrap_or_else(|| format!("Parameter {name_str}"));

            Some(ParamInfo { name, ty, description })
        })
        .collect()
}

/// Whether a parameter type is `Option<_>` (and so excluded from `required`
/// unless the caller names it explicitly).
fn is_option_type(ty: &Type) -> bool {
    let Type::Path(type_path) = ty else {
        return false;
    };
    type_path
        .path
        .segments
        .last()
        .is_some_and(|segment| segment.ident == "Option")
}

/// Main entry point for the `#[tool]` macro expansion.
pub(crate) fn expand_tool(args: ToolMacroArgs, input_fn: ItemFn) -> syn::Result<TokenStream> {
    let fn_name = &input_fn.sig.ident;
    let fn_name_str = fn_name.to_string();
    let fn_span = input_fn.sig.ident.span();
    let is_async = input_fn.sig.asyncness.is_some();

    let output_type = extract_output_type(&input_fn.sig.output)?;

    let struct_name = format_ident!("{}", fn_name_str.to_case(Case::Pascal));
    let args_struct_name = format_ident!("{struct_name}Args");

    let params = extract_params(input_fn.sig.inputs.iter(), &args.param_descriptions);
    let param_names: Vec<_> = params.iter().map(|p| p.name).collect();
    let param_types: Vec<_> = params.iter().map(|p| p.ty).collect();
    let param_descriptions: Vec<_> = params.iter().map(|p| &p.description).collect();

    let tool_description = args
        .description
        .unwrap_or_else(|| format!("Calls the {fn_name_str} tool"));

    let explicit_required = !args.required.is_empty();
    let required_args: Vec<String> = if explicit_required {
        args.required
    } else {
        params
            .iter()
            .filter(|p| !is_option_type(p.ty))
            .map(|p| p.name.to_string())
            .collect()
    };

    // schemars already marks non-`Option` fields as required from the
    // struct shape; only force the `required` array when the caller named
    // one explicitly, so e.g. a `bool` flag can be opted out.
    let required_override = explicit_required.then(|| {
        quote! {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("required".to_owned(), ::serde_json::json!([#(#required_args),*]));
            }
        }
    });

    let invoke = if is_async {
        quote! { #fn_name(#(parsed.#param_names,)*).await }
    } else {
        quote! { #fn_name(#(parsed.#param_names,)*) }
    };

    let expanded = quote_spanned! {fn_span=>
        #[derive(::serde::Deserialize, ::schemars::JsonSchema)]
        struct #args_struct_name {
            #(
                #[doc = #param_descriptions]
                #param_names: #param_types,
            )*
        }

        #input_fn

        /// Generated by `#[agentrt_derive::tool]`.
        #[derive(Debug, Default)]
        pub struct #struct_name;

        impl #struct_name {
            /// The name the runtime registers this tool under.
            pub const NAME: &'static str = #fn_name_str;

            /// The tool's description, as shown to the model.
            pub const DESCRIPTION: &'static str = #tool_description;

            /// The JSON schema for this tool's input, suitable for
            /// [`agentrt::tool::ToolDescriptor::input_schema`], derived from
            /// the generated argument struct's shape via `schemars`.
            #[must_use]
            pub fn input_schema() -> ::serde_json::Value {
                let schema = ::schemars::schema_for!(#args_struct_name);
                let mut value = ::serde_json::to_value(&schema)
                    .unwrap_or_else(|_| ::serde_json::json!({ "type": "object" }));
                #required_override
                value
            }
        }

        #[::agentrt::async_trait::async_trait]
        impl ::agentrt::tool::Tool for #struct_name {
            async fn call(
                &self,
                input: ::serde_json::Value,
            ) -> ::agentrt::error::Result<::agentrt::tool::ToolOutput> {
                let parsed: #args_struct_name = ::serde_json::from_value(input)
                    .map_err(::agentrt::error::AgentError::Json)?;
                let result: #output_type = #invoke;
                Ok(::agentrt::tool::to_tool_output(&result))
            }
        }
    };

    Ok(expanded)
}
