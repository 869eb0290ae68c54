//! `#[node_config]`: turns a plain struct definition into a node config type
//! that plugs into the manifest model and the config introspection registry.
//!
//! JSON (de)serialization is `serde`'s job and schema generation is
//! `schemars`'s; this macro's only work is wiring those in consistently (so
//! every node config struct gets the same `camelCase` wire convention and
//! the same schema-registration boilerplate) and adding the
//! `from_manifest_config` associated function the registry's `build` path
//! calls to turn a manifest node's raw `params` JSON into a typed struct
//! with a readable error on mismatch.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Attribute macro. Attach to a struct definition:
///
/// ```ignore
/// #[remotemedia_core_derive::node_config]
/// struct MultiplyConfig {
///     #[serde(default = "default_factor")]
///     factor: f64,
/// }
/// ```
///
/// Expands to the struct with `#[derive(Deserialize, JsonSchema)]` and
/// `#[serde(rename_all = "camelCase")]` attached, plus:
/// - `from_manifest_config(&serde_json::Value) -> Result<Self, String>`
/// - `json_schema() -> schemars::schema::RootSchema`
/// - an `inventory::submit!` registration so the struct is discoverable
///   through `remotemedia_core::node_config::all_node_configs()`.
#[proc_macro_attribute]
pub fn node_config(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    let name = input.ident.clone();
    let name_str = name.to_string();
    let vis = input.vis.clone();
    let attrs = input.attrs.clone();
    let generics = input.generics.clone();
    let data = input.data.clone();

    let fields = match data {
        syn::Data::Struct(s) => s.fields,
        _ => {
            return syn::Error::new_spanned(name, "#[node_config] only supports structs")
                .to_compile_error()
                .into()
        }
    };

    let expanded = quote! {
        #(#attrs)*
        #[derive(::serde::Deserialize, ::schemars::JsonSchema)]
        #[serde(rename_all = "camelCase")]
        #vis struct #name #generics #fields

        impl #name {
            /// Parse this config struct out of a manifest node's raw
            /// `params` JSON value.
            pub fn from_manifest_config(value: &::serde_json::Value) -> ::std::result::Result<Self, String> {
                ::serde_json::from_value(value.clone())
                    .map_err(|e| format!("invalid config for node type '{}': {}", #name_str, e))
            }

            /// This config struct's JSON schema.
            pub fn json_schema() -> ::schemars::schema::RootSchema {
                ::schemars::schema_for!(#name)
            }
        }

        ::inventory::submit! {
            crate::node_config::NodeConfigDescriptor {
                name: #name_str,
                schema_fn: #name::json_schema,
            }
        }
    };

    TokenStream::from(expanded)
}
