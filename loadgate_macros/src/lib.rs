//! Attribute macros that remove the derive boilerplate from loadgate sample and
//! aggregate types.

use proc_macro::TokenStream;
use quote::quote;
use syn::{Ident, ItemStruct, parse_macro_input};

extern crate proc_macro;

/// Turns a struct into a loadgate `Metric`.
///
/// The struct gets the serde, `Debug`, `Clone` and `PartialEq` derives the trait
/// requires. `label = field` names the `String` field used to group samples; without
/// it every sample shares one unnamed group.
///
/// ```rust,ignore
/// #[metric(label = name)]
/// pub struct Sample {
///     pub name: String,
///     pub latency: Duration,
/// }
/// ```
#[proc_macro_attribute]
pub fn metric(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut label: Option<Ident> = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("label") {
            label = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("unsupported metric property, expected `label`"))
        }
    });
    parse_macro_input!(attr with parser);

    let ast = parse_macro_input!(item as ItemStruct);
    let input_struct = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();

    let label_body = match label {
        Some(field) => quote! { self.#field.as_str() },
        None => quote! { "" },
    };

    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics Metric for #input_struct #ty_generics #where_clause {
            fn label(&self) -> &str {
                #label_body
            }
        }
    };

    TokenStream::from(expanded)
}

/// Derives the serde, `Debug`, `Clone` and `PartialEq` impls an `Aggregate` needs.
#[proc_macro_attribute]
pub fn aggregate(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast
    };

    TokenStream::from(expanded)
}
