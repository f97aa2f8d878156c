//! Derive macro for error enums.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations from
//! `#[error("...")]` attributes. Replacement for the `thiserror` crate.
//!
//! # Usage
//!
//! ```ignore
//! use fluxpilot_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum MachineError {
//!     #[error("the value {0} is an invalid opcode")]
//!     InvalidOp(u16),
//!
//!     #[error("index {index} out of range ({len} entries)")]
//!     OutOfRange { index: usize, len: usize },
//!
//!     #[error("pop on an empty stack")]
//!     PopOnEmptyStack,
//! }
//! ```
//!
//! Tuple fields interpolate positionally (`{0}`, `{1}`), named fields by name.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DeriveInput, Fields, Lit, Meta, Variant};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            input,
            "Error derive supports enums only",
        ));
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let arms = data
        .variants
        .iter()
        .map(display_arm)
        .collect::<syn::Result<Vec<_>>>()?;

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    #(#arms)*
                }
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Builds one `Display` match arm from a variant's `#[error("...")]` message.
fn display_arm(variant: &Variant) -> syn::Result<proc_macro2::TokenStream> {
    let variant_name = &variant.ident;
    let message = error_message(variant)?;

    let arm = match &variant.fields {
        Fields::Unit => quote! {
            Self::#variant_name => write!(f, #message),
        },
        Fields::Unnamed(fields) => {
            let bindings: Vec<_> = (0..fields.unnamed.len())
                .map(|i| format_ident!("f{}", i))
                .collect();
            let format = positional_to_named(&message, fields.unnamed.len());
            quote! {
                Self::#variant_name(#(#bindings),*) =>
                    write!(f, #format, #(#bindings = #bindings),*),
            }
        }
        Fields::Named(fields) => {
            let bindings: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
            quote! {
                Self::#variant_name { #(#bindings),* } =>
                    write!(f, #message, #(#bindings = #bindings),*),
            }
        }
    };

    Ok(arm)
}

/// Extracts the message string from a variant's `#[error("...")]` attribute.
fn error_message(variant: &Variant) -> syn::Result<String> {
    for attr in &variant.attrs {
        if !attr.path().is_ident("error") {
            continue;
        }
        let Meta::List(list) = &attr.meta else {
            return Err(syn::Error::new_spanned(
                &attr.meta,
                "use #[error(\"message\")] to describe the error",
            ));
        };
        let lit = syn::parse2::<Lit>(list.tokens.clone()).map_err(|_| {
            syn::Error::new_spanned(
                &attr.meta,
                "expected a string literal like #[error(\"invalid opcode: {0}\")]",
            )
        })?;
        let Lit::Str(lit) = lit else {
            return Err(syn::Error::new_spanned(
                &attr.meta,
                "the #[error] message must be a string literal",
            ));
        };
        return Ok(lit.value());
    }

    Err(syn::Error::new_spanned(
        variant,
        format!(
            "missing #[error(\"...\")] attribute on variant `{}`",
            variant.ident
        ),
    ))
}

/// Rewrites positional format args `{0}`, `{1}` to the bound names `{f0}`, `{f1}`.
fn positional_to_named(format: &str, field_count: usize) -> String {
    let mut out = format.to_string();
    for i in (0..field_count).rev() {
        out = out.replace(&format!("{{{i}}}"), &format!("{{f{i}}}"));
    }
    out
}
