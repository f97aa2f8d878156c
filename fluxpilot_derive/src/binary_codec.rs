//! Derive macro for binary serialization.
//!
//! Generates `Encode` and `Decode` implementations (from
//! `crate::types::encoding`) for named-field structs and enums. Fields are
//! written in declaration order; enums lead with a one-byte discriminant that
//! honors explicit values (`Variant = 0x52`).
//!
//! The generated code delegates every field to the `Encode`/`Decode` impls of
//! its type, so the byte layout of a derived type is exactly the
//! concatenation of its fields' layouts.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DataEnum, DeriveInput, Fields};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => {
            let Fields::Named(fields) = &data.fields else {
                return Err(syn::Error::new_spanned(
                    input,
                    "BinaryCodec derive supports named-field structs and enums only",
                ));
            };
            struct_bodies(fields)
        }
        Data::Enum(data) => enum_bodies(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    })
}

fn struct_bodies(
    fields: &syn::FieldsNamed,
) -> (proc_macro2::TokenStream, proc_macro2::TokenStream) {
    let names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();

    let encode = quote! {
        #( crate::types::encoding::Encode::encode(&self.#names, out); )*
    };
    let decode = quote! {
        Ok(Self {
            #( #names: crate::types::encoding::Decode::decode(input)?, )*
        })
    };
    (encode, decode)
}

fn enum_bodies(
    data: &DataEnum,
) -> syn::Result<(proc_macro2::TokenStream, proc_macro2::TokenStream)> {
    let discriminants = discriminants(data)?;

    let mut encode_arms = Vec::with_capacity(data.variants.len());
    let mut decode_arms = Vec::with_capacity(data.variants.len());

    for (variant, disc) in data.variants.iter().zip(&discriminants) {
        let variant_name = &variant.ident;

        match &variant.fields {
            Fields::Unit => {
                encode_arms.push(quote! {
                    Self::#variant_name => {
                        crate::types::encoding::Encode::encode(&#disc, out);
                    }
                });
                decode_arms.push(quote! { #disc => Ok(Self::#variant_name), });
            }
            Fields::Unnamed(fields) => {
                let bindings: Vec<_> = (0..fields.unnamed.len())
                    .map(|i| format_ident!("f{}", i))
                    .collect();
                encode_arms.push(quote! {
                    Self::#variant_name(#(#bindings),*) => {
                        crate::types::encoding::Encode::encode(&#disc, out);
                        #( crate::types::encoding::Encode::encode(#bindings, out); )*
                    }
                });
                let reads = bindings
                    .iter()
                    .map(|_| quote! { crate::types::encoding::Decode::decode(input)?, });
                decode_arms.push(quote! {
                    #disc => Ok(Self::#variant_name(#(#reads)*)),
                });
            }
            Fields::Named(fields) => {
                let names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                encode_arms.push(quote! {
                    Self::#variant_name { #(#names),* } => {
                        crate::types::encoding::Encode::encode(&#disc, out);
                        #( crate::types::encoding::Encode::encode(#names, out); )*
                    }
                });
                decode_arms.push(quote! {
                    #disc => Ok(Self::#variant_name {
                        #( #names: crate::types::encoding::Decode::decode(input)?, )*
                    }),
                });
            }
        }
    }

    let encode = quote! {
        match self {
            #(#encode_arms)*
        }
    };
    let decode = quote! {
        let discriminant: u8 = crate::types::encoding::Decode::decode(input)?;
        match discriminant {
            #(#decode_arms)*
            _ => Err(crate::types::encoding::DecodeError::InvalidValue),
        }
    };
    Ok((encode, decode))
}

/// Resolves each variant's one-byte discriminant, honoring explicit values
/// and auto-incrementing from the previous variant otherwise.
fn discriminants(data: &DataEnum) -> syn::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.variants.len());
    let mut next: u8 = 0;

    for variant in &data.variants {
        let value = match &variant.discriminant {
            Some((_, expr)) => explicit_discriminant(expr)?,
            None => next,
        };
        out.push(value);
        next = value.wrapping_add(1);
    }

    Ok(out)
}

fn explicit_discriminant(expr: &syn::Expr) -> syn::Result<u8> {
    if let syn::Expr::Lit(lit) = expr {
        if let syn::Lit::Int(int) = &lit.lit {
            return int.base10_parse::<u8>();
        }
        if let syn::Lit::Byte(byte) = &lit.lit {
            return Ok(byte.value());
        }
    }
    Err(syn::Error::new_spanned(
        expr,
        "discriminant must be an integer or byte literal fitting in u8",
    ))
}
