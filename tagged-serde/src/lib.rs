//! A derive macro for serde enums with 64-bit integer tags.
//!
//! Binary protocols in the Nix family represent a union as an integer tag
//! followed by the body of the chosen variant. Serde's own enum
//! representations are built around string tags, so `#[derive(Serialize,
//! Deserialize)]` cannot express this directly. `#[derive(TaggedSerde)]`
//! instead serializes each variant as the tuple `(tag, field0, field1, ...)`
//! and deserializes by reading the leading tag and dispatching on it.
//!
//! ```ignore
//! #[derive(TaggedSerde)]
//! enum Frame {
//!     #[tagged_serde = 0x6f6c6d67]
//!     Next(ByteBuf),
//!     #[tagged_serde = 0x616c7473]
//!     Last(()),
//! }
//! ```
//!
//! Only unit variants and variants with unnamed fields are supported; the
//! tag expression must be given on every variant.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Expr, Fields, Ident, Variant};

#[proc_macro_derive(TaggedSerde, attributes(tagged_serde))]
pub fn derive(input: TokenStream) -> TokenStream {
    let input: DeriveInput = parse_macro_input!(input);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let ident = input.ident;

    let Data::Enum(data) = input.data else {
        return Err(syn::Error::new(
            Span::call_site(),
            "TaggedSerde can only be derived for enums",
        ));
    };

    let ser_arms = data
        .variants
        .iter()
        .map(|v| ser_arm(&ident, v))
        .collect::<syn::Result<Vec<_>>>()?;
    let de_arms = data
        .variants
        .iter()
        .map(|v| de_arm(&ident, v))
        .collect::<syn::Result<Vec<_>>>()?;

    Ok(quote! {
        impl ::serde::Serialize for #ident {
            fn serialize<S>(&self, serializer: S) -> ::core::result::Result<S::Ok, S::Error>
            where
                S: ::serde::Serializer,
            {
                use ::serde::Serialize;
                match self {
                    #( #ser_arms ),*
                }
            }
        }

        impl<'de> ::serde::Deserialize<'de> for #ident {
            fn deserialize<D>(deserializer: D) -> ::core::result::Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                use ::serde::de::Error;
                struct Visitor;

                impl<'d> ::serde::de::Visitor<'d> for Visitor {
                    type Value = #ident;

                    fn expecting(&self, formatter: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                        formatter.write_str(concat!("an integer-tagged ", stringify!(#ident)))
                    }

                    fn visit_seq<A: ::serde::de::SeqAccess<'d>>(
                        self,
                        mut seq: A,
                    ) -> ::core::result::Result<Self::Value, A::Error> {
                        let tag: u64 = seq
                            .next_element()?
                            .ok_or_else(|| A::Error::custom("missing tag"))?;
                        match tag {
                            #( #de_arms, )*
                            _ => Err(A::Error::custom(format!(
                                "unknown tag {} for {}",
                                tag,
                                stringify!(#ident)
                            ))),
                        }
                    }
                }

                // The tuple length is not known until the tag has been read;
                // the binary deserializers this pairs with never consult it.
                deserializer.deserialize_tuple(usize::MAX, Visitor)
            }
        }
    })
}

/// Pulls the `#[tagged_serde = <expr>]` tag off a variant.
fn variant_tag(variant: &Variant) -> syn::Result<&Expr> {
    for attr in &variant.attrs {
        if attr.path().is_ident("tagged_serde") {
            return Ok(&attr.meta.require_name_value()?.value);
        }
    }
    Err(syn::Error::new_spanned(
        &variant.ident,
        "variant is missing a #[tagged_serde = ...] tag",
    ))
}

/// Number of unnamed fields, or an error for struct-style variants.
fn arity(variant: &Variant) -> syn::Result<Option<usize>> {
    match &variant.fields {
        Fields::Unnamed(fields) => Ok(Some(fields.unnamed.len())),
        Fields::Unit => Ok(None),
        Fields::Named(_) => Err(syn::Error::new_spanned(
            &variant.ident,
            "TaggedSerde does not support struct-style variants",
        )),
    }
}

fn field_idents(n: usize) -> Vec<Ident> {
    (0..n)
        .map(|i| Ident::new(&format!("field{i}"), Span::call_site()))
        .collect()
}

fn ser_arm(ident: &Ident, variant: &Variant) -> syn::Result<proc_macro2::TokenStream> {
    let name = &variant.ident;
    let tag = variant_tag(variant)?;

    Ok(match arity(variant)? {
        Some(n) => {
            let fields = field_idents(n);
            quote! {
                #ident::#name(#( #fields ),*) =>
                    ((#tag) as u64, #( #fields ),*).serialize(serializer)
            }
        }
        None => quote! {
            #ident::#name => ((#tag) as u64).serialize(serializer)
        },
    })
}

fn de_arm(ident: &Ident, variant: &Variant) -> syn::Result<proc_macro2::TokenStream> {
    let name = &variant.ident;
    let tag = variant_tag(variant)?;

    let body = match arity(variant)? {
        Some(n) => {
            let fields = (0..n).map(|_| {
                quote! {
                    seq.next_element()?.ok_or_else(|| {
                        A::Error::custom(format!("truncated body for tag {}", tag))
                    })?
                }
            });
            quote! { #ident::#name(#( #fields ),*) }
        }
        None => quote! { #ident::#name },
    };

    Ok(quote! {
        t if t == (#tag) as u64 => Ok(#body)
    })
}
