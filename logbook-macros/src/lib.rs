// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::{FromDeriveInput, FromField, FromVariant, ast};
use heck::ToKebabCase;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{DeriveInput, Ident, parse_macro_input};

/// Returns the kind override or the default kebab-case name from the ident.
fn default_kind(ident: &Ident, kind: Option<String>) -> String {
    kind.unwrap_or_else(|| ident.to_string().to_kebab_case())
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

#[derive(Debug, FromField)]
struct EventField {
    ident: Option<Ident>,
}

/// Configuration for the `#[event(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(event), supports(struct_named))]
struct DomainEventArgs {
    ident: Ident,
    generics: syn::Generics,
    data: ast::Data<(), EventField>,
    #[darling(default)]
    kind: Option<String>,
    #[darling(default)]
    version: Option<u32>,
    #[darling(default)]
    occurred_on: Option<Ident>,
}

#[derive(Debug, FromVariant)]
struct SetVariant {
    ident: Ident,
    fields: ast::Fields<syn::Type>,
}

#[derive(Debug, FromDeriveInput)]
#[darling(supports(enum_newtype))]
struct EventSetArgs {
    ident: Ident,
    generics: syn::Generics,
    data: ast::Data<SetVariant, ()>,
}

/// Derives `DomainEvent` for a struct with named fields.
///
/// # Attributes
///
/// All optional, under `#[event(...)]`:
/// - `kind = "name"` - Stored type tag (default: kebab-case struct name)
/// - `version = N` - Schema version, at least 1 (default: 1)
/// - `occurred_on = "field"` - Field holding the `DateTime<Utc>` timestamp
///   (default: `occurred_on`)
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize, DomainEvent)]
/// #[event(version = 2, occurred_on = "at")]
/// pub struct BacklogItemCommitted {
///     item: String,
///     at: DateTime<Utc>,
/// }
/// ```
#[proc_macro_derive(DomainEvent, attributes(event))]
pub fn derive_domain_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_domain_event_impl(&input).into()
}

fn derive_domain_event_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<DomainEventArgs, _>(input, generate_domain_event_impl)
}

fn generate_domain_event_impl(args: DomainEventArgs) -> TokenStream2 {
    let struct_name = &args.ident;
    let (impl_generics, ty_generics, where_clause) = args.generics.split_for_impl();
    let kind = default_kind(struct_name, args.kind);

    let timestamp = args
        .occurred_on
        .unwrap_or_else(|| Ident::new("occurred_on", struct_name.span()));
    let has_timestamp = args
        .data
        .as_ref()
        .take_struct()
        .is_some_and(|fields| fields.iter().any(|field| field.ident.as_ref() == Some(&timestamp)));
    if !has_timestamp {
        return darling::Error::custom(format!(
            "`{struct_name}` has no `{timestamp}` field; name the timestamp field with \
             `#[event(occurred_on = \"field\")]`"
        ))
        .with_span(&timestamp)
        .write_errors();
    }

    let version = match args.version {
        Some(0) => {
            return darling::Error::custom("event versions start at 1")
                .with_span(struct_name)
                .write_errors();
        }
        Some(version) => quote! { const VERSION: u32 = #version; },
        None => TokenStream2::new(),
    };

    quote! {
        impl #impl_generics ::logbook::event::DomainEvent for #struct_name #ty_generics #where_clause {
            const KIND: &'static str = #kind;
            #version

            fn occurred_on(&self) -> ::logbook::chrono::DateTime<::logbook::chrono::Utc> {
                self.#timestamp
            }
        }
    }
}

/// Derives `EventSet` for an enum whose variants each wrap one event type.
///
/// This macro generates:
/// - `EventKind`, dispatching to the wrapped event
/// - `serde::Serialize`, serializing the wrapped event without a tag
/// - `EventSet`, decoding by the wrapped types' `DomainEvent::KIND`
/// - `From<E>` for each wrapped event type
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, EventSet)]
/// pub enum TimeoutSignals {
///     Review(ReviewTimedOut),
///     Approval(ApprovalTimedOut),
/// }
/// ```
#[proc_macro_derive(EventSet)]
pub fn derive_event_set(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_event_set_impl(&input).into()
}

fn derive_event_set_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<EventSetArgs, _>(input, generate_event_set_impl)
}

fn generate_event_set_impl(args: EventSetArgs) -> TokenStream2 {
    let enum_name = &args.ident;
    let (impl_generics, ty_generics, where_clause) = args.generics.split_for_impl();
    let variants = args.data.take_enum().unwrap_or_default();

    if variants.is_empty() {
        return darling::Error::custom("an event set needs at least one variant")
            .with_span(enum_name)
            .write_errors();
    }

    let variant_names: Vec<&Ident> = variants.iter().map(|variant| &variant.ident).collect();
    let event_types: Vec<&syn::Type> = variants
        .iter()
        .filter_map(|variant| variant.fields.fields.first())
        .collect();

    quote! {
        impl #impl_generics ::logbook::event::EventKind for #enum_name #ty_generics #where_clause {
            fn kind(&self) -> &'static str {
                match self {
                    #(Self::#variant_names(inner) => ::logbook::event::EventKind::kind(inner)),*
                }
            }

            fn event_version(&self) -> u32 {
                match self {
                    #(Self::#variant_names(inner) => ::logbook::event::EventKind::event_version(inner)),*
                }
            }

            fn event_occurred_on(&self) -> ::logbook::chrono::DateTime<::logbook::chrono::Utc> {
                match self {
                    #(Self::#variant_names(inner) => ::logbook::event::EventKind::event_occurred_on(inner)),*
                }
            }
        }

        impl #impl_generics ::serde::Serialize for #enum_name #ty_generics #where_clause {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: ::serde::Serializer,
            {
                match self {
                    #(Self::#variant_names(inner) => ::serde::Serialize::serialize(inner, serializer)),*
                }
            }
        }

        impl #impl_generics ::logbook::event::EventSet for #enum_name #ty_generics #where_clause {
            const EVENT_KINDS: &'static [&'static str] = &[
                #(<#event_types as ::logbook::event::DomainEvent>::KIND),*
            ];

            fn decode(
                kind: &str,
                payload: ::logbook::event::Payload,
            ) -> Result<Self, ::logbook::event::EventDecodeError> {
                #(
                    if kind == <#event_types as ::logbook::event::DomainEvent>::KIND {
                        return ::logbook::event::decode_payload(kind, payload).map(Self::#variant_names);
                    }
                )*
                Err(::logbook::event::EventDecodeError::UnknownKind {
                    kind: kind.to_string(),
                    expected: Self::EVENT_KINDS,
                })
            }
        }

        #(
            impl #impl_generics From<#event_types> for #enum_name #ty_generics #where_clause {
                fn from(event: #event_types) -> Self {
                    Self::#variant_names(event)
                }
            }
        )*
    }
}

#[cfg(test)]
mod tests {
    use syn::parse_quote;

    use super::*;

    /// Normalise token output by removing whitespace.
    fn compact(tokens: &TokenStream2) -> String {
        tokens
            .to_string()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect()
    }

    #[test]
    /// Confirms the default kind, version and timestamp field.
    fn domain_event_uses_defaults() {
        let input: DeriveInput = parse_quote! {
            pub struct BacklogItemCommitted {
                item: String,
                occurred_on: DateTime<Utc>,
            }
        };

        let compact = compact(&derive_domain_event_impl(&input));

        assert!(compact.contains("impl::logbook::event::DomainEventforBacklogItemCommitted"));
        assert!(compact.contains("constKIND:&'staticstr=\"backlog-item-committed\""));
        assert!(!compact.contains("constVERSION"));
        assert!(compact.contains("self.occurred_on"));
    }

    #[test]
    /// Confirms attribute overrides are honored.
    fn domain_event_respects_overrides() {
        let input: DeriveInput = parse_quote! {
            #[event(kind = "committed", version = 3, occurred_on = "at")]
            pub struct BacklogItemCommitted {
                at: DateTime<Utc>,
            }
        };

        let compact = compact(&derive_domain_event_impl(&input));

        assert!(compact.contains("constKIND:&'staticstr=\"committed\""));
        assert!(compact.contains("constVERSION:u32=3u32"));
        assert!(compact.contains("self.at"));
    }

    #[test]
    /// Ensures a missing timestamp field yields a compile-time error.
    fn domain_event_requires_timestamp_field() {
        let input: DeriveInput = parse_quote! {
            pub struct Untimed {
                item: String,
            }
        };

        let compact = compact(&derive_domain_event_impl(&input));

        assert!(compact.contains("compile_error"));
        assert!(compact.contains("hasno`occurred_on`field"));
    }

    #[test]
    /// Ensures version zero is rejected.
    fn domain_event_rejects_version_zero() {
        let input: DeriveInput = parse_quote! {
            #[event(version = 0)]
            pub struct Early {
                occurred_on: DateTime<Utc>,
            }
        };

        let compact = compact(&derive_domain_event_impl(&input));

        assert!(compact.contains("eventversionsstartat1"));
    }

    #[test]
    /// Confirms decoding dispatch and conversions for each variant.
    fn event_set_dispatches_by_wrapped_kind() {
        let input: DeriveInput = parse_quote! {
            pub enum Signals {
                Review(ReviewTimedOut),
                Approval(ApprovalTimedOut),
            }
        };

        let compact = compact(&derive_event_set_impl(&input));

        assert!(compact.contains("impl::logbook::event::EventSetforSignals"));
        assert!(compact.contains("<ReviewTimedOutas::logbook::event::DomainEvent>::KIND"));
        assert!(compact.contains("map(Self::Approval)"));
        assert!(compact.contains("implFrom<ReviewTimedOut>forSignals"));
        assert!(compact.contains("impl::serde::SerializeforSignals"));
    }

    #[test]
    /// Ensures variants must wrap exactly one event.
    fn event_set_rejects_non_newtype_variants() {
        let input: DeriveInput = parse_quote! {
            pub enum Signals {
                Review { signal: ReviewTimedOut },
            }
        };

        let compact = compact(&derive_event_set_impl(&input));

        assert!(compact.contains("compile_error"));
    }

    #[test]
    /// Ensures structs are rejected.
    fn event_set_rejects_structs() {
        let input: DeriveInput = parse_quote! {
            pub struct Signals(ReviewTimedOut);
        };

        let compact = compact(&derive_event_set_impl(&input));

        assert!(compact.contains("compile_error"));
    }
}
