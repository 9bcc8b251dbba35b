use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse_macro_input, punctuated::Punctuated, spanned::Spanned, token::Comma, Data, DeriveInput,
    Error, Field, Fields, Ident,
};

/// Implements `crate::output::TableOutputRow` for a struct with named fields.
///
/// Every field becomes a column rendered through its `Display` impl, the field marked
/// with `#[name_column]` is what `-o names` prints.
#[proc_macro_derive(TableOutputRow, attributes(name_column))]
pub fn derive_table_output_row(input: TokenStream) -> TokenStream {
    let parsed_input = parse_macro_input!(input as DeriveInput);

    match expand(parsed_input) {
        Ok(output) => output.into(),
        Err(error) => error.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> Result<proc_macro2::TokenStream, Error> {
    let struct_ident = input.ident;
    let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();
    let fields = match input.data {
        Data::Struct(data) => match data.fields {
            Fields::Named(fields) => fields.named,
            other => return Err(Error::new(other.span(), "expected named fields")),
        },
        _ => {
            return Err(Error::new(
                struct_ident.span(),
                "TableOutputRow can only be derived for structs",
            ))
        }
    };

    let name_field = name_column_field(&fields, &struct_ident)?;
    let column_names = fields.iter().filter_map(|field| field.ident.as_ref()).map(column_name);
    let field_names = fields
        .iter()
        .filter_map(|field| field.ident.as_ref())
        .collect::<Vec<_>>();

    Ok(quote! {
        impl #impl_generics crate::output::TableOutputRow for #struct_ident #type_generics #where_clause {
            fn get_name(&self) -> ::std::string::String {
                ::std::string::ToString::to_string(&self.#name_field)
            }

            fn get_column_names() -> ::std::vec::Vec<&'static str> {
                ::std::vec![#(#column_names),*]
            }

            fn get_row(&self) -> ::std::vec::Vec<::std::string::String> {
                ::std::vec![#(::std::string::ToString::to_string(&self.#field_names)),*]
            }
        }
    })
}

/// `last_handshake` becomes `LAST HANDSHAKE`.
fn column_name(ident: &Ident) -> String {
    ident.to_string().replace('_', " ").to_uppercase()
}

fn name_column_field<'a>(
    fields: &'a Punctuated<Field, Comma>,
    struct_ident: &Ident,
) -> Result<&'a Ident, Error> {
    let mut marked = fields.iter().filter(|field| {
        field
            .attrs
            .iter()
            .any(|attribute| attribute.path().is_ident("name_column"))
    });

    let field = marked.next().ok_or_else(|| {
        Error::new(
            struct_ident.span(),
            "one field has to be marked with #[name_column]",
        )
    })?;

    if let Some(duplicate) = marked.next() {
        return Err(Error::new(
            duplicate.span(),
            "only one field can be marked with #[name_column]",
        ));
    }

    field
        .ident
        .as_ref()
        .ok_or_else(|| Error::new(field.span(), "expected a named field"))
}
