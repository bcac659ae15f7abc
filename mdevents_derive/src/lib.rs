/// Derive macro generating an implementation of the trait `Measured`.
///
/// The struct needs a `signal` field, an `error_squared` or `error` field and a `center` or
/// `coordinates` field. An `error` field is squared.
#[proc_macro_derive(Measured)]
pub fn measured_derive(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let ast = syn::parse(input);

    impl_measured(ast).unwrap_or_else(|e| syn::Error::to_compile_error(&e).into())
}

fn impl_measured(input: syn::Result<syn::DeriveInput>) -> syn::Result<proc_macro::TokenStream> {
    let mut input = input?;

    let data_struct = match &input.data {
        syn::Data::Struct(data_struct) => data_struct,
        syn::Data::Enum(enum_data) => {
            return Err(syn::Error::new_spanned(
                enum_data.enum_token,
                "the `Measured` trait can only be derived for struct types",
            ))
        }
        syn::Data::Union(union_data) => {
            return Err(syn::Error::new_spanned(
                union_data.union_token,
                "the `Measured` trait can only be derived for struct types",
            ))
        }
    };

    let missing = |what: &str| syn::Error::new_spanned(&data_struct.fields, what);

    get_field("signal", data_struct).ok_or_else(|| missing("no `signal` field"))?;

    let error_method = match get_field("error_squared", data_struct) {
        Some(_) => quote::quote! {
            #[inline]
            fn error_squared(&self) -> f32 {
                self.error_squared
            }
        },
        None => {
            get_field("error", data_struct)
                .ok_or_else(|| missing("no `error_squared` or `error` field"))?;
            quote::quote! {
                #[inline]
                fn error_squared(&self) -> f32 {
                    self.error * self.error
                }
            }
        }
    };

    let center = get_field("center", data_struct)
        .or_else(|| get_field("coordinates", data_struct))
        .ok_or_else(|| missing("no `center` or `coordinates` field"))?;
    let center_ty = center.ty.clone();
    let center_ident = center.ident.clone();

    input
        .generics
        .where_clause
        .get_or_insert_with(|| syn::WhereClause {
            where_token: Default::default(),
            predicates: Default::default(),
        })
        .predicates
        .push(syn::parse_quote! {
            #center_ty: ::core::clone::Clone
        });

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let name = &input.ident;

    Ok(quote::quote! {
        impl #impl_generics Measured for #name #ty_generics #where_clause {
            type Coordinates = #center_ty;

            #[inline]
            fn signal(&self) -> f32 {
                self.signal
            }

            #error_method

            #[inline]
            fn coordinates(&self) -> Self::Coordinates {
                self.#center_ident.clone()
            }
        }
    }
    .into())
}

fn get_field<'a>(name: &str, data: &'a syn::DataStruct) -> Option<&'a syn::Field> {
    data.fields
        .iter()
        .find(|field| field.ident.as_ref().is_some_and(|ident| ident == name))
}
