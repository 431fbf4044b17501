use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    DataStruct, DeriveInput, Expr, ExprLit, Fields, GenericArgument, Lit, LitStr, Meta, PathArguments, Result,
    Token, Type, punctuated::Punctuated,
};

#[derive(Default)]
struct DocumentAttrs {
    collection: Option<String>,
    name: Option<String>,
    database: Option<String>,
    connection: Option<String>,
    audit: bool,
    soft_delete: bool,
    timestamps: bool,
    skip_validation: bool,
}

#[derive(Default)]
struct FieldAttrs {
    name: Option<String>,
    skip: bool,
    kind: Option<TokenStream>,
    modifiers: Vec<TokenStream>,
}

fn parse_document_attrs(ast: &DeriveInput) -> Result<DocumentAttrs> {
    let mut attrs = DocumentAttrs::default();

    for attr in &ast.attrs {
        if !attr.path().is_ident("document") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("collection") {
                attrs.collection = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.path.is_ident("name") {
                attrs.name = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.path.is_ident("database") {
                attrs.database = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.path.is_ident("connection") {
                attrs.connection = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.path.is_ident("audit") {
                attrs.audit = true;
            } else if meta.path.is_ident("soft_delete") {
                attrs.soft_delete = true;
            } else if meta.path.is_ident("timestamps") {
                attrs.timestamps = true;
            } else if meta.path.is_ident("skip_validation") {
                attrs.skip_validation = true;
            } else {
                return Err(meta.error("unknown document attribute"));
            }
            Ok(())
        })?;
    }

    Ok(attrs)
}

fn parse_field_attrs(field: &syn::Field) -> Result<FieldAttrs> {
    let mut attrs = FieldAttrs::default();

    for attr in &field.attrs {
        if attr.path().is_ident("serde") {
            let metas = attr.parse_args_with(Punctuated::<Meta, Token![,]>::parse_terminated)?;
            for meta in metas {
                match meta {
                    Meta::Path(path) if path.is_ident("skip") => attrs.skip = true,
                    Meta::NameValue(pair) if pair.path.is_ident("rename") => {
                        if let Expr::Lit(ExprLit { lit: Lit::Str(value), .. }) = pair.value {
                            attrs.name.get_or_insert(value.value());
                        }
                    }
                    _ => {}
                }
            }
            continue;
        }

        if !attr.path().is_ident("field") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                attrs.name = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.path.is_ident("skip") {
                attrs.skip = true;
            } else if meta.path.is_ident("kind") {
                let value = meta.value()?.parse::<LitStr>()?;
                attrs.kind = Some(
                    kind_from_str(&value.value())
                        .ok_or_else(|| syn::Error::new_spanned(&value, "unknown field kind"))?,
                );
            } else if meta.path.is_ident("required") {
                attrs.modifiers.push(quote!(.required()));
            } else if meta.path.is_ident("index") {
                attrs.modifiers.push(quote!(.index()));
            } else if meta.path.is_ident("unique") {
                attrs.modifiers.push(quote!(.unique()));
            } else if meta.path.is_ident("ref_id") {
                attrs.modifiers.push(quote!(.ref_id()));
            } else if meta.path.is_ident("default") {
                let value: Expr = meta.value()?.parse()?;
                attrs.modifiers.push(quote!(.default(#value)));
            } else if meta.path.is_ident("min") {
                let value: Expr = meta.value()?.parse()?;
                attrs.modifiers.push(quote!(.min((#value) as f64)));
            } else if meta.path.is_ident("max") {
                let value: Expr = meta.value()?.parse()?;
                attrs.modifiers.push(quote!(.max((#value) as f64)));
            } else if meta.path.is_ident("max_length") {
                let value: Expr = meta.value()?.parse()?;
                attrs.modifiers.push(quote!(.max_length((#value) as usize)));
            } else if meta.path.is_ident("pattern") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.modifiers.push(quote!(.pattern(#value)));
            } else if meta.path.is_ident("references") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.modifiers.push(quote!(.references(#value)));
            } else if meta.path.is_ident("collection") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.modifiers.push(quote!(.collection(#value)));
            } else {
                return Err(meta.error("unknown field attribute"));
            }
            Ok(())
        })?;
    }

    Ok(attrs)
}

/// Parses `string`, `int`, `float`, `bool`, `datetime`, `object_id`, `object`, `any`
/// and `array<...>`.
fn kind_from_str(kind: &str) -> Option<TokenStream> {
    let kind = kind.trim();
    if let Some(inner) = kind.strip_prefix("array<").and_then(|rest| rest.strip_suffix('>')) {
        let inner = kind_from_str(inner)?;
        return Some(quote!(::docmodel::schema::FieldKind::Array(::std::boxed::Box::new(#inner))));
    }

    Some(match kind {
        "string" => quote!(::docmodel::schema::FieldKind::String),
        "int" => quote!(::docmodel::schema::FieldKind::Int),
        "float" => quote!(::docmodel::schema::FieldKind::Float),
        "bool" => quote!(::docmodel::schema::FieldKind::Bool),
        "datetime" => quote!(::docmodel::schema::FieldKind::DateTime),
        "object_id" => quote!(::docmodel::schema::FieldKind::ObjectId),
        "object" => quote!(::docmodel::schema::FieldKind::Object),
        "any" => quote!(::docmodel::schema::FieldKind::Any),
        _ => return None,
    })
}

/// Returns the single generic argument of `Wrapper<T>` when the last path segment is
/// one of `wrappers`.
fn unwrap_generic<'a>(ty: &'a Type, wrappers: &[&str]) -> Option<&'a Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if !wrappers.iter().any(|wrapper| segment.ident == wrapper) {
        return None;
    }
    match &segment.arguments {
        PathArguments::AngleBracketed(args) => args.args.iter().find_map(|arg| match arg {
            GenericArgument::Type(inner) => Some(inner),
            _ => None,
        }),
        _ => None,
    }
}

fn infer_kind(ty: &Type) -> TokenStream {
    if let Some(inner) = unwrap_generic(ty, &["Option", "Box"]) {
        return infer_kind(inner);
    }
    if let Some(inner) = unwrap_generic(ty, &["Vec", "HashSet", "BTreeSet", "VecDeque"]) {
        let inner = infer_kind(inner);
        return quote!(::docmodel::schema::FieldKind::Array(::std::boxed::Box::new(#inner)));
    }

    let name = match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.to_string())
            .unwrap_or_default(),
        Type::Reference(reference) => return infer_kind(&reference.elem),
        _ => String::new(),
    };

    match name.as_str() {
        "String" | "str" => quote!(::docmodel::schema::FieldKind::String),
        "i8" | "i16" | "i32" | "i64" | "u8" | "u16" | "u32" | "isize" => {
            quote!(::docmodel::schema::FieldKind::Int)
        }
        "f32" | "f64" => quote!(::docmodel::schema::FieldKind::Float),
        "bool" => quote!(::docmodel::schema::FieldKind::Bool),
        "DateTime" => quote!(::docmodel::schema::FieldKind::DateTime),
        "ObjectId" => quote!(::docmodel::schema::FieldKind::ObjectId),
        "Document" => quote!(::docmodel::schema::FieldKind::Object),
        _ => quote!(::docmodel::schema::FieldKind::Any),
    }
}

/// Default collection name: the snake-cased type name with an `s` appended.
fn default_collection(ident: &str) -> String {
    let mut collection = String::with_capacity(ident.len() + 1);
    for (index, ch) in ident.chars().enumerate() {
        if ch.is_uppercase() {
            if index > 0 {
                collection.push('_');
            }
            collection.extend(ch.to_lowercase());
        } else {
            collection.push(ch);
        }
    }
    collection.push('s');
    collection
}

pub(crate) fn generate_entity_for_struct(ast: &DeriveInput, data: &DataStruct) -> Result<TokenStream> {
    let ident = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();

    let Fields::Named(named) = &data.fields else {
        return Err(syn::Error::new_spanned(
            ast,
            "Entity can only be derived for structs with named fields",
        ));
    };

    let attrs = parse_document_attrs(ast)?;
    let collection = attrs
        .collection
        .unwrap_or_else(|| default_collection(&ident.to_string()));
    let model_name = attrs.name.unwrap_or_else(|| ident.to_string());

    let mut fields = Vec::new();
    for field in &named.named {
        let field_attrs = parse_field_attrs(field)?;
        let name = match (&field_attrs.name, &field.ident) {
            (Some(name), _) => name.clone(),
            (None, Some(ident)) => ident.to_string().trim_start_matches("r#").to_string(),
            (None, None) => continue,
        };
        if field_attrs.skip || name == "_id" {
            continue;
        }

        let kind = field_attrs.kind.unwrap_or_else(|| infer_kind(&field.ty));
        let modifiers = &field_attrs.modifiers;
        fields.push(quote! {
            .field(#name, ::docmodel::schema::FieldDef::new(#kind) #(#modifiers)*)
        });
    }

    let mut options = Vec::new();
    if let Some(database) = &attrs.database {
        options.push(quote!(.database(#database)));
    }
    if let Some(connection) = &attrs.connection {
        options.push(quote!(.connection(#connection)));
    }
    if attrs.audit {
        options.push(quote!(.audit(true)));
    }
    if attrs.soft_delete {
        options.push(quote!(.soft_delete(true)));
    }
    if attrs.timestamps {
        options.push(quote!(.timestamps(true)));
    }
    if attrs.skip_validation {
        options.push(quote!(.skip_validation(true)));
    }

    Ok(quote! {
        impl #impl_generics ::docmodel::entity::Entity for #ident #ty_generics #where_clause {
            fn collection_name() -> &'static str {
                #collection
            }

            fn model_name() -> &'static str {
                #model_name
            }

            fn schema() -> ::docmodel::schema::SchemaBuilder {
                ::docmodel::schema::Schema::builder()
                    .collection(#collection)
                    #(#fields)*
                    #(#options)*
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_default_collection() {
        assert_eq!(default_collection("User"), "users");
        assert_eq!(default_collection("BlogPost"), "blog_posts");
    }

    #[test]
    fn test_kind_from_str() {
        assert!(kind_from_str("int").is_some());
        assert!(kind_from_str("array<object_id>").is_some());
        assert!(kind_from_str("array<nope>").is_none());
        assert!(kind_from_str("decimal").is_none());
    }

    #[test]
    fn test_infer_kind_unwraps_option_and_vec() {
        let ty: Type = parse_quote!(Option<Vec<ObjectId>>);
        let expected = quote!(::docmodel::schema::FieldKind::Array(::std::boxed::Box::new(
            ::docmodel::schema::FieldKind::ObjectId
        )));
        assert_eq!(infer_kind(&ty).to_string(), expected.to_string());

        let ty: Type = parse_quote!(u64);
        assert_eq!(infer_kind(&ty).to_string(), quote!(::docmodel::schema::FieldKind::Any).to_string());
    }

    #[test]
    fn test_generates_schema_from_attributes() {
        let ast: DeriveInput = parse_quote! {
            #[document(collection = "people", soft_delete)]
            struct Person {
                #[serde(rename = "_id")]
                id: Option<ObjectId>,
                #[field(required, max_length = 10)]
                name: String,
                #[serde(rename = "yearsOld")]
                #[field(default = 18, min = 0)]
                age: Option<i64>,
                #[field(skip)]
                cache: Vec<String>,
            }
        };
        let syn::Data::Struct(data) = &ast.data else {
            panic!("expected a struct");
        };

        let generated = generate_entity_for_struct(&ast, data).unwrap().to_string();

        assert!(generated.contains("\"people\""));
        assert!(generated.contains("\"yearsOld\""));
        assert!(generated.contains("soft_delete (true)"));
        assert!(!generated.contains("\"_id\""));
        assert!(!generated.contains("\"cache\""));
    }

    #[test]
    fn test_rejects_unknown_attributes() {
        let ast: DeriveInput = parse_quote! {
            #[document(colection = "typo")]
            struct Person {
                name: String,
            }
        };
        let syn::Data::Struct(data) = &ast.data else {
            panic!("expected a struct");
        };

        assert!(generate_entity_for_struct(&ast, data).is_err());
    }
}
