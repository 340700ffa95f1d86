use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::{parse_macro_input, ItemFn, LitBool, LitInt, LitStr};

#[derive(Clone, Copy)]
enum Format {
    Text,
    Table,
    Json,
    JsonPretty,
}

impl Format {
    fn to_tokens(self) -> proc_macro2::TokenStream {
        match self {
            Format::Text => quote!(memtrail::Format::Text),
            Format::Table => quote!(memtrail::Format::Table),
            Format::Json => quote!(memtrail::Format::Json),
            Format::JsonPretty => quote!(memtrail::Format::JsonPretty),
        }
    }
}

#[derive(Clone, Copy)]
enum InvalidRelease {
    Forward,
    Skip,
}

impl InvalidRelease {
    fn to_tokens(self) -> proc_macro2::TokenStream {
        match self {
            InvalidRelease::Forward => quote!(memtrail::InvalidRelease::Forward),
            InvalidRelease::Skip => quote!(memtrail::InvalidRelease::Skip),
        }
    }
}

/// Opens a memtrail session for the duration of the annotated function and
/// prints the leak report when it returns.
///
/// Combined with the `global-alloc` feature every heap allocation made while
/// the function runs is tracked.
///
/// # Parameters
///
/// * `format` - `"text"` (default), `"table"`, `"json"` or `"json-pretty"`
/// * `caller_frames` - caller frames kept per operation. Default: `3`
/// * `quiet` - only report invalid releases and leaks. Default: `false`
/// * `invalid_release` - `"forward"` (default) or `"skip"`
///
/// # Examples
///
/// ```rust,ignore
/// #[memtrail::main]
/// fn main() {
///     // Your code here
/// }
/// ```
///
/// ```rust,ignore
/// #[memtrail::main(format = "table", caller_frames = 2)]
/// fn main() {
///     // Your code here
/// }
/// ```
///
/// With tokio, place `#[tokio::main]` before `#[memtrail::main]`:
///
/// ```rust,ignore
/// #[tokio::main]
/// #[memtrail::main(quiet = true)]
/// async fn main() {
///     // Your code here
/// }
/// ```
///
/// # Limitations
///
/// Only one memtrail guard can be alive at a time. Creating a second one
/// (through this macro or `GuardBuilder`) panics.
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    let mut format = Format::Text;
    let mut caller_frames: Option<usize> = None;
    let mut quiet = false;
    let mut invalid_release = InvalidRelease::Forward;

    if !attr.is_empty() {
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("format") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitStr = meta.input.parse()?;
                format = match lit.value().as_str() {
                    "text" => Format::Text,
                    "table" => Format::Table,
                    "json" => Format::Json,
                    "json-pretty" => Format::JsonPretty,
                    other => return Err(meta.error(format!(
                        "Unknown format {:?}. Expected one of: \"text\", \"table\", \"json\", \"json-pretty\"",
                        other
                    ))),
                };
                return Ok(());
            }

            if meta.path.is_ident("caller_frames") {
                meta.input.parse::<syn::Token![=]>()?;
                let li: LitInt = meta.input.parse()?;
                caller_frames = Some(li.base10_parse()?);
                return Ok(());
            }

            if meta.path.is_ident("quiet") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitBool = meta.input.parse()?;
                quiet = lit.value;
                return Ok(());
            }

            if meta.path.is_ident("invalid_release") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitStr = meta.input.parse()?;
                invalid_release = match lit.value().as_str() {
                    "forward" => InvalidRelease::Forward,
                    "skip" => InvalidRelease::Skip,
                    other => {
                        return Err(meta.error(format!(
                            "Unknown policy {:?}. Expected \"forward\" or \"skip\"",
                            other
                        )))
                    }
                };
                return Ok(());
            }

            Err(meta.error(
                "Unknown parameter. Supported: format=\"..\", caller_frames=N, quiet=bool, invalid_release=\"..\"",
            ))
        });

        if let Err(e) = parser.parse2(proc_macro2::TokenStream::from(attr)) {
            return e.to_compile_error().into();
        }
    }

    let format_token = format.to_tokens();
    let policy_token = invalid_release.to_tokens();
    let frames_call = caller_frames.map(|frames| quote! { .caller_frames(#frames) });

    let asyncness = sig.asyncness.is_some();
    let fn_name = &sig.ident;

    let guard_init = quote! {
        let _memtrail = {
            let caller_name: &'static str =
                concat!(module_path!(), "::", stringify!(#fn_name));

            memtrail::GuardBuilder::new(caller_name)
                .format(#format_token)
                .quiet(#quiet)
                .invalid_release(#policy_token)
                #frames_call
                .build()
        };
    };

    let body = quote! {
        #guard_init
        #block
    };

    let wrapped_body = if asyncness {
        quote! { async { #body }.await }
    } else {
        body
    };

    let output = quote! {
        #(#attrs)*
        #vis #sig {
            #wrapped_body
        }
    };

    output.into()
}
