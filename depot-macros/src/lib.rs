//! `#[depot::test]`: run a test with depot's tracing subscriber installed.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Async tests run under `#[tokio::test]`, which receives the attribute's arguments
/// (`#[depot::test(flavor = "multi_thread")]`). Sync tests take no arguments.
/// Other attributes on the function, like `#[should_panic]`, are kept.
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let args = proc_macro2::TokenStream::from(args);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    let name = sig.ident.to_string();

    if sig.asyncness.is_none() {
        if !args.is_empty() {
            return syn::Error::new_spanned(&args, "runtime arguments need an async test")
                .to_compile_error()
                .into();
        }
        return quote! {
            #[test]
            #(#attrs)*
            #vis #sig {
                depot::trace::with_test_tracing_sync(#name, || #block)
            }
        }
        .into();
    }

    let runtime = if args.is_empty() {
        quote! { #[tokio::test] }
    } else {
        quote! { #[tokio::test(#args)] }
    };
    quote! {
        #runtime
        #(#attrs)*
        #vis #sig {
            depot::trace::with_test_tracing(#name, || async move #block).await
        }
    }
    .into()
}
