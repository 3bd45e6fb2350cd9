//! `#[tokio_timeout_test]`: run an async test on a fresh current-thread
//! runtime and fail it once a deadline passes.
//!
//! The deadline defaults to 30 seconds. It can be given as bare seconds
//! (`#[tokio_timeout_test(5)]`) or in milliseconds
//! (`#[tokio_timeout_test(ms = 500)]`).

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

struct Deadline {
    millis: u64,
}

impl Parse for Deadline {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self {
                millis: DEFAULT_TIMEOUT_MS,
            });
        }
        let millis = if input.peek(Ident) {
            let unit: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let value: LitInt = input.parse()?;
            match unit.to_string().as_str() {
                "ms" => value.base10_parse::<u64>()?,
                "secs" => value.base10_parse::<u64>()?.saturating_mul(1_000),
                _ => return Err(syn::Error::new_spanned(unit, "expected `ms` or `secs`")),
            }
        } else {
            let value: LitInt = input.parse()?;
            value.base10_parse::<u64>()?.saturating_mul(1_000)
        };
        if millis == 0 {
            return Err(input.error("timeout must be greater than zero"));
        }
        Ok(Self { millis })
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let Deadline { millis } = parse_macro_input!(attr as Deadline);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_competing_test_attribute(attr))
        .collect();
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_millis(#millis);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#name.to_string())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async {
                            if tokio::time::timeout(deadline, async move #block).await.is_err() {
                                panic!("{} timed out after {:?}", #name, deadline);
                            }
                        });
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            // The grace period covers runtime start-up and teardown.
            match receiver.recv_timeout(deadline + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} wedged past {:?}", #name, deadline)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} test thread exited without reporting", #name)
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_competing_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
