//! `#[tokio_timeout_test]`: an async test with a hard wall-clock limit.
//!
//! The body runs on its own thread and runtime, so a test that blocks the
//! executor still fails after the limit instead of hanging the suite.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(10)]
//! async fn finishes_quickly() {}
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Optional limit in seconds; defaults to [`DEFAULT_TIMEOUT_SECS`].
struct TimeoutSecs(u64);

impl Parse for TimeoutSecs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(TimeoutSecs(DEFAULT_TIMEOUT_SECS));
        }
        let lit: LitInt = input.parse()?;
        let secs: u64 = lit.base10_parse()?;
        if secs == 0 {
            return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
        }
        Ok(TimeoutSecs(secs))
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutSecs(secs) = parse_macro_input!(attr as TimeoutSecs);
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
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        if tokio::time::timeout(limit, async move #block).await.is_err() {
                            panic!("test exceeded {}s", limit.as_secs());
                        }
                    });
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(limit + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s and blocked its runtime", limit.as_secs())
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

/// `#[test]`, `#[tokio::test]` and `#[tokio::test(...)]` are replaced by the
/// generated harness.
fn is_test_attribute(attr: &Attribute) -> bool {
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
