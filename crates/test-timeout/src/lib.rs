//! `#[tokio_timeout_test]` runs an async test on its own Tokio runtime and fails it if
//! it has not finished within a wall-clock budget, even when the body blocks a thread.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn defaults() {}
//!
//! #[test_timeout::tokio_timeout_test(millis = 500, worker_threads = 2)]
//! async fn fast_and_parallel() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_MILLIS: u64 = 30_000;

struct Settings {
    millis: u64,
    worker_threads: Option<usize>,
}

impl Settings {
    fn parse(&mut self, meta: syn::meta::ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("secs") {
            let secs: u64 = meta.value()?.parse::<LitInt>()?.base10_parse()?;
            self.millis = secs.saturating_mul(1000);
        } else if meta.path.is_ident("millis") {
            self.millis = meta.value()?.parse::<LitInt>()?.base10_parse()?;
        } else if meta.path.is_ident("worker_threads") {
            let threads: usize = meta.value()?.parse::<LitInt>()?.base10_parse()?;
            if threads == 0 {
                return Err(meta.error("worker_threads must be greater than zero"));
            }
            self.worker_threads = Some(threads);
        } else {
            return Err(meta.error("expected `secs`, `millis` or `worker_threads`"));
        }
        Ok(())
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut settings = Settings {
        millis: DEFAULT_TIMEOUT_MILLIS,
        worker_threads: None,
    };
    let parser = syn::meta::parser(|meta| settings.parse(meta));
    parse_macro_input!(attr with parser);

    if settings.millis == 0 {
        return syn::Error::new(Span::call_site(), "timeout must be greater than zero")
            .to_compile_error()
            .into();
    }

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

    let millis = settings.millis;
    let runtime = match settings.worker_threads {
        Some(threads) => quote! {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#threads)
                .enable_all()
                .build()
        },
        None => quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_millis(#millis);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #runtime.expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        if tokio::time::timeout(budget, async move #block).await.is_err() {
                            panic!("test exceeded {:?}", budget);
                        }
                    });
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(budget + std::time::Duration::from_millis(250)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test blocked its runtime past {:?}", budget)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Matches `#[test]` and `#[tokio::test]` so callers may leave either in place.
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
