use proc_macro::TokenStream;
use quote::quote;
use std::sync::OnceLock;
use syn::{
  parse::{Parse, ParseStream},
  ItemFn,
};

static IS_SUPPORT_DOCKER: OnceLock<bool> = OnceLock::new();

fn is_support_docker() -> bool {
  *IS_SUPPORT_DOCKER.get_or_init(|| {
    std::process::Command::new("docker")
      .arg("info")
      .stdout(std::process::Stdio::null())
      .stderr(std::process::Stdio::null())
      .status()
      .map_or(false, |status| status.success())
  })
}

#[derive(Default)]
struct Args {
  requires_docker: bool,
  is_unix_only: bool,
}

impl Parse for Args {
  fn parse(input: ParseStream) -> syn::Result<Self> {
    let mut args = Args::default();

    while let Ok(ident) = input.parse::<syn::Ident>() {
      match ident.to_string().as_str() {
        "docker" => args.requires_docker = true,
        "unix" => args.is_unix_only = true,
        other => {
          return Err(syn::Error::new(
            ident.span(),
            format!("unknown test flag `{}`", other),
          ))
        }
      }

      if input.parse::<syn::Token![,]>().is_err() {
        break;
      }
    }

    Ok(args)
  }
}

/// Test attribute used across the workspace.
///
/// `#[ci_runner_test::test]` initialises the logger and wraps async tests in
/// `#[tokio::test]`. `docker` ignores the test when no docker daemon answers
/// at expansion time; `unix` compiles the test only on unix targets.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
  let item_fn = syn::parse_macro_input!(item as ItemFn);
  let args = syn::parse_macro_input!(attr as Args);

  let test_name = item_fn.sig.ident;
  let output = item_fn.sig.output;
  let content = item_fn.block;
  let attrs = item_fn.attrs;

  let is_async = item_fn.sig.asyncness.is_some();

  let ignore = if args.requires_docker && !is_support_docker() {
    quote! { #[ignore = "docker daemon is not available"] }
  } else {
    quote! {}
  };

  let cfg = if args.is_unix_only {
    quote! { #[cfg(unix)] }
  } else {
    quote! {}
  };

  let content = quote! {
    ci_runner_logger::init_logger_with_level(log::Level::Trace);

    #content
  };

  if is_async {
    return quote! {
      #cfg
      #ignore
      #(#attrs)*
      #[tokio::test]
      async fn #test_name() #output {
        #content
      }
    }
    .into();
  }

  quote! {
    #cfg
    #ignore
    #(#attrs)*
    #[test]
    fn #test_name() #output {
      #content
    }
  }
  .into()
}
