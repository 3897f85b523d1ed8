//! # greetrpc Procedural Macros
//!
//! ## `#[service]` Macro
//!
//! Turns a trait into an RPC service. The call shape of every method is
//! read from its signature:
//!
//! ```rust,ignore
//! #[greetrpc::service]
//! pub trait Greeter {
//!     // unary: a borrowed request, a response.
//!     async fn say_hello(&self, ctx: &Context, req: &HelloRequest) -> Result<HelloReply>;
//!     // server stream: a borrowed request and an outbound stream.
//!     async fn greet_many(&self, ctx: &Context, req: &GreetManyRequest, tx: SendStream<GreetChunk>) -> Result<()>;
//!     // client stream: an inbound stream, a response.
//!     async fn upload_names(&self, ctx: &Context, rx: RecvStream<Name>) -> Result<Summary>;
//!     // bidi stream: an inbound and an outbound stream.
//!     async fn chat(&self, ctx: &Context, rx: RecvStream<ChatMsg>, tx: SendStream<ChatMsg>) -> Result<()>;
//! }
//! ```
//!
//! ### Generated Code
//!
//! 1. The trait itself, with every method returning a `Send` future.
//! 2. A `greetrpc_export` method registering each method with a `Router`
//!    under the name `Trait/method`.
//! 3. A `{Trait}Client` trait implemented for `Client`, with one call
//!    opener per method.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    FnArg, GenericArgument, ItemTrait, Pat, PathArguments, ReturnType, Token, TraitItem, Type,
    parse_macro_input, punctuated::Punctuated,
};

/// Procedural macro for defining RPC services.
///
/// # Panics
///
/// Panics at compile time if:
/// - A method does not match one of the four call shapes
/// - A method is named `greetrpc_export` (reserved name)
#[proc_macro_attribute]
pub fn service(_attr: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as ItemTrait);

    let trait_ident = &input.ident;
    let client_ident = format_ident!("{}Client", trait_ident);
    let visibility = &input.vis;
    let trait_attrs = &input.attrs;
    let trait_name = trait_ident.to_string();

    let krate = get_crate_name();

    let mut trait_methods = vec![];
    let mut export_branches = vec![];
    let mut client_decls = vec![];
    let mut client_impls = vec![];

    for item in &input.items {
        let TraitItem::Fn(method) = item else {
            panic!("a service trait may only contain methods");
        };
        let sig = &method.sig;
        let method_ident = &sig.ident;
        if *method_ident == "greetrpc_export" {
            panic!("the function cannot be named `greetrpc_export`!");
        }
        let (Some(receiver), Some(_), ReturnType::Type(_, output)) =
            (sig.receiver(), sig.asyncness, &sig.output)
        else {
            panic!(
                "the function should be in the form `async fn func(&self, ctx: &Context, ...) -> Result<T>`."
            );
        };
        let args: Vec<&Type> = sig
            .inputs
            .iter()
            .skip(2)
            .map(|arg| match arg {
                FnArg::Typed(arg) => &*arg.ty,
                FnArg::Receiver(_) => unreachable!(),
            })
            .collect();
        let method_name = format!("{trait_name}/{method_ident}");

        let attrs = &method.attrs;
        let inputs = declaration_inputs(sig);
        trait_methods.push(quote! {
            #(#attrs)*
            fn #method_ident(#inputs) -> impl ::core::future::Future<Output = #output> + Send;
        });

        match args.as_slice() {
            [Type::Reference(req)] => {
                let req_type = &req.elem;
                let rsp_type = generic_arg(output, method_ident);
                export_branches.push(quote! {
                    let this = self.clone();
                    router.add_unary(#method_name, move |ctx: #krate::Context, req: #req_type| {
                        let this = this.clone();
                        async move { this.#method_ident(&ctx, &req).await }
                    });
                });
                let client_sig = quote! {
                    fn #method_ident(#receiver, ctx: &#krate::Context, req: &#req_type)
                        -> impl ::core::future::Future<Output = #output> + Send
                };
                client_decls.push(quote! { #client_sig; });
                client_impls.push(quote! {
                    #client_sig { self.unary::<#req_type, #rsp_type>(ctx, #method_name, req) }
                });
            }
            [Type::Reference(req), tx_type] => {
                let req_type = &req.elem;
                let rsp_type = generic_arg(tx_type, method_ident);
                export_branches.push(quote! {
                    let this = self.clone();
                    router.add_server_stream(#method_name, move |ctx: #krate::Context, req: #req_type, tx: #tx_type| {
                        let this = this.clone();
                        async move { this.#method_ident(&ctx, &req, tx).await }
                    });
                });
                let client_sig = quote! {
                    fn #method_ident(#receiver, ctx: &#krate::Context, req: &#req_type)
                        -> impl ::core::future::Future<Output = #krate::Result<#krate::RecvStream<#rsp_type>>> + Send
                };
                client_decls.push(quote! { #client_sig; });
                client_impls.push(quote! {
                    #client_sig { self.server_stream::<#req_type, #rsp_type>(ctx, #method_name, req) }
                });
            }
            [rx_type] => {
                let req_type = generic_arg(rx_type, method_ident);
                let rsp_type = generic_arg(output, method_ident);
                export_branches.push(quote! {
                    let this = self.clone();
                    router.add_client_stream(#method_name, move |ctx: #krate::Context, rx: #rx_type| {
                        let this = this.clone();
                        async move { this.#method_ident(&ctx, rx).await }
                    });
                });
                let client_sig = quote! {
                    fn #method_ident(#receiver, ctx: &#krate::Context)
                        -> impl ::core::future::Future<
                            Output = #krate::Result<#krate::ClientStreamingCall<#req_type, #rsp_type>>,
                        > + Send
                };
                client_decls.push(quote! { #client_sig; });
                client_impls.push(quote! {
                    #client_sig { self.client_stream::<#req_type, #rsp_type>(ctx, #method_name) }
                });
            }
            [rx_type, tx_type] => {
                let req_type = generic_arg(rx_type, method_ident);
                let rsp_type = generic_arg(tx_type, method_ident);
                export_branches.push(quote! {
                    let this = self.clone();
                    router.add_bidi_stream(#method_name, move |ctx: #krate::Context, rx: #rx_type, tx: #tx_type| {
                        let this = this.clone();
                        async move { this.#method_ident(&ctx, rx, tx).await }
                    });
                });
                let client_sig = quote! {
                    fn #method_ident(#receiver, ctx: &#krate::Context)
                        -> impl ::core::future::Future<
                            Output = #krate::Result<(#krate::SendStream<#req_type>, #krate::RecvStream<#rsp_type>)>,
                        > + Send
                };
                client_decls.push(quote! { #client_sig; });
                client_impls.push(quote! {
                    #client_sig { self.bidi_stream::<#req_type, #rsp_type>(ctx, #method_name) }
                });
            }
            _ => panic!("`{method_ident}` does not match any call shape."),
        }
    }

    quote! {
        #(#trait_attrs)*
        #visibility trait #trait_ident {
            const NAME: &'static str = #trait_name;

            #(#trait_methods)*

            fn greetrpc_export(self: ::std::sync::Arc<Self>, router: &mut #krate::Router)
            where
                Self: Sized + Send + Sync + 'static,
            {
                #(#export_branches)*
            }
        }

        #[doc = concat!("Client side of [`", #trait_name, "`].")]
        #visibility trait #client_ident {
            #(#client_decls)*
        }

        impl #client_ident for #krate::Client {
            #(#client_impls)*
        }
    }
    .into()
}

/// Parameters of a method declaration without a body, which only accepts
/// plain identifiers.
fn declaration_inputs(sig: &syn::Signature) -> Punctuated<FnArg, Token![,]> {
    let mut inputs = sig.inputs.clone();
    for input in &mut inputs {
        if let FnArg::Typed(arg) = input
            && let Pat::Ident(ident) = &mut *arg.pat
        {
            ident.mutability = None;
            ident.by_ref = None;
        }
    }
    inputs
}

/// Extracts `T` from a type written as `Path<T>`.
fn generic_arg(ty: &Type, method: &syn::Ident) -> Type {
    if let Type::Path(path) = ty
        && let Some(segment) = path.path.segments.last()
        && let PathArguments::AngleBracketed(args) = &segment.arguments
        && let Some(GenericArgument::Type(arg)) = args.args.first()
    {
        arg.clone()
    } else {
        panic!("`{method}`: expected a type of the form `Stream<T>` or `Result<T>`.");
    }
}

/// Gets the path the generated code uses to reach greetrpc.
///
/// - `::greetrpc` (or its renamed form) from dependent crates
/// - `crate` inside the greetrpc library itself
/// - `::greetrpc` from greetrpc's own integration tests, which cargo builds
///   as separate crates of the same package
pub(crate) fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("greetrpc") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        _ if std::env::var("CARGO_CRATE_NAME").is_ok_and(|name| name != "greetrpc") => {
            quote! { ::greetrpc }
        }
        _ => quote! { crate },
    }
}
