extern crate proc_macro;
use proc_macro::TokenStream;

mod wire;

use wire::WireImpl;

/// Derives `ringmaster::core::Wire` for a struct by encoding its fields in declaration order.
///
/// Fields marked `#[wire(skip)]` are not written and decode to their `Default` value.
#[proc_macro_derive(Wire, attributes(wire))]
pub fn wire(item: TokenStream) -> TokenStream {
  WireImpl::derive(syn::parse(item).unwrap())
    .map(|x| x.expand())
    .unwrap_or_else(|x| x.to_compile_error().into())
}
