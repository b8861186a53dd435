use itertools::Itertools;
use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Attribute, DeriveInput, Error, Ident, Token, Type};

pub struct WireImpl {
  type_id: Ident,
  shape: Shape,
}
impl WireImpl {
  pub fn derive(ast: DeriveInput) -> syn::Result<Self> {
    derive(ast)
  }
  pub fn expand(&self) -> TokenStream {
    expand(self)
  }
}

enum Shape {
  Unit,
  Named(Vec<WireField>),
}

struct WireField {
  name: Ident,
  ty: Type,
  props: WireProperties,
}

fn derive(ast: DeriveInput) -> syn::Result<WireImpl> {
  let aspan = ast.span();
  if let Some(param) = ast.generics.params.first() {
    return Err(Error::new(param.span(), "Wire does not allow generic parameters."));
  }

  let data_struct = match ast.data {
    syn::Data::Struct(x) => x,
    _ => return Err(Error::new(aspan, "Wire only supports structs.")),
  };
  let shape = match data_struct.fields {
    syn::Fields::Unit => Shape::Unit,
    syn::Fields::Named(n) => {
      let mut fields = vec![];
      for f in n.named {
        let fspan = f.span();
        fields.push(WireField {
          name: f.ident.ok_or_else(|| Error::new(fspan, "Wire fields must be named."))?,
          ty: f.ty,
          props: WireProperties::get(f.attrs)?.unwrap_or_default(),
        });
      }
      Shape::Named(fields)
    }
    syn::Fields::Unnamed(u) => {
      return Err(Error::new(u.span(), "Wire does not support tuple structs."))
    }
  };

  Ok(WireImpl {
    type_id: ast.ident,
    shape: shape,
  })
}

#[derive(Default)]
struct WireProperties {
  skip: bool,
}
impl WireProperties {
  fn get(attrs: Vec<Attribute>) -> Result<Option<Self>, Error> {
    let mut i = attrs.into_iter().filter(|attr| attr.path.is_ident("wire"));
    match (i.next(), i.next()) {
      (None, None) => Ok(None),
      (Some(attr), None) => Ok(Some(attr.parse_args()?)),
      (Some(_), Some(attr)) => Err(Error::new(
        attr.path.span(),
        "Wire does not allow more than one 'wire' annotation on a field.",
      )),
      _ => unreachable!(),
    }
  }
}

impl Parse for WireProperties {
  fn parse(input: ParseStream) -> syn::Result<WireProperties> {
    let flags = Punctuated::<Ident, Token![,]>::parse_terminated(input)?;
    let mut skip = false;
    for flag in flags {
      match flag.to_string().as_str() {
        "skip" => {
          if skip {
            return Err(Error::new(flag.span(), "Duplicate flag `skip`"));
          }
          skip = true;
        }
        _ => return Err(Error::new(flag.span(), format!("Unknown flag `{}`", flag))),
      }
    }
    Ok(WireProperties { skip: skip })
  }
}

fn expand(root: &WireImpl) -> TokenStream {
  let type_id = &root.type_id;

  let (encode_body, decode_body) = match &root.shape {
    Shape::Unit => (quote!(), quote!(#type_id)),
    Shape::Named(fields) => {
      let encodes = fields.iter().filter(|f| !f.props.skip).map(|f| {
        let name = &f.name;
        quote!(ringmaster::core::Wire::encode(&self.#name, buf);)
      });
      let decodes = fields
        .iter()
        .map(|f| {
          let name = &f.name;
          let ty = &f.ty;
          if f.props.skip {
            quote!(#name: <#ty as ::std::default::Default>::default())
          } else {
            quote!(#name: <#ty as ringmaster::core::Wire>::decode(buf)?)
          }
        })
        .collect_vec();
      (quote!(#(#encodes)*), quote!(#type_id { #(#decodes),* }))
    }
  };

  TokenStream::from(quote! {
    impl ringmaster::core::Wire for #type_id {
      #[allow(unused_variables)]
      fn encode(&self, buf: &mut ::std::vec::Vec<u8>) {
        #encode_body
      }

      #[allow(unused_variables)]
      fn decode(
        buf: &mut &[u8]
      ) -> ::std::result::Result<Self, ringmaster::core::DecodeError> {
        ::std::result::Result::Ok(#decode_body)
      }
    }
  })
}
