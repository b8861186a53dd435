use std::string::FromUtf8Error;
use thiserror::Error;

/// The datagram encoding: little endian integers, `u32` length prefixes on strings and lists,
/// and fields in declaration order.
///
/// Message types derive it with `#[derive(Wire)]`, which composes the impls below.
pub trait Wire: Sized {
  /// Appends the encoding to `buf`.
  fn encode(&self, buf: &mut Vec<u8>);
  /// Reads one value from the front of `buf`, advancing it.
  fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError>;
}

/// Why a datagram was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
  /// The datagram ended early.
  #[error("needed {needed} more bytes, {remaining} remaining")]
  Truncated {
    /// Bytes the next field needs.
    needed: usize,
    /// Bytes left in the datagram.
    remaining: usize,
  },
  /// The header names no known message kind.
  #[error("unknown message kind {0}")]
  UnknownKind(u32),
  /// A hostname was not valid UTF-8.
  #[error("string is not utf-8: {0}")]
  Utf8(#[from] FromUtf8Error),
  /// The message decoded with bytes left over.
  #[error("{0} trailing bytes after message")]
  TrailingBytes(usize),
  /// A member without an ID or a hostname.
  #[error("member with a zero id or an empty hostname")]
  EmptyMember,
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
  if buf.len() < n {
    return Err(DecodeError::Truncated {
      needed: n,
      remaining: buf.len(),
    });
  }
  let (head, tail) = buf.split_at(n);
  *buf = tail;
  Ok(head)
}

impl Wire for u32 {
  fn encode(&self, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&self.to_le_bytes());
  }

  fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(take(buf, 4)?);
    Ok(u32::from_le_bytes(bytes))
  }
}

impl Wire for u64 {
  fn encode(&self, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&self.to_le_bytes());
  }

  fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(take(buf, 8)?);
    Ok(u64::from_le_bytes(bytes))
  }
}

impl Wire for String {
  fn encode(&self, buf: &mut Vec<u8>) {
    (self.len() as u32).encode(buf);
    buf.extend_from_slice(self.as_bytes());
  }

  fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
    let len = u32::decode(buf)? as usize;
    Ok(String::from_utf8(take(buf, len)?.to_vec())?)
  }
}

impl<T: Wire> Wire for Vec<T> {
  fn encode(&self, buf: &mut Vec<u8>) {
    (self.len() as u32).encode(buf);
    for item in self {
      item.encode(buf);
    }
  }

  fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
    let len = u32::decode(buf)? as usize;
    // A bogus count must not turn into a huge allocation.
    let mut items = Vec::with_capacity(len.min(buf.len()));
    for _ in 0..len {
      items.push(T::decode(buf)?);
    }
    Ok(items)
  }
}

/// Decodes a complete datagram, rejecting anything left over.
pub fn decode_exact<T: Wire>(mut bytes: &[u8]) -> Result<T, DecodeError> {
  let item = T::decode(&mut bytes)?;
  match bytes.len() {
    0 => Ok(item),
    n => Err(DecodeError::TrailingBytes(n)),
  }
}

/// Encodes `item` into a fresh buffer.
pub fn encode_to_vec<T: Wire>(item: &T) -> Vec<u8> {
  let mut buf = Vec::new();
  item.encode(&mut buf);
  buf
}

#[test]
fn test_wire_layout() {
  let mut buf = Vec::new();
  0x0a0b0c0du32.encode(&mut buf);
  "h1".to_string().encode(&mut buf);
  vec![7u32, 9].encode(&mut buf);
  assert_eq!(
    buf,
    vec![
      0x0d, 0x0c, 0x0b, 0x0a, // u32, little endian
      2, 0, 0, 0, b'h', b'1', // length-prefixed string
      2, 0, 0, 0, 7, 0, 0, 0, 9, 0, 0, 0, // length-prefixed list
    ]
  );
  let mut rest = &buf[..];
  assert_eq!(u32::decode(&mut rest), Ok(0x0a0b0c0d));
  assert_eq!(String::decode(&mut rest), Ok("h1".to_string()));
  assert_eq!(Vec::<u32>::decode(&mut rest), Ok(vec![7, 9]));
  assert!(rest.is_empty());
}

#[test]
fn test_wire_truncated_and_trailing() {
  let buf = [5u8, 0, 0, 0, b'a', b'b'];
  assert_eq!(
    decode_exact::<String>(&buf),
    Err(DecodeError::Truncated {
      needed: 5,
      remaining: 2
    })
  );
  let buf = [1u8, 0, 0, 0, 2];
  assert_eq!(decode_exact::<u32>(&buf), Err(DecodeError::TrailingBytes(1)));
  let huge_count = [0xffu8, 0xff, 0xff, 0xff];
  assert!(matches!(
    decode_exact::<Vec<u32>>(&huge_count),
    Err(DecodeError::Truncated { .. })
  ));
}
