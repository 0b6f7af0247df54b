//! BER-TLV codec.
//!
//! Tags use the multi-byte form of ISO/IEC 8825-1 Section 8.1.2 and are
//! represented as the big-endian integer of their raw bytes, so the tag
//! encoded as `5F 1F` is `0x5F1F`. Lengths use the short form or the long
//! form (`0x80 | n` followed by `n` big-endian bytes); the indefinite form is
//! rejected. A decoded object remembers a non-minimal length field and is
//! encoded with the same one, so decoding and re-encoding reproduces the
//! input byte for byte. Every read is bounds-checked against the input and nesting of
//! constructed objects is limited to [`MAX_DEPTH`] levels.

use core::mem;

use tracing::error;

use crate::error::EncodingError;

/// Maximum nesting depth accepted when decoding or encoding constructed objects.
pub const MAX_DEPTH: usize = 32;

/// Value of a TLV object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    /// Raw bytes of a primitive object.
    Primitive(Vec<u8>),
    /// Children of a constructed object, in encoding order.
    Constructed(Vec<TlvNode>),
}

/// A decoded TLV object. Constructed nodes own their children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    tag: u32,
    value: TlvValue,
    /// Size of the length field as decoded, `None` if it was minimal.
    length_len: Option<usize>,
}

/// Tag and length of a TLV object, as read from the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvHeader {
    /// The tag.
    pub tag: u32,
    /// Length of the value field.
    pub length: usize,
    /// Number of bytes used by the tag and the length fields.
    pub header_len: usize,
}

impl TlvHeader {
    /// Total length of the object, header included.
    ///
    /// # Errors
    ///
    /// * `EncodingError::LengthOverflow` if the sum does not fit in `usize`.
    pub fn total_len(&self) -> Result<usize, EncodingError> {
        self.header_len
            .checked_add(self.length)
            .ok_or(EncodingError::LengthOverflow)
    }
}

impl TlvNode {
    /// Creates a primitive object.
    #[must_use]
    pub fn primitive(tag: u32, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            value: TlvValue::Primitive(value.into()),
            length_len: None,
        }
    }

    /// Creates a constructed object holding `children`.
    #[must_use]
    pub fn constructed(tag: u32, children: Vec<TlvNode>) -> Self {
        Self {
            tag,
            value: TlvValue::Constructed(children),
            length_len: None,
        }
    }

    #[must_use]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    #[must_use]
    pub fn value(&self) -> &TlvValue {
        &self.value
    }

    #[must_use]
    pub fn is_constructed(&self) -> bool {
        matches!(self.value, TlvValue::Constructed(_))
    }

    /// Bytes of a primitive object, `None` for constructed ones.
    #[must_use]
    pub fn primitive_value(&self) -> Option<&[u8]> {
        match self.value {
            TlvValue::Primitive(ref bytes) => Some(bytes),
            TlvValue::Constructed(_) => None,
        }
    }

    /// Children of a constructed object, empty for primitive ones.
    #[must_use]
    pub fn children(&self) -> &[TlvNode] {
        match self.value {
            TlvValue::Primitive(_) => &[],
            TlvValue::Constructed(ref children) => children,
        }
    }

    /// First direct child with the given tag.
    #[must_use]
    pub fn find_child(&self, tag: u32) -> Option<&TlvNode> {
        self.children().iter().find(|child| child.tag == tag)
    }

    /// Depth-first search for the first object with the given tag, `self` included.
    #[must_use]
    pub fn find(&self, tag: u32) -> Option<&TlvNode> {
        if self.tag == tag {
            return Some(self);
        }
        self.children().iter().find_map(|child| child.find(tag))
    }

    /// Encodes the object.
    ///
    /// # Errors
    ///
    /// * `EncodingError::InvalidTag` if a tag in the tree is not a valid BER tag.
    /// * `EncodingError::RecursionLimitExceeded` if the tree is deeper than [`MAX_DEPTH`].
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut out = Vec::new();
        self.encode_into(&mut out, 1)?;
        Ok(out)
    }

    fn encode_into(&self, out: &mut Vec<u8>, depth: usize) -> Result<(), EncodingError> {
        if depth > MAX_DEPTH {
            return Err(EncodingError::RecursionLimitExceeded(MAX_DEPTH));
        }
        let tag_bytes = encode_tag(self.tag)?;
        let constructed_bit = tag_bytes[0] & 0x20 != 0;
        if constructed_bit != self.is_constructed() {
            error!(
                "Tag {:X} constructed bit does not match the node kind",
                self.tag
            );
            return Err(EncodingError::InvalidTag(self.tag));
        }
        out.extend_from_slice(&tag_bytes);
        match self.value {
            TlvValue::Primitive(ref bytes) => {
                out.extend_from_slice(&self.encode_own_length(bytes.len()));
                out.extend_from_slice(bytes);
            }
            TlvValue::Constructed(ref children) => {
                let mut content = Vec::new();
                for child in children {
                    child.encode_into(&mut content, depth + 1)?;
                }
                out.extend_from_slice(&self.encode_own_length(content.len()));
                out.extend_from_slice(&content);
            }
        }
        Ok(())
    }

    /// Length field in the size it was decoded with, if that still holds `length`.
    fn encode_own_length(&self, length: usize) -> Vec<u8> {
        let minimal = encode_length(length);
        let Some(length_len) = self.length_len.filter(|&len| len > minimal.len()) else {
            return minimal;
        };
        // decoded long forms have at most size_of::<usize>() octets
        let octets = length.to_be_bytes();
        let n = (length_len - 1).min(octets.len());
        let mut out = Vec::with_capacity(1 + n);
        out.push(0x80 | n.to_be_bytes()[mem::size_of::<usize>() - 1]);
        out.extend_from_slice(&octets[octets.len() - n..]);
        out
    }
}

/// Encodes a primitive TLV object.
///
/// # Errors
///
/// * `EncodingError::InvalidTag` if `tag` is not a valid tag for a primitive object.
///
/// # Example
///
/// ```
/// # use emrtd_access::EmrtdError;
/// #
/// # fn main() -> Result<(), EmrtdError> {
/// use emrtd_access::tlv;
/// use hex_literal::hex;
///
/// assert_eq!(tlv::encode(0x5F1F, b"P<NLD")?, hex!("5F1F05503C4E4C44"));
/// #
/// #     Ok(())
/// # }
/// ```
pub fn encode(tag: u32, value: &[u8]) -> Result<Vec<u8>, EncodingError> {
    TlvNode::primitive(tag, value).encode()
}

/// Encodes a tag into its BER bytes.
///
/// # Errors
///
/// * `EncodingError::InvalidTag` if the bytes of `tag` do not form a single BER tag.
pub fn encode_tag(tag: u32) -> Result<Vec<u8>, EncodingError> {
    let bytes = tag.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|&&b| b == 0).count();
    let bytes = &bytes[skip..];

    let valid = match bytes {
        [single] => single & 0x1F != 0x1F,
        [first, rest @ ..] => {
            let (last, middle) = rest.split_last().map_or((0, &[][..]), |(l, m)| (*l, m));
            first & 0x1F == 0x1F && middle.iter().all(|b| b & 0x80 != 0) && last & 0x80 == 0
        }
        [] => false,
    };
    if !valid {
        return Err(EncodingError::InvalidTag(tag));
    }
    Ok(bytes.to_vec())
}

/// Encodes a length field.
///
/// Lengths below 128 use a single byte, larger ones the long form with the
/// minimal number of big-endian octets.
///
/// # Examples
///
/// ```
/// use emrtd_access::tlv::encode_length;
/// use hex_literal::hex;
///
/// assert_eq!(encode_length(0), hex!("00").to_vec());
/// assert_eq!(encode_length(127), hex!("7F").to_vec());
/// assert_eq!(encode_length(2024), hex!("8207E8").to_vec());
/// assert_eq!(encode_length(65536), hex!("83010000").to_vec());
/// ```
#[must_use]
pub fn encode_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        return vec![length.to_be_bytes()[mem::size_of::<usize>() - 1]];
    }
    let bytes = length.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let significant = &bytes[skip..];
    let mut out = Vec::with_capacity(1 + significant.len());
    // at most size_of::<usize>() octets, always below 0x80
    out.push(0x80 | significant.len().to_be_bytes()[mem::size_of::<usize>() - 1]);
    out.extend_from_slice(significant);
    out
}

/// Reads a BER tag from the start of `data`.
///
/// Returns the tag and the number of bytes it occupies.
///
/// # Errors
///
/// * `EncodingError::TruncatedData` if `data` ends inside the tag.
/// * `EncodingError::TagTooLong` if the tag needs more than four bytes.
pub fn read_tag(data: &[u8]) -> Result<(u32, usize), EncodingError> {
    let Some(&first) = data.first() else {
        return Err(EncodingError::TruncatedData {
            needed: 1,
            available: 0,
        });
    };
    let mut tag = u32::from(first);
    if first & 0x1F != 0x1F {
        return Ok((tag, 1));
    }

    let mut offset = 1;
    loop {
        let Some(&b) = data.get(offset) else {
            error!("TLV data ends inside a multi-byte tag");
            return Err(EncodingError::TruncatedData {
                needed: offset + 1,
                available: data.len(),
            });
        };
        offset += 1;
        if offset > mem::size_of::<u32>() {
            error!("TLV tag is longer than four bytes");
            return Err(EncodingError::TagTooLong);
        }
        tag = (tag << 8) | u32::from(b);
        if b & 0x80 == 0 {
            return Ok((tag, offset));
        }
    }
}

/// Reads a BER length from the start of `data`.
///
/// Returns the length value and the number of bytes the length field occupies.
///
/// # Errors
///
/// * `EncodingError::TruncatedData` if `data` ends inside the length field.
/// * `EncodingError::IndefiniteLengthUnsupported` for the `0x80` form.
/// * `EncodingError::LengthOverflow` if the value does not fit in `usize`.
pub fn read_length(data: &[u8]) -> Result<(usize, usize), EncodingError> {
    let Some(&first) = data.first() else {
        return Err(EncodingError::TruncatedData {
            needed: 1,
            available: 0,
        });
    };
    if first & 0x80 == 0 {
        return Ok((usize::from(first), 1));
    }
    let length_of_length = usize::from(first & 0x7F);
    if length_of_length == 0 {
        error!("Indefinite length form in TLV data");
        return Err(EncodingError::IndefiniteLengthUnsupported);
    }
    if length_of_length > mem::size_of::<usize>() {
        error!("TLV length field uses {length_of_length} octets");
        return Err(EncodingError::LengthOverflow);
    }
    let Some(octets) = data.get(1..=length_of_length) else {
        error!("TLV data ends inside a long form length");
        return Err(EncodingError::TruncatedData {
            needed: 1 + length_of_length,
            available: data.len(),
        });
    };
    let length = octets.iter().try_fold(0_usize, |acc, &b| {
        acc.checked_mul(0x100)
            .and_then(|acc| acc.checked_add(usize::from(b)))
            .ok_or(EncodingError::LengthOverflow)
    })?;
    Ok((length, 1 + length_of_length))
}

/// Reads the tag and length at the start of `data`, the value may be absent.
///
/// Used to learn the size of a file from its first bytes.
///
/// # Errors
///
/// * `EncodingError` if the header is malformed or truncated.
pub fn peek_header(data: &[u8]) -> Result<TlvHeader, EncodingError> {
    let (tag, tag_len) = read_tag(data)?;
    let (length, length_len) = read_length(&data[tag_len..])?;
    Ok(TlvHeader {
        tag,
        length,
        header_len: tag_len + length_len,
    })
}

/// Reads the tag and length at the start of `data` and checks that the value
/// fits in the remaining bytes.
///
/// # Errors
///
/// * `EncodingError` if the header is malformed or the value is truncated.
pub fn read_header(data: &[u8]) -> Result<TlvHeader, EncodingError> {
    let header = peek_header(data)?;
    let total = header.total_len()?;
    if data.len() < total {
        error!(
            "TLV value is truncated, expected len: {total}, found len: {}",
            data.len()
        );
        return Err(EncodingError::TruncatedData {
            needed: total,
            available: data.len(),
        });
    }
    Ok(header)
}

/// Decodes exactly one TLV object spanning all of `data`.
///
/// # Errors
///
/// * `EncodingError` if `data` is malformed, nested too deeply, or has trailing bytes.
pub fn decode(data: &[u8]) -> Result<TlvNode, EncodingError> {
    let (node, used) = decode_node(data, 1)?;
    if used != data.len() {
        error!("{} bytes left after decoding a TLV object", data.len() - used);
        return Err(EncodingError::TrailingData(data.len() - used));
    }
    Ok(node)
}

/// Decodes the TLV object at the start of `data`.
///
/// Returns the object and the number of bytes consumed.
///
/// # Errors
///
/// * `EncodingError` if `data` is malformed or nested too deeply.
pub fn decode_prefix(data: &[u8]) -> Result<(TlvNode, usize), EncodingError> {
    decode_node(data, 1)
}

/// Decodes a concatenation of TLV objects.
///
/// # Errors
///
/// * `EncodingError` if any object is malformed or nested too deeply.
pub fn decode_all(data: &[u8]) -> Result<Vec<TlvNode>, EncodingError> {
    decode_sequence(data, 1)
}

/// Encodes a sequence of objects back to back.
///
/// # Errors
///
/// * `EncodingError` if one of the objects can not be encoded.
pub fn encode_all(nodes: &[TlvNode]) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::new();
    for node in nodes {
        node.encode_into(&mut out, 1)?;
    }
    Ok(out)
}

fn decode_sequence(data: &[u8], depth: usize) -> Result<Vec<TlvNode>, EncodingError> {
    let mut nodes = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (node, used) = decode_node(rest, depth)?;
        nodes.push(node);
        rest = &rest[used..];
    }
    Ok(nodes)
}

fn decode_node(data: &[u8], depth: usize) -> Result<(TlvNode, usize), EncodingError> {
    if depth > MAX_DEPTH {
        error!("TLV nesting exceeds {MAX_DEPTH} levels");
        return Err(EncodingError::RecursionLimitExceeded(MAX_DEPTH));
    }
    let header = read_header(data)?;
    let total = header.total_len()?;
    let value = &data[header.header_len..total];

    // The constructed bit sits in the first tag byte.
    let mut node = if data[0] & 0x20 == 0 {
        TlvNode::primitive(header.tag, value)
    } else {
        TlvNode::constructed(header.tag, decode_sequence(value, depth + 1)?)
    };
    let (_, tag_len) = read_tag(data)?;
    let length_len = header.header_len - tag_len;
    if length_len != encode_length(header.length).len() {
        node.length_len = Some(length_len);
    }
    Ok((node, total))
}
