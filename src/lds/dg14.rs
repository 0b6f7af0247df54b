//! EF.DG14: security infos for Chip Authentication and Terminal Authentication.
//!
//! The content is a `SET OF SecurityInfo`, ICAO Doc 9303-11 Section 9.2 and
//! BSI TR-03110. Infos are kept in the order read from the chip; entries that
//! are not recognised are preserved verbatim. Public keys and Chip
//! Authentication algorithms are indexed by optional key identifiers whose
//! sets need not coincide.

use alloc::collections::BTreeMap;
use core::fmt;

use tracing::error;

use super::{single_child, Codec, DataGroupContent};
use crate::error::{EmrtdError, EncodingError};
use crate::tlv::TlvNode;

const SET_TAG: u32 = 0x31;
const SEQUENCE_TAG: u32 = 0x30;
const OID_TAG: u32 = 0x06;
const INTEGER_TAG: u32 = 0x02;
const OCTET_STRING_TAG: u32 = 0x04;

/// `id-PK`, 0.4.0.127.0.7.2.2.1
pub const ID_PK: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x01];
/// `id-TA`, 0.4.0.127.0.7.2.2.2
pub const ID_TA: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x02];
/// `id-CA`, 0.4.0.127.0.7.2.2.3
pub const ID_CA: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x03];
/// `id-PK-DH`, 0.4.0.127.0.7.2.2.1.1
pub const ID_PK_DH: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x01, 0x01];
/// `id-PK-ECDH`, 0.4.0.127.0.7.2.2.1.2
pub const ID_PK_ECDH: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x01, 0x02];
/// `id-ecPublicKey`, 1.2.840.10045.2.1
pub const ID_EC_PUBLIC_KEY: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
/// `dhpublicnumber`, 1.2.840.10046.2.1
pub const DH_PUBLIC_NUMBER: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3E, 0x02, 0x01];

pub(super) const CODEC: Codec = Codec {
    decode: decode_content,
    encode: encode_content,
};

fn decode_content(children: &[TlvNode]) -> Result<DataGroupContent, EncodingError> {
    SecurityInfos::decode(children).map(DataGroupContent::Dg14)
}

fn encode_content(content: &DataGroupContent) -> Result<Vec<TlvNode>, EncodingError> {
    match content {
        DataGroupContent::Dg14(infos) => infos.encode(),
        _ => Err(EncodingError::InvalidContent("content is not EF.DG14")),
    }
}

/// An ASN.1 object identifier, held as its DER content bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectIdentifier(Vec<u8>);

impl ObjectIdentifier {
    /// # Errors
    ///
    /// * `EncodingError::InvalidContent` if `content` is empty or ends inside a sub-identifier.
    pub fn new(content: &[u8]) -> Result<Self, EncodingError> {
        match content.last() {
            Some(last) if last & 0x80 == 0 => Ok(Self(content.to_vec())),
            _ => {
                error!("Invalid object identifier encoding");
                Err(EncodingError::InvalidContent("invalid object identifier"))
            }
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether `prefix` is a proper prefix of this identifier.
    #[must_use]
    pub fn is_under(&self, prefix: &[u8]) -> bool {
        self.0.len() > prefix.len() && self.0.starts_with(prefix)
    }

    fn to_tlv(&self) -> TlvNode {
        TlvNode::primitive(OID_TAG, self.0.clone())
    }

    fn from_tlv(node: &TlvNode) -> Option<Self> {
        match node.primitive_value() {
            Some(value) if node.tag() == OID_TAG => Self::new(value).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut arcs = Vec::new();
        let mut value: u128 = 0;
        for &b in &self.0 {
            value = (value << 7) | u128::from(b & 0x7F);
            if b & 0x80 == 0 {
                arcs.push(value);
                value = 0;
            }
        }
        for (i, arc) in arcs.into_iter().enumerate() {
            if i == 0 {
                let (first, second) = match arc {
                    0..=39 => (0, arc),
                    40..=79 => (1, arc - 40),
                    _ => (2, arc - 80),
                };
                write!(f, "{first}.{second}")?;
            } else {
                write!(f, ".{arc}")?;
            }
        }
        Ok(())
    }
}

/// A `SubjectPublicKeyInfo`, kept as its TLV tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPublicKeyInfo(TlvNode);

impl SubjectPublicKeyInfo {
    /// # Errors
    ///
    /// * `EncodingError` if `node` is not a SEQUENCE starting with an AlgorithmIdentifier.
    pub fn new(node: TlvNode) -> Result<Self, EncodingError> {
        let info = Self(node);
        if info.0.tag() != SEQUENCE_TAG || info.algorithm().is_none() {
            error!("SubjectPublicKeyInfo must be a SEQUENCE with an algorithm identifier");
            return Err(EncodingError::InvalidContent("invalid SubjectPublicKeyInfo"));
        }
        Ok(info)
    }

    /// Algorithm of the key, e.g. `id-ecPublicKey`.
    #[must_use]
    pub fn algorithm(&self) -> Option<ObjectIdentifier> {
        let algorithm_identifier = self.0.children().first()?;
        if algorithm_identifier.tag() != SEQUENCE_TAG {
            return None;
        }
        ObjectIdentifier::from_tlv(algorithm_identifier.children().first()?)
    }

    #[must_use]
    pub fn as_tlv(&self) -> &TlvNode {
        &self.0
    }
}

/// Key identifier of a Chip Authentication key, absent when the chip holds one key.
pub type KeyId = Option<i64>;

/// `ChipAuthenticationPublicKeyInfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipAuthenticationPublicKeyInfo {
    pub protocol: ObjectIdentifier,
    pub public_key: SubjectPublicKeyInfo,
    pub key_id: KeyId,
}

/// `ChipAuthenticationInfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipAuthenticationInfo {
    pub protocol: ObjectIdentifier,
    pub version: i64,
    pub key_id: KeyId,
}

/// `TerminalAuthenticationInfo`, the optional `efCVCA` kept as a TLV tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalAuthenticationInfo {
    pub protocol: ObjectIdentifier,
    pub version: i64,
    pub ef_cvca: Option<TlvNode>,
}

impl TerminalAuthenticationInfo {
    /// File identifier of EF.CVCA, when given.
    #[must_use]
    pub fn cvca_file_id(&self) -> Option<u16> {
        let fid = self.ef_cvca.as_ref()?.find_child(OCTET_STRING_TAG)?;
        match *fid.primitive_value()? {
            [hi, lo] => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityInfo {
    ChipAuthenticationPublicKey(ChipAuthenticationPublicKeyInfo),
    ChipAuthentication(ChipAuthenticationInfo),
    TerminalAuthentication(TerminalAuthenticationInfo),
    /// Any other info, e.g. PACE or Active Authentication, unchanged.
    Other(TlvNode),
}

/// Decodes a DER INTEGER that fits in `i64`. Non-minimal encodings are
/// refused so that re-encoding reproduces the input.
fn decode_integer(node: &TlvNode) -> Option<i64> {
    if node.tag() != INTEGER_TAG {
        return None;
    }
    let value = node.primitive_value()?;
    match *value {
        [] => return None,
        [0x00, next, ..] if next & 0x80 == 0 => return None,
        [0xFF, next, ..] if next & 0x80 != 0 => return None,
        _ if value.len() > 8 => return None,
        _ => {}
    }
    let fill = if value[0] & 0x80 == 0 { 0x00 } else { 0xFF };
    let mut bytes = [fill; 8];
    bytes[8 - value.len()..].copy_from_slice(value);
    Some(i64::from_be_bytes(bytes))
}

fn encode_integer(value: i64) -> TlvNode {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        if (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    TlvNode::primitive(INTEGER_TAG, bytes[start..].to_vec())
}

fn key_ids_valid<'a>(ids: impl ExactSizeIterator<Item = &'a KeyId>) -> bool {
    let count = ids.len();
    ids.into_iter().all(|id| match id {
        None => count == 1,
        Some(id) => *id >= 0,
    })
}

fn optional_integer(node: Option<&TlvNode>) -> Option<KeyId> {
    match node {
        None => Some(None),
        Some(node) => decode_integer(node).map(Some),
    }
}

impl SecurityInfo {
    /// Classifies a `SecurityInfo` by its protocol identifier. Anything
    /// that does not match the expected structure exactly is kept as
    /// [`SecurityInfo::Other`].
    #[must_use]
    pub fn from_tlv(node: &TlvNode) -> Self {
        Self::classify(node).unwrap_or_else(|| Self::Other(node.clone()))
    }

    fn classify(node: &TlvNode) -> Option<Self> {
        if node.tag() != SEQUENCE_TAG {
            return None;
        }
        let (oid, rest) = node.children().split_first()?;
        let protocol = ObjectIdentifier::from_tlv(oid)?;
        let (required, optional) = match rest {
            [required] => (required, None),
            [required, optional] => (required, Some(optional)),
            _ => return None,
        };

        if protocol.is_under(ID_PK) {
            let public_key = SubjectPublicKeyInfo::new(required.clone()).ok()?;
            Some(Self::ChipAuthenticationPublicKey(
                ChipAuthenticationPublicKeyInfo {
                    protocol,
                    public_key,
                    key_id: optional_integer(optional)?,
                },
            ))
        } else if protocol.is_under(ID_CA) {
            Some(Self::ChipAuthentication(ChipAuthenticationInfo {
                protocol,
                version: decode_integer(required)?,
                key_id: optional_integer(optional)?,
            }))
        } else if protocol.as_bytes() == ID_TA {
            Some(Self::TerminalAuthentication(TerminalAuthenticationInfo {
                protocol,
                version: decode_integer(required)?,
                ef_cvca: optional.cloned(),
            }))
        } else {
            None
        }
    }

    #[must_use]
    pub fn to_tlv(&self) -> TlvNode {
        let mut children = Vec::with_capacity(3);
        match self {
            Self::ChipAuthenticationPublicKey(info) => {
                children.push(info.protocol.to_tlv());
                children.push(info.public_key.0.clone());
                children.extend(info.key_id.map(encode_integer));
            }
            Self::ChipAuthentication(info) => {
                children.push(info.protocol.to_tlv());
                children.push(encode_integer(info.version));
                children.extend(info.key_id.map(encode_integer));
            }
            Self::TerminalAuthentication(info) => {
                children.push(info.protocol.to_tlv());
                children.push(encode_integer(info.version));
                children.extend(info.ef_cvca.clone());
            }
            Self::Other(node) => return node.clone(),
        }
        TlvNode::constructed(SEQUENCE_TAG, children)
    }
}

/// Content of EF.DG14.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityInfos {
    infos: Vec<SecurityInfo>,
}

impl SecurityInfos {
    /// Wraps infos in the given order.
    #[must_use]
    pub fn new(infos: Vec<SecurityInfo>) -> Self {
        Self { infos }
    }

    /// Builds DG14 content from Chip Authentication public keys and
    /// algorithms, adding a `TerminalAuthenticationInfo` version 1.
    ///
    /// A key without identifier is only allowed when it is the only key.
    /// The protocol of each key follows from its algorithm.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::InvalidArgument` if there is no key, a key identifier
    ///   is negative or missing among several keys, or a key algorithm is
    ///   neither EC nor DH.
    pub fn from_maps(
        public_keys: BTreeMap<KeyId, SubjectPublicKeyInfo>,
        chip_authentication_infos: BTreeMap<KeyId, ObjectIdentifier>,
    ) -> Result<Self, EmrtdError> {
        if public_keys.is_empty() {
            error!("DG14 needs at least one Chip Authentication public key");
            return Err(EmrtdError::InvalidArgument("need at least one public key"));
        }
        if !key_ids_valid(public_keys.keys()) || !key_ids_valid(chip_authentication_infos.keys()) {
            error!("DG14 key identifiers must be non-negative and present when several keys exist");
            return Err(EmrtdError::InvalidArgument("invalid key identifier"));
        }

        let mut infos = Vec::with_capacity(public_keys.len() + chip_authentication_infos.len() + 1);
        for (key_id, public_key) in public_keys {
            let protocol = match public_key.algorithm() {
                Some(oid) if oid.as_bytes() == ID_EC_PUBLIC_KEY => ID_PK_ECDH,
                Some(oid) if oid.as_bytes() == DH_PUBLIC_NUMBER => ID_PK_DH,
                _ => {
                    error!("Unsupported Chip Authentication key algorithm");
                    return Err(EmrtdError::InvalidArgument("unsupported key algorithm"));
                }
            };
            infos.push(SecurityInfo::ChipAuthenticationPublicKey(
                ChipAuthenticationPublicKeyInfo {
                    protocol: ObjectIdentifier(protocol.to_vec()),
                    public_key,
                    key_id,
                },
            ));
        }
        for (key_id, protocol) in chip_authentication_infos {
            infos.push(SecurityInfo::ChipAuthentication(ChipAuthenticationInfo {
                protocol,
                version: 1,
                key_id,
            }));
        }
        infos.push(SecurityInfo::TerminalAuthentication(
            TerminalAuthenticationInfo {
                protocol: ObjectIdentifier(ID_TA.to_vec()),
                version: 1,
                ef_cvca: None,
            },
        ));
        Ok(Self { infos })
    }

    pub(super) fn decode(children: &[TlvNode]) -> Result<Self, EncodingError> {
        let set = single_child(children, SET_TAG)?;
        if !set.is_constructed() {
            return Err(EncodingError::InvalidContent("SecurityInfos is not a SET"));
        }
        Ok(Self {
            infos: set.children().iter().map(SecurityInfo::from_tlv).collect(),
        })
    }

    pub(super) fn encode(&self) -> Result<Vec<TlvNode>, EncodingError> {
        Ok(vec![TlvNode::constructed(
            SET_TAG,
            self.infos.iter().map(SecurityInfo::to_tlv).collect(),
        )])
    }

    #[must_use]
    pub fn infos(&self) -> &[SecurityInfo] {
        &self.infos
    }

    /// Chip Authentication public keys with their key identifiers, in file
    /// order. Keys sharing an identifier are all returned.
    #[must_use]
    pub fn public_keys(&self) -> Vec<(KeyId, &SubjectPublicKeyInfo)> {
        self.infos
            .iter()
            .filter_map(|info| match info {
                SecurityInfo::ChipAuthenticationPublicKey(info) => {
                    Some((info.key_id, &info.public_key))
                }
                _ => None,
            })
            .collect()
    }

    /// Chip Authentication protocols with their key identifiers, in file order.
    #[must_use]
    pub fn chip_authentication_infos(&self) -> Vec<(KeyId, &ObjectIdentifier)> {
        self.infos
            .iter()
            .filter_map(|info| match info {
                SecurityInfo::ChipAuthentication(info) => Some((info.key_id, &info.protocol)),
                _ => None,
            })
            .collect()
    }

    /// File identifiers of EF.CVCA announced by the Terminal Authentication infos.
    #[must_use]
    pub fn cvca_file_ids(&self) -> Vec<u16> {
        self.infos
            .iter()
            .filter_map(|info| match info {
                SecurityInfo::TerminalAuthentication(info) => info.cvca_file_id(),
                _ => None,
            })
            .collect()
    }
}
