//! Logical Data Structure: the elementary files of the eMRTD application and
//! their typed contents.
//!
//! Every file is a single constructed TLV object whose tag identifies the
//! data group, ICAO Doc 9303-10 Section 4.6. A [`Registry`] maps that tag to
//! the pair of functions decoding and encoding its content.

use alloc::borrow::Cow;
use alloc::collections::BTreeMap;
use core::fmt;

use tracing::{debug, error};

use crate::error::EncodingError;
use crate::tlv::{self, TlvNode};

pub mod com;
pub mod details;
pub mod dg1;
pub mod dg14;
pub mod dg15;
pub mod dg2;

pub use com::ComInfo;
pub use details::AdditionalDetails;
pub use dg1::{MrzInfo, MrzLayout};
pub use dg14::{ObjectIdentifier, SecurityInfo, SecurityInfos, SubjectPublicKeyInfo};
pub use dg2::{BiometricTemplate, FaceImage, FaceInfos, ImageDataType};

/// Elementary files of the eMRTD application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataGroup {
    Com,
    Dg1,
    Dg2,
    Dg3,
    Dg4,
    Dg5,
    Dg6,
    Dg7,
    Dg8,
    Dg9,
    Dg10,
    Dg11,
    Dg12,
    Dg13,
    Dg14,
    Dg15,
    Dg16,
    Sod,
}

impl DataGroup {
    pub const ALL: [Self; 18] = [
        Self::Com,
        Self::Dg1,
        Self::Dg2,
        Self::Dg3,
        Self::Dg4,
        Self::Dg5,
        Self::Dg6,
        Self::Dg7,
        Self::Dg8,
        Self::Dg9,
        Self::Dg10,
        Self::Dg11,
        Self::Dg12,
        Self::Dg13,
        Self::Dg14,
        Self::Dg15,
        Self::Dg16,
        Self::Sod,
    ];

    /// Tag of the outermost TLV object of the file.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::Com => 0x60,
            Self::Dg1 => 0x61,
            Self::Dg2 => 0x75,
            Self::Dg3 => 0x63,
            Self::Dg4 => 0x76,
            Self::Dg5 => 0x65,
            Self::Dg6 => 0x66,
            Self::Dg7 => 0x67,
            Self::Dg8 => 0x68,
            Self::Dg9 => 0x69,
            Self::Dg10 => 0x6A,
            Self::Dg11 => 0x6B,
            Self::Dg12 => 0x6C,
            Self::Dg13 => 0x6D,
            Self::Dg14 => 0x6E,
            Self::Dg15 => 0x6F,
            Self::Dg16 => 0x70,
            Self::Sod => 0x77,
        }
    }

    /// File identifier used with SELECT.
    #[must_use]
    pub const fn fid(self) -> u16 {
        match self.number() {
            Some(n) => 0x0100 | n as u16,
            None => match self {
                Self::Com => 0x011E,
                _ => 0x011D,
            },
        }
    }

    /// Short file identifier.
    #[must_use]
    pub const fn sfi(self) -> u8 {
        match self.number() {
            Some(n) => n,
            None => match self {
                Self::Com => 0x1E,
                _ => 0x1D,
            },
        }
    }

    /// Data group number, `None` for EF.COM and EF.SOD.
    #[must_use]
    pub const fn number(self) -> Option<u8> {
        match self {
            Self::Com | Self::Sod => None,
            Self::Dg1 => Some(1),
            Self::Dg2 => Some(2),
            Self::Dg3 => Some(3),
            Self::Dg4 => Some(4),
            Self::Dg5 => Some(5),
            Self::Dg6 => Some(6),
            Self::Dg7 => Some(7),
            Self::Dg8 => Some(8),
            Self::Dg9 => Some(9),
            Self::Dg10 => Some(10),
            Self::Dg11 => Some(11),
            Self::Dg12 => Some(12),
            Self::Dg13 => Some(13),
            Self::Dg14 => Some(14),
            Self::Dg15 => Some(15),
            Self::Dg16 => Some(16),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Com => "EF.COM",
            Self::Dg1 => "EF.DG1",
            Self::Dg2 => "EF.DG2",
            Self::Dg3 => "EF.DG3",
            Self::Dg4 => "EF.DG4",
            Self::Dg5 => "EF.DG5",
            Self::Dg6 => "EF.DG6",
            Self::Dg7 => "EF.DG7",
            Self::Dg8 => "EF.DG8",
            Self::Dg9 => "EF.DG9",
            Self::Dg10 => "EF.DG10",
            Self::Dg11 => "EF.DG11",
            Self::Dg12 => "EF.DG12",
            Self::Dg13 => "EF.DG13",
            Self::Dg14 => "EF.DG14",
            Self::Dg15 => "EF.DG15",
            Self::Dg16 => "EF.DG16",
            Self::Sod => "EF.SOD",
        }
    }

    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|group| group.tag() == tag)
    }

    #[must_use]
    pub fn from_fid(fid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|group| group.fid() == fid)
    }

    #[must_use]
    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|group| group.number() == Some(number))
    }
}

impl fmt::Display for DataGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed content of a data group.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DataGroupContent {
    Com(ComInfo),
    Dg1(MrzInfo),
    Dg2(FaceInfos),
    Dg11(AdditionalDetails),
    Dg12(AdditionalDetails),
    Dg14(SecurityInfos),
    /// Active Authentication public key.
    Dg15(SubjectPublicKeyInfo),
    /// Children of the root object, kept as a TLV tree.
    Opaque(Vec<TlvNode>),
}

/// Decodes the children of a data group root object.
pub type DecodeFn = fn(&[TlvNode]) -> Result<DataGroupContent, EncodingError>;
/// Encodes typed content back into the children of the root object.
pub type EncodeFn = fn(&DataGroupContent) -> Result<Vec<TlvNode>, EncodingError>;

/// Decode and encode functions for one data group tag.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    pub decode: DecodeFn,
    pub encode: EncodeFn,
}

fn decode_opaque(children: &[TlvNode]) -> Result<DataGroupContent, EncodingError> {
    Ok(DataGroupContent::Opaque(children.to_vec()))
}

fn encode_opaque(content: &DataGroupContent) -> Result<Vec<TlvNode>, EncodingError> {
    match content {
        DataGroupContent::Opaque(children) => Ok(children.clone()),
        _ => Err(EncodingError::InvalidContent("content is not an opaque TLV tree")),
    }
}

const OPAQUE: Codec = Codec {
    decode: decode_opaque,
    encode: encode_opaque,
};

/// Maps data group tags to their codecs.
#[derive(Debug, Clone)]
pub struct Registry {
    codecs: BTreeMap<u32, Codec>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            codecs: BTreeMap::new(),
        }
    }

    /// Typed codecs for EF.COM, DG1, DG2, DG11, DG12, DG14 and DG15, opaque
    /// TLV trees for every other file of [`DataGroup::ALL`].
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for group in DataGroup::ALL {
            let codec = match group {
                DataGroup::Com => com::CODEC,
                DataGroup::Dg1 => dg1::CODEC,
                DataGroup::Dg2 => dg2::CODEC,
                DataGroup::Dg11 => details::DG11_CODEC,
                DataGroup::Dg12 => details::DG12_CODEC,
                DataGroup::Dg14 => dg14::CODEC,
                DataGroup::Dg15 => dg15::CODEC,
                _ => OPAQUE,
            };
            registry.register(group.tag(), codec);
        }
        registry
    }

    /// Registers `codec` for `tag`, returning the codec it replaces.
    pub fn register(&mut self, tag: u32, codec: Codec) -> Option<Codec> {
        self.codecs.insert(tag, codec)
    }

    #[must_use]
    pub fn lookup(&self, tag: u32) -> Option<&Codec> {
        self.codecs.get(&tag)
    }

    /// Decodes a complete elementary file.
    ///
    /// # Errors
    ///
    /// * `EncodingError::InvalidTag` if the root tag is not registered.
    /// * `EncodingError` if the TLV structure or the content is malformed.
    pub fn decode(&self, bytes: &[u8]) -> Result<DataGroupFile, EncodingError> {
        let root = tlv::decode(bytes)?;
        let Some(group) = DataGroup::from_tag(root.tag()) else {
            error!("Unknown data group tag {:X}", root.tag());
            return Err(EncodingError::InvalidTag(root.tag()));
        };
        let Some(codec) = self.lookup(root.tag()) else {
            error!("No codec registered for {group}");
            return Err(EncodingError::InvalidTag(root.tag()));
        };
        if !root.is_constructed() {
            error!("{group} root object is not constructed");
            return Err(EncodingError::InvalidContent("data group root is primitive"));
        }
        let content = (codec.decode)(root.children())?;
        debug!("Decoded {group}, {} bytes", bytes.len());
        Ok(DataGroupFile {
            group,
            content,
            source: Some(bytes.to_vec()),
        })
    }

    /// Encodes `file` from its typed content, ignoring any retained source bytes.
    ///
    /// # Errors
    ///
    /// * `EncodingError::InvalidTag` if the tag of the file is not registered.
    /// * `EncodingError` if the content can not be encoded.
    pub fn encode(&self, file: &DataGroupFile) -> Result<Vec<u8>, EncodingError> {
        let tag = file.group.tag();
        let Some(codec) = self.lookup(tag) else {
            error!("No codec registered for {}", file.group);
            return Err(EncodingError::InvalidTag(tag));
        };
        TlvNode::constructed(tag, (codec.encode)(&file.content)?).encode()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

/// A decoded elementary file.
///
/// A file decoded from bytes keeps them, and [`DataGroupFile::encoded`]
/// returns them verbatim until the content is mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataGroupFile {
    group: DataGroup,
    content: DataGroupContent,
    source: Option<Vec<u8>>,
}

impl DataGroupFile {
    #[must_use]
    pub fn new(group: DataGroup, content: DataGroupContent) -> Self {
        Self {
            group,
            content,
            source: None,
        }
    }

    /// Decodes a file with the standard registry.
    ///
    /// # Errors
    ///
    /// * `EncodingError` if the file is malformed.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_access::EmrtdError;
    /// #
    /// # fn main() -> Result<(), EmrtdError> {
    /// use emrtd_access::lds::{DataGroup, DataGroupFile};
    /// use hex_literal::hex;
    ///
    /// let com = DataGroupFile::decode(&hex!("60145F0104303130365F36063034303030305C026175"))?;
    /// assert_eq!(com.group(), DataGroup::Com);
    /// assert_eq!(com.com().map(|com| com.data_groups()), Some(vec![DataGroup::Dg1, DataGroup::Dg2]));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        Registry::standard().decode(bytes)
    }

    #[must_use]
    pub fn group(&self) -> DataGroup {
        self.group
    }

    #[must_use]
    pub fn content(&self) -> &DataGroupContent {
        &self.content
    }

    /// Mutable access to the content. Drops the retained source bytes.
    pub fn content_mut(&mut self) -> &mut DataGroupContent {
        self.source = None;
        &mut self.content
    }

    #[must_use]
    pub fn into_content(self) -> DataGroupContent {
        self.content
    }

    /// The bytes the file was decoded from, if unmodified.
    #[must_use]
    pub fn source(&self) -> Option<&[u8]> {
        self.source.as_deref()
    }

    /// The encoded file: the source bytes when unmodified, otherwise
    /// re-encoded from the typed content.
    ///
    /// # Errors
    ///
    /// * `EncodingError` if the content can not be encoded.
    pub fn encoded(&self) -> Result<Cow<'_, [u8]>, EncodingError> {
        match self.source {
            Some(ref source) => Ok(Cow::Borrowed(source)),
            None => Registry::standard().encode(self).map(Cow::Owned),
        }
    }

    #[must_use]
    pub fn com(&self) -> Option<&ComInfo> {
        match self.content {
            DataGroupContent::Com(ref com) => Some(com),
            _ => None,
        }
    }

    #[must_use]
    pub fn mrz(&self) -> Option<&MrzInfo> {
        match self.content {
            DataGroupContent::Dg1(ref mrz) => Some(mrz),
            _ => None,
        }
    }

    #[must_use]
    pub fn face_infos(&self) -> Option<&FaceInfos> {
        match self.content {
            DataGroupContent::Dg2(ref faces) => Some(faces),
            _ => None,
        }
    }

    /// Details of EF.DG11 or EF.DG12.
    #[must_use]
    pub fn additional_details(&self) -> Option<&AdditionalDetails> {
        match self.content {
            DataGroupContent::Dg11(ref details) | DataGroupContent::Dg12(ref details) => {
                Some(details)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn security_infos(&self) -> Option<&SecurityInfos> {
        match self.content {
            DataGroupContent::Dg14(ref infos) => Some(infos),
            _ => None,
        }
    }

    /// Active Authentication public key of EF.DG15.
    #[must_use]
    pub fn public_key(&self) -> Option<&SubjectPublicKeyInfo> {
        match self.content {
            DataGroupContent::Dg15(ref key) => Some(key),
            _ => None,
        }
    }
}

/// Returns the single child of `children`, checking its tag.
pub(crate) fn single_child(children: &[TlvNode], tag: u32) -> Result<&TlvNode, EncodingError> {
    match children {
        [child] if child.tag() == tag => Ok(child),
        [child] => Err(EncodingError::UnexpectedTag {
            expected: tag,
            found: child.tag(),
        }),
        _ => {
            error!("Expected a single {tag:X} object, found {} objects", children.len());
            Err(EncodingError::InvalidContent("expected exactly one object"))
        }
    }
}
