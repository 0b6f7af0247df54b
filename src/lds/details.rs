//! EF.DG11 additional personal details and EF.DG12 additional document details.
//!
//! ICAO Doc 9303-10 Sections 4.7.11 and 4.7.12. Both files start with a tag
//! list (`5C`) naming the data elements present, followed by one object per
//! listed tag. Repeated elements, the other names of DG11 and the other
//! persons of DG12, are grouped in an `A0` template with a count.

use core::str;

use tracing::error;

use super::{Codec, DataGroupContent};
use crate::error::EncodingError;
use crate::tlv::{self, TlvNode};

const TAG_LIST_TAG: u32 = 0x5C;
const REPEATED_TAG: u32 = 0xA0;
const COUNT_TAG: u32 = 0x02;

pub const FULL_NAME_TAG: u32 = 0x5F0E;
pub const OTHER_NAME_TAG: u32 = 0x5F0F;
pub const PERSONAL_NUMBER_TAG: u32 = 0x5F10;
/// CCYYMMDD
pub const FULL_DATE_OF_BIRTH_TAG: u32 = 0x5F2B;
pub const PLACE_OF_BIRTH_TAG: u32 = 0x5F11;
pub const PERMANENT_ADDRESS_TAG: u32 = 0x5F42;
pub const TELEPHONE_TAG: u32 = 0x5F12;
pub const PROFESSION_TAG: u32 = 0x5F13;
pub const TITLE_TAG: u32 = 0x5F14;
pub const PERSONAL_SUMMARY_TAG: u32 = 0x5F15;
pub const PROOF_OF_CITIZENSHIP_TAG: u32 = 0x5F16;
pub const OTHER_TD_NUMBERS_TAG: u32 = 0x5F17;
pub const CUSTODY_INFORMATION_TAG: u32 = 0x5F18;

pub const ISSUING_AUTHORITY_TAG: u32 = 0x5F19;
/// CCYYMMDD
pub const DATE_OF_ISSUE_TAG: u32 = 0x5F26;
pub const OTHER_PERSON_TAG: u32 = 0x5F1A;
pub const ENDORSEMENTS_TAG: u32 = 0x5F1B;
pub const TAX_OR_EXIT_REQUIREMENTS_TAG: u32 = 0x5F1C;
pub const IMAGE_OF_FRONT_TAG: u32 = 0x5F1D;
pub const IMAGE_OF_REAR_TAG: u32 = 0x5F1E;
/// CCYYMMDDhhmmss
pub const PERSONALIZATION_TIME_TAG: u32 = 0x5F55;
pub const PERSONALIZATION_DEVICE_TAG: u32 = 0x5F56;

pub(super) const DG11_CODEC: Codec = Codec {
    decode: decode_dg11,
    encode: encode_dg11,
};

pub(super) const DG12_CODEC: Codec = Codec {
    decode: decode_dg12,
    encode: encode_dg12,
};

fn decode_dg11(children: &[TlvNode]) -> Result<DataGroupContent, EncodingError> {
    AdditionalDetails::decode(children).map(DataGroupContent::Dg11)
}

fn encode_dg11(content: &DataGroupContent) -> Result<Vec<TlvNode>, EncodingError> {
    match content {
        DataGroupContent::Dg11(details) => Ok(details.encode()),
        _ => Err(EncodingError::InvalidContent("content is not EF.DG11")),
    }
}

fn decode_dg12(children: &[TlvNode]) -> Result<DataGroupContent, EncodingError> {
    AdditionalDetails::decode(children).map(DataGroupContent::Dg12)
}

fn encode_dg12(content: &DataGroupContent) -> Result<Vec<TlvNode>, EncodingError> {
    match content {
        DataGroupContent::Dg12(details) => Ok(details.encode()),
        _ => Err(EncodingError::InvalidContent("content is not EF.DG12")),
    }
}

/// The tag a field stands for in the tag list.
fn listed_tag(field: &TlvNode) -> Result<u32, EncodingError> {
    if field.tag() != REPEATED_TAG {
        return Ok(field.tag());
    }
    let Some((count, items)) = field.children().split_first() else {
        error!("Repeated data element template is empty");
        return Err(EncodingError::InvalidContent("empty repeated data element template"));
    };
    if count.tag() != COUNT_TAG {
        return Err(EncodingError::UnexpectedTag {
            expected: COUNT_TAG,
            found: count.tag(),
        });
    }
    match count.primitive_value() {
        Some(&[n]) if usize::from(n) == items.len() => {}
        _ => {
            error!("Repeated data element count does not match {} items", items.len());
            return Err(EncodingError::InvalidContent("repeated data element count mismatch"));
        }
    }
    match items.first() {
        Some(first) if items.iter().all(|item| item.tag() == first.tag()) => Ok(first.tag()),
        Some(_) => Err(EncodingError::InvalidContent("mixed repeated data elements")),
        None => Err(EncodingError::InvalidContent("empty repeated data element template")),
    }
}

fn parse_tag_list(mut data: &[u8]) -> Result<Vec<u32>, EncodingError> {
    let mut tags = Vec::new();
    while !data.is_empty() {
        let (tag, len) = tlv::read_tag(data)?;
        tags.push(tag);
        data = &data[len..];
    }
    Ok(tags)
}

/// Content of EF.DG11 or EF.DG12: the tag list and one field per listed tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalDetails {
    tag_list: TlvNode,
    tags: Vec<u32>,
    fields: Vec<TlvNode>,
}

impl AdditionalDetails {
    /// Builds the content from fields, listing their tags in order.
    ///
    /// # Errors
    ///
    /// * `EncodingError` if a repeated data element template is malformed.
    pub fn new(fields: Vec<TlvNode>) -> Result<Self, EncodingError> {
        let tags = fields.iter().map(listed_tag).collect::<Result<Vec<_>, _>>()?;
        let mut list = Vec::with_capacity(2 * tags.len());
        for &tag in &tags {
            list.extend(tlv::encode_tag(tag)?);
        }
        Ok(Self {
            tag_list: TlvNode::primitive(TAG_LIST_TAG, list),
            tags,
            fields,
        })
    }

    /// Decodes the children of the DG11 or DG12 root object.
    ///
    /// # Errors
    ///
    /// * `EncodingError` if the tag list is missing or does not name the fields.
    pub fn decode(children: &[TlvNode]) -> Result<Self, EncodingError> {
        let Some((tag_list, fields)) = children.split_first() else {
            error!("Tag list is missing");
            return Err(EncodingError::InvalidContent("missing tag list"));
        };
        if tag_list.tag() != TAG_LIST_TAG {
            return Err(EncodingError::UnexpectedTag {
                expected: TAG_LIST_TAG,
                found: tag_list.tag(),
            });
        }
        let Some(list) = tag_list.primitive_value() else {
            return Err(EncodingError::InvalidContent("tag list is constructed"));
        };
        let tags = parse_tag_list(list)?;
        if tags.len() != fields.len() {
            error!(
                "Tag list names {} data elements, found {}",
                tags.len(),
                fields.len()
            );
            return Err(EncodingError::InvalidContent("tag list does not match the data elements"));
        }
        for field in fields {
            let tag = listed_tag(field)?;
            if !tags.contains(&tag) {
                error!("Data element {tag:X} is not in the tag list");
                return Err(EncodingError::InvalidContent("data element not in the tag list"));
            }
        }
        Ok(Self {
            tag_list: tag_list.clone(),
            tags,
            fields: fields.to_vec(),
        })
    }

    /// Encodes the children of the DG11 or DG12 root object.
    #[must_use]
    pub fn encode(&self) -> Vec<TlvNode> {
        let mut children = Vec::with_capacity(1 + self.fields.len());
        children.push(self.tag_list.clone());
        children.extend(self.fields.iter().cloned());
        children
    }

    /// Tags of the data elements present.
    #[must_use]
    pub fn tag_list(&self) -> &[u32] {
        &self.tags
    }

    #[must_use]
    pub fn fields(&self) -> &[TlvNode] {
        &self.fields
    }

    /// Values of every data element with `tag`, repeated ones included.
    #[must_use]
    pub fn values(&self, tag: u32) -> Vec<&[u8]> {
        self.fields
            .iter()
            .flat_map(|field| match field.tag() {
                REPEATED_TAG => field.children().get(1..).unwrap_or_default(),
                _ => core::slice::from_ref(field),
            })
            .filter(|node| node.tag() == tag)
            .filter_map(TlvNode::primitive_value)
            .collect()
    }

    /// Value of the first data element with `tag`.
    #[must_use]
    pub fn value(&self, tag: u32) -> Option<&[u8]> {
        self.values(tag).into_iter().next()
    }

    /// The first data element with `tag` as UTF-8 text.
    #[must_use]
    pub fn text(&self, tag: u32) -> Option<&str> {
        str::from_utf8(self.value(tag)?).ok()
    }

    /// Name of the holder, primary and secondary identifiers separated by `<<`.
    #[must_use]
    pub fn full_name(&self) -> Option<&str> {
        self.text(FULL_NAME_TAG)
    }

    #[must_use]
    pub fn other_names(&self) -> Vec<&str> {
        self.texts(OTHER_NAME_TAG)
    }

    #[must_use]
    pub fn personal_number(&self) -> Option<&str> {
        self.text(PERSONAL_NUMBER_TAG)
    }

    #[must_use]
    pub fn full_date_of_birth(&self) -> Option<&str> {
        self.text(FULL_DATE_OF_BIRTH_TAG)
    }

    #[must_use]
    pub fn place_of_birth(&self) -> Option<&str> {
        self.text(PLACE_OF_BIRTH_TAG)
    }

    #[must_use]
    pub fn issuing_authority(&self) -> Option<&str> {
        self.text(ISSUING_AUTHORITY_TAG)
    }

    #[must_use]
    pub fn date_of_issue(&self) -> Option<&str> {
        self.text(DATE_OF_ISSUE_TAG)
    }

    #[must_use]
    pub fn other_persons(&self) -> Vec<&str> {
        self.texts(OTHER_PERSON_TAG)
    }

    fn texts(&self, tag: u32) -> Vec<&str> {
        self.values(tag)
            .into_iter()
            .filter_map(|value| str::from_utf8(value).ok())
            .collect()
    }
}
