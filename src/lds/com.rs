//! EF.COM: LDS version, Unicode version and the list of present data groups.

use tracing::error;

use super::{Codec, DataGroup, DataGroupContent};
use crate::error::{EmrtdError, EncodingError};
use crate::tlv::TlvNode;

const LDS_VERSION_TAG: u32 = 0x5F01;
const UNICODE_VERSION_TAG: u32 = 0x5F36;
const TAG_LIST_TAG: u32 = 0x5C;

pub(super) const CODEC: Codec = Codec {
    decode: decode_content,
    encode: encode_content,
};

fn decode_content(children: &[TlvNode]) -> Result<DataGroupContent, EncodingError> {
    ComInfo::decode(children).map(DataGroupContent::Com)
}

fn encode_content(content: &DataGroupContent) -> Result<Vec<TlvNode>, EncodingError> {
    match content {
        DataGroupContent::Com(com) => Ok(com.encode()),
        _ => Err(EncodingError::InvalidContent("content is not EF.COM")),
    }
}

/// Content of EF.COM, ICAO Doc 9303-10 Section 4.6.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComInfo {
    lds_version: String,
    unicode_version: String,
    tag_list: Vec<u8>,
}

fn digits(value: &[u8], len: usize, what: &'static str) -> Result<String, EncodingError> {
    if value.len() != len || !value.iter().all(u8::is_ascii_digit) {
        error!("EF.COM {what} must be {len} digits");
        return Err(EncodingError::InvalidContent(what));
    }
    // ASCII digits only
    Ok(value.iter().copied().map(char::from).collect())
}

impl ComInfo {
    /// Builds EF.COM content.
    ///
    /// `lds_version` is `aabb` for LDS version aa.bb, `unicode_version` is
    /// `aabbcc` for Unicode version aa.bb.cc.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::InvalidArgument` if a version is not all digits of the right length.
    pub fn new(
        lds_version: &str,
        unicode_version: &str,
        data_groups: &[DataGroup],
    ) -> Result<Self, EmrtdError> {
        let lds_version = digits(lds_version.as_bytes(), 4, "LDS version")
            .map_err(|_| EmrtdError::InvalidArgument("LDS version must be 4 digits"))?;
        let unicode_version = digits(unicode_version.as_bytes(), 6, "Unicode version")
            .map_err(|_| EmrtdError::InvalidArgument("Unicode version must be 6 digits"))?;
        let mut com = Self {
            lds_version,
            unicode_version,
            tag_list: Vec::new(),
        };
        com.set_data_groups(data_groups);
        Ok(com)
    }

    pub(super) fn decode(children: &[TlvNode]) -> Result<Self, EncodingError> {
        let [lds, unicode, tags] = children else {
            error!("EF.COM has {} objects, expected 3", children.len());
            return Err(EncodingError::InvalidContent("EF.COM must hold three objects"));
        };
        let value = |node: &TlvNode, tag: u32| match node.primitive_value() {
            Some(value) if node.tag() == tag => Ok(value.to_vec()),
            _ => Err(EncodingError::UnexpectedTag {
                expected: tag,
                found: node.tag(),
            }),
        };
        Ok(Self {
            lds_version: digits(&value(lds, LDS_VERSION_TAG)?, 4, "LDS version")?,
            unicode_version: digits(&value(unicode, UNICODE_VERSION_TAG)?, 6, "Unicode version")?,
            tag_list: value(tags, TAG_LIST_TAG)?,
        })
    }

    pub(super) fn encode(&self) -> Vec<TlvNode> {
        vec![
            TlvNode::primitive(LDS_VERSION_TAG, self.lds_version.as_bytes()),
            TlvNode::primitive(UNICODE_VERSION_TAG, self.unicode_version.as_bytes()),
            TlvNode::primitive(TAG_LIST_TAG, self.tag_list.clone()),
        ]
    }

    /// LDS version as four digits, e.g. `0107`.
    #[must_use]
    pub fn lds_version(&self) -> &str {
        &self.lds_version
    }

    /// Unicode version as six digits, e.g. `040000`.
    #[must_use]
    pub fn unicode_version(&self) -> &str {
        &self.unicode_version
    }

    /// Raw data group tags as listed on the chip.
    #[must_use]
    pub fn tag_list(&self) -> &[u8] {
        &self.tag_list
    }

    /// Data groups present on the chip. Unknown tags are skipped.
    #[must_use]
    pub fn data_groups(&self) -> Vec<DataGroup> {
        self.tag_list
            .iter()
            .filter_map(|&tag| DataGroup::from_tag(u32::from(tag)))
            .collect()
    }

    /// Replaces the tag list.
    pub fn set_data_groups(&mut self, data_groups: &[DataGroup]) {
        // every data group tag fits in one byte
        self.tag_list = data_groups
            .iter()
            .filter_map(|group| u8::try_from(group.tag()).ok())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lds::DataGroupFile;
    use hex_literal::hex;

    // Appendix D.4 of ICAO Doc 9303-11
    const EF_COM: [u8; 22] = hex!("60145F0104303130365F36063034303030305C026175");

    #[test]
    fn test_decode_com() -> Result<(), EncodingError> {
        let file = DataGroupFile::decode(&EF_COM)?;
        let com = file.com().ok_or(EncodingError::InvalidContent("not EF.COM"))?;
        assert_eq!(com.lds_version(), "0106");
        assert_eq!(com.unicode_version(), "040000");
        assert_eq!(com.tag_list(), hex!("6175"));
        assert_eq!(com.data_groups(), vec![DataGroup::Dg1, DataGroup::Dg2]);
        Ok(())
    }

    #[test]
    fn test_encode_com() -> Result<(), EmrtdError> {
        let com = ComInfo::new("0106", "040000", &[DataGroup::Dg1, DataGroup::Dg2])?;
        let file = DataGroupFile::new(DataGroup::Com, DataGroupContent::Com(com));
        assert_eq!(file.encoded()?.as_ref(), EF_COM);
        Ok(())
    }

    #[test]
    fn test_invalid_com() {
        assert!(ComInfo::new("106", "040000", &[]).is_err());
        assert!(ComInfo::new("0106", "04000A", &[]).is_err());
        // versions swapped
        assert_eq!(
            DataGroupFile::decode(&hex!("60145F3604303130365F01063034303030305C026175")),
            Err(EncodingError::UnexpectedTag {
                expected: 0x5F01,
                found: 0x5F36
            })
        );
        assert!(DataGroupFile::decode(&hex!("600E5F0104303130365C026175 5F0100")).is_err());
    }
}
