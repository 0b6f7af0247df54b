//! EF.DG2: encoded face.
//!
//! ICAO Doc 9303-10 Section 4.7.2. The file holds one Biometric Information
//! Template group (`7F61`) with a count followed by that many Biometric
//! Information Templates (`7F60`). Each template has a Biometric Header
//! Template (`A1`) and a Biometric Data Block, plain (`5F2E`) or enciphered
//! (`7F2E`). A plain block is an ISO/IEC 19794-5 facial record.

use tracing::error;

use super::{single_child, Codec, DataGroupContent};
use crate::error::EncodingError;
use crate::tlv::TlvNode;

const GROUP_TAG: u32 = 0x7F61;
const COUNT_TAG: u32 = 0x02;
const TEMPLATE_TAG: u32 = 0x7F60;
const HEADER_TAG: u32 = 0xA1;
const DATA_BLOCK_TAG: u32 = 0x5F2E;
const ENCIPHERED_DATA_BLOCK_TAG: u32 = 0x7F2E;
const FORMAT_OWNER_TAG: u32 = 0x87;
const FORMAT_TYPE_TAG: u32 = 0x88;

/// `FAC\0` followed by version `010\0`.
const FACIAL_RECORD_HEADER: [u8; 8] = *b"FAC\x00010\x00";
const FACIAL_RECORD_HEADER_LEN: usize = 14;
const FACIAL_INFORMATION_LEN: usize = 20;
const FEATURE_POINT_LEN: usize = 8;
const IMAGE_INFORMATION_LEN: usize = 12;

pub(super) const CODEC: Codec = Codec {
    decode: decode_content,
    encode: encode_content,
};

fn decode_content(children: &[TlvNode]) -> Result<DataGroupContent, EncodingError> {
    FaceInfos::decode(children).map(DataGroupContent::Dg2)
}

fn encode_content(content: &DataGroupContent) -> Result<Vec<TlvNode>, EncodingError> {
    match content {
        DataGroupContent::Dg2(faces) => faces.encode(),
        _ => Err(EncodingError::InvalidContent("content is not EF.DG2")),
    }
}

/// Compression of a face image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDataType {
    Jpeg,
    Jpeg2000,
    Other(u8),
}

impl From<u8> for ImageDataType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Jpeg,
            1 => Self::Jpeg2000,
            other => Self::Other(other),
        }
    }
}

/// The first image of a facial record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceImage<'a> {
    pub data_type: ImageDataType,
    pub width: u16,
    pub height: u16,
    /// The JPEG or JPEG 2000 stream.
    pub data: &'a [u8],
}

fn slice(data: &[u8], start: usize, len: usize) -> Result<&[u8], EncodingError> {
    start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| {
            error!(
                "Facial record ends at {} bytes, needed {}",
                data.len(),
                start.saturating_add(len)
            );
            EncodingError::TruncatedData {
                needed: start.saturating_add(len),
                available: data.len(),
            }
        })
}

fn be_u16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0, |acc, &b| (acc << 8) | u16::from(b))
}

fn be_u32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0, |acc, &b| (acc << 8) | u32::from(b))
}

/// Parses the first facial record of an ISO/IEC 19794-5 block.
///
/// # Errors
///
/// * `EncodingError` if the block is not a facial record or is truncated.
pub fn parse_face_image(block: &[u8]) -> Result<FaceImage<'_>, EncodingError> {
    let header = slice(block, 0, FACIAL_RECORD_HEADER_LEN)?;
    if header[..8] != FACIAL_RECORD_HEADER {
        error!("Biometric data block is not an ISO/IEC 19794-5 facial record");
        return Err(EncodingError::InvalidContent("not a facial record"));
    }
    let record_len = usize::try_from(be_u32(&header[8..12]))
        .map_err(|_| EncodingError::LengthOverflow)?;
    if record_len > block.len() {
        error!("Facial record length {record_len} exceeds the block of {} bytes", block.len());
        return Err(EncodingError::TruncatedData {
            needed: record_len,
            available: block.len(),
        });
    }
    if be_u16(&header[12..14]) == 0 {
        error!("Facial record holds no face image");
        return Err(EncodingError::InvalidContent("facial record holds no image"));
    }

    let block = &block[..record_len];
    let face_len = usize::try_from(be_u32(slice(block, FACIAL_RECORD_HEADER_LEN, 4)?))
        .map_err(|_| EncodingError::LengthOverflow)?;
    let face = slice(block, FACIAL_RECORD_HEADER_LEN, face_len)?;
    let feature_points = usize::from(be_u16(slice(face, 4, 2)?));
    let image_information = FACIAL_INFORMATION_LEN + feature_points * FEATURE_POINT_LEN;
    let info = slice(face, image_information, IMAGE_INFORMATION_LEN)?;
    Ok(FaceImage {
        data_type: ImageDataType::from(info[1]),
        width: be_u16(&info[2..4]),
        height: be_u16(&info[4..6]),
        data: &face[image_information + IMAGE_INFORMATION_LEN..],
    })
}

/// A Biometric Information Template, kept as its TLV tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiometricTemplate(TlvNode);

impl BiometricTemplate {
    /// A template with a plain biometric data block.
    ///
    /// # Errors
    ///
    /// * `EncodingError::UnexpectedTag` if `header` is not a Biometric Header Template.
    pub fn new(header: TlvNode, data_block: impl Into<Vec<u8>>) -> Result<Self, EncodingError> {
        Self::from_tlv(TlvNode::constructed(
            TEMPLATE_TAG,
            vec![header, TlvNode::primitive(DATA_BLOCK_TAG, data_block)],
        ))
    }

    fn from_tlv(node: TlvNode) -> Result<Self, EncodingError> {
        if node.tag() != TEMPLATE_TAG {
            return Err(EncodingError::UnexpectedTag {
                expected: TEMPLATE_TAG,
                found: node.tag(),
            });
        }
        match node.children() {
            [header, data] if header.tag() == HEADER_TAG => {
                if data.tag() != DATA_BLOCK_TAG && data.tag() != ENCIPHERED_DATA_BLOCK_TAG {
                    error!("Biometric data block has tag {:X}", data.tag());
                    return Err(EncodingError::UnexpectedTag {
                        expected: DATA_BLOCK_TAG,
                        found: data.tag(),
                    });
                }
            }
            [header, _] => {
                return Err(EncodingError::UnexpectedTag {
                    expected: HEADER_TAG,
                    found: header.tag(),
                })
            }
            _ => {
                error!("Biometric Information Template must hold a header and a data block");
                return Err(EncodingError::InvalidContent("malformed biometric template"));
            }
        }
        Ok(Self(node))
    }

    /// The Biometric Header Template.
    #[must_use]
    pub fn header(&self) -> &TlvNode {
        &self.0.children()[0]
    }

    /// CBEFF format owner from the header, `0x0101` for ISO/IEC JTC 1/SC 37.
    #[must_use]
    pub fn format_owner(&self) -> Option<u16> {
        self.header_value(FORMAT_OWNER_TAG)
    }

    /// CBEFF format type from the header, `0x0008` for face images.
    #[must_use]
    pub fn format_type(&self) -> Option<u16> {
        self.header_value(FORMAT_TYPE_TAG)
    }

    fn header_value(&self, tag: u32) -> Option<u16> {
        match self.header().find_child(tag)?.primitive_value()? {
            &[hi, lo] => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_enciphered(&self) -> bool {
        self.0.children()[1].tag() == ENCIPHERED_DATA_BLOCK_TAG
    }

    /// The plain biometric data block, `None` when enciphered.
    #[must_use]
    pub fn data_block(&self) -> Option<&[u8]> {
        self.0.children()[1].primitive_value()
    }

    /// The face image of the data block.
    ///
    /// # Errors
    ///
    /// * `EncodingError::InvalidContent` if the data block is enciphered.
    /// * `EncodingError` if it is not a valid facial record.
    pub fn face_image(&self) -> Result<FaceImage<'_>, EncodingError> {
        let Some(block) = self.data_block() else {
            error!("Biometric data block is enciphered");
            return Err(EncodingError::InvalidContent("biometric data block is enciphered"));
        };
        parse_face_image(block)
    }

    #[must_use]
    pub fn as_tlv(&self) -> &TlvNode {
        &self.0
    }
}

/// Content of EF.DG2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceInfos {
    templates: Vec<BiometricTemplate>,
}

impl FaceInfos {
    #[must_use]
    pub fn new(templates: Vec<BiometricTemplate>) -> Self {
        Self { templates }
    }

    /// Decodes the children of the EF.DG2 root object.
    ///
    /// # Errors
    ///
    /// * `EncodingError` if the group template is malformed or its count
    ///   does not match the templates.
    pub fn decode(children: &[TlvNode]) -> Result<Self, EncodingError> {
        let group = single_child(children, GROUP_TAG)?;
        let Some((count, templates)) = group.children().split_first() else {
            error!("EF.DG2 Biometric Information Template group is empty");
            return Err(EncodingError::InvalidContent("empty biometric template group"));
        };
        if count.tag() != COUNT_TAG {
            return Err(EncodingError::UnexpectedTag {
                expected: COUNT_TAG,
                found: count.tag(),
            });
        }
        match count.primitive_value() {
            Some(&[n]) if usize::from(n) == templates.len() => {}
            _ => {
                error!(
                    "EF.DG2 template count does not match the {} templates",
                    templates.len()
                );
                return Err(EncodingError::InvalidContent("biometric template count mismatch"));
            }
        }
        let templates = templates
            .iter()
            .cloned()
            .map(BiometricTemplate::from_tlv)
            .collect::<Result<_, _>>()?;
        Ok(Self { templates })
    }

    /// Encodes the children of the EF.DG2 root object.
    ///
    /// # Errors
    ///
    /// * `EncodingError::InvalidContent` for more than 255 templates.
    pub fn encode(&self) -> Result<Vec<TlvNode>, EncodingError> {
        let count = u8::try_from(self.templates.len())
            .map_err(|_| EncodingError::InvalidContent("too many biometric templates"))?;
        let mut children = Vec::with_capacity(1 + self.templates.len());
        children.push(TlvNode::primitive(COUNT_TAG, vec![count]));
        children.extend(self.templates.iter().map(|template| template.0.clone()));
        Ok(vec![TlvNode::constructed(GROUP_TAG, children)])
    }

    #[must_use]
    pub fn templates(&self) -> &[BiometricTemplate] {
        &self.templates
    }

    /// The image of the first face.
    ///
    /// # Errors
    ///
    /// * `EncodingError::InvalidContent` if there is no template.
    /// * `EncodingError` if the first data block holds no readable face image.
    pub fn face_image(&self) -> Result<FaceImage<'_>, EncodingError> {
        let Some(first) = self.templates.first() else {
            error!("EF.DG2 holds no face");
            return Err(EncodingError::InvalidContent("no biometric template"));
        };
        first.face_image()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lds::{DataGroup, DataGroupFile, Registry};
    use crate::tlv;
    use hex_literal::hex;

    /// Biometric Header Template of a face: ICAO header version, type, format owner and type.
    pub(crate) fn face_header() -> TlvNode {
        TlvNode::constructed(
            HEADER_TAG,
            vec![
                TlvNode::primitive(0x80, hex!("0101")),
                TlvNode::primitive(0x81, hex!("02")),
                TlvNode::primitive(FORMAT_OWNER_TAG, hex!("0101")),
                TlvNode::primitive(FORMAT_TYPE_TAG, hex!("0008")),
            ],
        )
    }

    /// A facial record with one JPEG image and `feature_points` feature points.
    pub(crate) fn facial_record(image: &[u8], feature_points: u16) -> Vec<u8> {
        let face_len = 32 + 8 * usize::from(feature_points) + image.len();
        let record_len = FACIAL_RECORD_HEADER_LEN + face_len;
        let mut record = FACIAL_RECORD_HEADER.to_vec();
        record.extend_from_slice(&u32::try_from(record_len).unwrap_or(u32::MAX).to_be_bytes());
        record.extend_from_slice(&hex!("0001"));
        record.extend_from_slice(&u32::try_from(face_len).unwrap_or(u32::MAX).to_be_bytes());
        record.extend_from_slice(&feature_points.to_be_bytes());
        // gender, eye colour, hair colour, property mask, expression, pose angles and uncertainty
        record.extend_from_slice(&[0; 14]);
        for _ in 0..feature_points {
            record.extend_from_slice(&hex!("0101 0040 0050 0000"));
        }
        // full frontal JPEG, 240 x 320, sRGB
        record.extend_from_slice(&hex!("01 00 00F0 0140 01 02 0000 0000"));
        record.extend_from_slice(image);
        record
    }

    const JPEG: [u8; 8] = hex!("FFD8FFE000104A46");

    #[test]
    fn test_face_image() -> Result<(), EncodingError> {
        let block = facial_record(&JPEG, 0);
        let image = parse_face_image(&block)?;
        assert_eq!(image.data_type, ImageDataType::Jpeg);
        assert_eq!((image.width, image.height), (240, 320));
        assert_eq!(image.data, JPEG);

        // feature points sit between the facial information and the image information
        let block = facial_record(&JPEG, 2);
        assert_eq!(parse_face_image(&block)?.data, JPEG);
        Ok(())
    }

    #[test]
    fn test_face_image_invalid() {
        let block = facial_record(&JPEG, 0);
        assert_eq!(
            parse_face_image(&block[..10]),
            Err(EncodingError::TruncatedData {
                needed: 14,
                available: 10
            })
        );
        assert!(matches!(
            parse_face_image(&block[..block.len() - 1]),
            Err(EncodingError::TruncatedData { .. })
        ));
        let mut wrong_header = block.clone();
        wrong_header[0] = b'F' + 1;
        assert_eq!(
            parse_face_image(&wrong_header),
            Err(EncodingError::InvalidContent("not a facial record"))
        );
        let mut no_faces = block;
        no_faces[12..14].copy_from_slice(&[0, 0]);
        assert!(parse_face_image(&no_faces).is_err());
    }

    #[test]
    fn test_decode_dg2() -> Result<(), EncodingError> {
        let template = BiometricTemplate::new(face_header(), facial_record(&JPEG, 0))?;
        let faces = FaceInfos::new(vec![template]);
        let file = DataGroupFile::new(DataGroup::Dg2, DataGroupContent::Dg2(faces.clone()));
        let bytes = file.encoded()?.into_owned();
        assert_eq!(&bytes[..1], hex!("75"));

        let decoded = DataGroupFile::decode(&bytes)?;
        let Some(decoded_faces) = decoded.face_infos() else {
            panic!("EF.DG2 decoded as {:?}", decoded.content());
        };
        assert_eq!(decoded_faces, &faces);
        assert_eq!(decoded_faces.templates()[0].format_owner(), Some(0x0101));
        assert_eq!(decoded_faces.templates()[0].format_type(), Some(0x0008));
        assert_eq!(decoded_faces.face_image()?.data, JPEG);
        assert_eq!(Registry::standard().encode(&decoded)?, bytes);
        Ok(())
    }

    #[test]
    fn test_dg2_round_trip_keeps_length_forms() -> Result<(), EncodingError> {
        // 7F61 and 5F2E with non-minimal lengths
        let template = BiometricTemplate::new(face_header(), facial_record(&JPEG, 0))?;
        let header = template.header().encode()?;
        let block = facial_record(&JPEG, 0);
        let mut bit = hex!("7F60").to_vec();
        let mut content = header;
        content.extend_from_slice(&hex!("5F2E 8200"));
        content.push(u8::try_from(block.len()).unwrap_or(0));
        content.extend_from_slice(&block);
        bit.extend_from_slice(&tlv::encode_length(content.len()));
        bit.extend_from_slice(&content);
        let mut group = hex!("020101").to_vec();
        group.extend_from_slice(&bit);
        let mut dg2 = hex!("75").to_vec();
        let mut outer = hex!("7F61 8200").to_vec();
        outer.push(u8::try_from(group.len()).unwrap_or(0));
        outer.extend_from_slice(&group);
        dg2.extend_from_slice(&tlv::encode_length(outer.len()));
        dg2.extend_from_slice(&outer);

        let file = DataGroupFile::decode(&dg2)?;
        assert_eq!(file.encoded()?.as_ref(), dg2.as_slice());
        assert_eq!(tlv::decode(&dg2)?.encode()?, dg2);
        let image = file.face_infos().map(FaceInfos::face_image).transpose()?;
        assert_eq!(image.map(|image| image.data), Some(&JPEG[..]));
        Ok(())
    }

    #[test]
    fn test_enciphered_block() -> Result<(), EncodingError> {
        let children = vec![TlvNode::constructed(
            GROUP_TAG,
            vec![
                TlvNode::primitive(COUNT_TAG, vec![1]),
                TlvNode::constructed(
                    TEMPLATE_TAG,
                    vec![
                        face_header(),
                        TlvNode::constructed(
                            ENCIPHERED_DATA_BLOCK_TAG,
                            vec![TlvNode::primitive(0x80, hex!("0011223344"))],
                        ),
                    ],
                ),
            ],
        )];
        let faces = FaceInfos::decode(&children)?;
        assert!(faces.templates()[0].is_enciphered());
        assert_eq!(faces.templates()[0].data_block(), None);
        assert!(faces.face_image().is_err());
        assert_eq!(faces.encode()?, children);
        Ok(())
    }

    #[test]
    fn test_malformed_dg2() {
        let template = TlvNode::constructed(
            TEMPLATE_TAG,
            vec![face_header(), TlvNode::primitive(DATA_BLOCK_TAG, vec![0])],
        );
        // count says two, one template present
        let wrong_count = vec![TlvNode::constructed(
            GROUP_TAG,
            vec![TlvNode::primitive(COUNT_TAG, vec![2]), template.clone()],
        )];
        assert_eq!(
            FaceInfos::decode(&wrong_count),
            Err(EncodingError::InvalidContent("biometric template count mismatch"))
        );
        let missing_header = vec![TlvNode::constructed(
            GROUP_TAG,
            vec![
                TlvNode::primitive(COUNT_TAG, vec![1]),
                TlvNode::constructed(
                    TEMPLATE_TAG,
                    vec![TlvNode::primitive(DATA_BLOCK_TAG, vec![0])],
                ),
            ],
        )];
        assert!(FaceInfos::decode(&missing_header).is_err());
        assert_eq!(
            FaceInfos::decode(&[template]),
            Err(EncodingError::UnexpectedTag {
                expected: GROUP_TAG,
                found: TEMPLATE_TAG
            })
        );
        assert!(BiometricTemplate::new(TlvNode::constructed(0xA2, vec![]), vec![0]).is_err());
        assert!(FaceInfos::new(vec![]).face_image().is_err());
    }
}
