//! EF.DG15: Active Authentication public key, a single `SubjectPublicKeyInfo`.

use super::dg14::SubjectPublicKeyInfo;
use super::{single_child, Codec, DataGroupContent};
use crate::error::EncodingError;
use crate::tlv::TlvNode;

const SEQUENCE_TAG: u32 = 0x30;

pub(super) const CODEC: Codec = Codec {
    decode: decode_content,
    encode: encode_content,
};

fn decode_content(children: &[TlvNode]) -> Result<DataGroupContent, EncodingError> {
    let key = single_child(children, SEQUENCE_TAG)?;
    SubjectPublicKeyInfo::new(key.clone()).map(DataGroupContent::Dg15)
}

fn encode_content(content: &DataGroupContent) -> Result<Vec<TlvNode>, EncodingError> {
    match content {
        DataGroupContent::Dg15(key) => Ok(vec![key.as_tlv().clone()]),
        _ => Err(EncodingError::InvalidContent("content is not EF.DG15")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lds::{DataGroup, DataGroupFile, Registry};
    use crate::tlv;
    use hex_literal::hex;

    // rsaEncryption with a toy 64-bit modulus and exponent 65537
    const DG15: [u8; 40] = hex!(
        "6F26 3024
         300D 06092A864886F70D010101 0500
         0313 00 3010 0209 00C5A1E3F0B2D49E77 0203 010001"
    );

    #[test]
    fn test_decode_dg15() -> Result<(), EncodingError> {
        let file = DataGroupFile::decode(&DG15)?;
        assert_eq!(file.group(), DataGroup::Dg15);
        let key = file
            .public_key()
            .ok_or(EncodingError::InvalidContent("not DG15"))?;
        assert_eq!(
            key.algorithm().map(|oid| oid.to_string()).as_deref(),
            Some("1.2.840.113549.1.1.1")
        );
        assert_eq!(Registry::standard().encode(&file)?, DG15);

        let rebuilt = DataGroupFile::new(DataGroup::Dg15, DataGroupContent::Dg15(key.clone()));
        assert_eq!(rebuilt.encoded()?.as_ref(), DG15);
        Ok(())
    }

    #[test]
    fn test_invalid_dg15() -> Result<(), EncodingError> {
        // OCTET STRING instead of a SEQUENCE
        assert_eq!(
            DataGroupFile::decode(&hex!("6F03 040100")),
            Err(EncodingError::UnexpectedTag {
                expected: SEQUENCE_TAG,
                found: 0x04
            })
        );
        // SEQUENCE without an AlgorithmIdentifier
        assert_eq!(
            DataGroupFile::decode(&hex!("6F05 3003 020101")),
            Err(EncodingError::InvalidContent("invalid SubjectPublicKeyInfo"))
        );
        let two_keys = tlv::decode(&hex!("6F04 3000 3000"))?;
        assert_eq!(
            decode_content(two_keys.children()),
            Err(EncodingError::InvalidContent("expected exactly one object"))
        );
        Ok(())
    }
}
