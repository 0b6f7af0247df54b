//! EF.DG1: the machine readable zone.
//!
//! The MRZ is kept as the exact string read from the chip and fields are
//! views into it, so re-encoding is byte-identical whatever the content.

use core::fmt;
use core::ops::Range;

use tracing::error;

use super::{single_child, Codec, DataGroupContent};
use crate::error::{EmrtdError, EncodingError, MrzError};
use crate::mrz::{self, AccessKeySeed, MRZ_ALPHABET};
use crate::tlv::TlvNode;

const MRZ_TAG: u32 = 0x5F1F;

pub(super) const CODEC: Codec = Codec {
    decode: decode_content,
    encode: encode_content,
};

fn decode_content(children: &[TlvNode]) -> Result<DataGroupContent, EncodingError> {
    let mrz = single_child(children, MRZ_TAG)?
        .primitive_value()
        .ok_or(EncodingError::InvalidContent("MRZ object is constructed"))?;
    let mrz = core::str::from_utf8(mrz)
        .map_err(|_| EncodingError::InvalidContent("MRZ is not ASCII"))?;
    MrzInfo::parse(mrz)
        .map(DataGroupContent::Dg1)
        .map_err(|_| EncodingError::InvalidContent("MRZ does not match a known layout"))
}

fn encode_content(content: &DataGroupContent) -> Result<Vec<TlvNode>, EncodingError> {
    match content {
        DataGroupContent::Dg1(mrz) => Ok(vec![TlvNode::primitive(MRZ_TAG, mrz.as_str())]),
        _ => Err(EncodingError::InvalidContent("content is not EF.DG1")),
    }
}

/// MRZ size formats, ICAO Doc 9303-4, 9303-5 and 9303-6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MrzLayout {
    /// Three lines of 30 characters.
    Td1,
    /// Two lines of 36 characters.
    Td2,
    /// Two lines of 44 characters, passport booklets.
    Td3,
}

impl MrzLayout {
    #[must_use]
    pub const fn line_len(self) -> usize {
        match self {
            Self::Td1 => 30,
            Self::Td2 => 36,
            Self::Td3 => 44,
        }
    }

    #[must_use]
    pub const fn line_count(self) -> usize {
        match self {
            Self::Td1 => 3,
            Self::Td2 | Self::Td3 => 2,
        }
    }

    fn from_len(len: usize) -> Option<Self> {
        [Self::Td1, Self::Td2, Self::Td3]
            .into_iter()
            .find(|layout| layout.line_len() * layout.line_count() == len)
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    DocumentCode,
    IssuingState,
    Name,
    DocumentNumber,
    DocumentNumberCheck,
    Nationality,
    DateOfBirth,
    DateOfBirthCheck,
    Sex,
    DateOfExpiry,
    DateOfExpiryCheck,
    OptionalData,
    OptionalDataCheck,
    OptionalData2,
    CompositeCheck,
}

/// Parsed machine readable zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrzInfo {
    layout: MrzLayout,
    mrz: String,
}

impl MrzInfo {
    /// Parses an MRZ given as its lines concatenated, or separated by newlines.
    ///
    /// Only layout and character set are checked here, see
    /// [`MrzInfo::verify_check_digits`].
    ///
    /// # Errors
    ///
    /// * `MrzError::UnknownLayout` if the length matches no layout.
    /// * `MrzError::InvalidCharacter` for characters outside the MRZ alphabet.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_access::EmrtdError;
    /// #
    /// # fn main() -> Result<(), EmrtdError> {
    /// use emrtd_access::lds::{MrzInfo, MrzLayout};
    ///
    /// let mrz = MrzInfo::parse(
    ///     "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
    ///      L898902C36UTO7408122F1204159ZE184226B<<<<<10",
    /// )?;
    /// assert_eq!(mrz.layout(), MrzLayout::Td3);
    /// assert_eq!(mrz.document_number(), "L898902C3");
    /// assert_eq!(mrz.primary_identifier(), "ERIKSSON");
    /// mrz.verify_check_digits()?;
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn parse(mrz: &str) -> Result<Self, MrzError> {
        let mrz: String = mrz
            .lines()
            .map(str::trim)
            .collect::<Vec<_>>()
            .concat();
        if let Some(c) = mrz.chars().find(|&c| !MRZ_ALPHABET.contains(c)) {
            error!("MRZ contains invalid character `{c}`");
            return Err(MrzError::InvalidCharacter(c));
        }
        let Some(layout) = MrzLayout::from_len(mrz.len()) else {
            error!("MRZ of {} characters matches no layout", mrz.len());
            return Err(MrzError::UnknownLayout(mrz.len()));
        };
        Ok(Self { layout, mrz })
    }

    #[must_use]
    pub fn layout(&self) -> MrzLayout {
        self.layout
    }

    /// The MRZ lines concatenated.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.mrz
    }

    /// The MRZ lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        let len = self.layout.line_len();
        (0..self.layout.line_count()).map(move |i| &self.mrz[i * len..(i + 1) * len])
    }

    fn range(&self, field: Field) -> Option<Range<usize>> {
        use Field as F;
        let range = match (self.layout, field) {
            (_, F::DocumentCode) => 0..2,
            (_, F::IssuingState) => 2..5,

            (MrzLayout::Td1, F::DocumentNumber) => 5..14,
            (MrzLayout::Td1, F::DocumentNumberCheck) => 14..15,
            (MrzLayout::Td1, F::OptionalData) => 15..30,
            (MrzLayout::Td1, F::DateOfBirth) => 30..36,
            (MrzLayout::Td1, F::DateOfBirthCheck) => 36..37,
            (MrzLayout::Td1, F::Sex) => 37..38,
            (MrzLayout::Td1, F::DateOfExpiry) => 38..44,
            (MrzLayout::Td1, F::DateOfExpiryCheck) => 44..45,
            (MrzLayout::Td1, F::Nationality) => 45..48,
            (MrzLayout::Td1, F::OptionalData2) => 48..59,
            (MrzLayout::Td1, F::CompositeCheck) => 59..60,
            (MrzLayout::Td1, F::Name) => 60..90,
            (MrzLayout::Td1, F::OptionalDataCheck) => return None,

            (MrzLayout::Td2, F::Name) => 5..36,
            (MrzLayout::Td3, F::Name) => 5..44,
            (MrzLayout::Td2 | MrzLayout::Td3, _) => {
                let l2 = self.layout.line_len();
                match field {
                    F::DocumentNumber => l2..l2 + 9,
                    F::DocumentNumberCheck => l2 + 9..l2 + 10,
                    F::Nationality => l2 + 10..l2 + 13,
                    F::DateOfBirth => l2 + 13..l2 + 19,
                    F::DateOfBirthCheck => l2 + 19..l2 + 20,
                    F::Sex => l2 + 20..l2 + 21,
                    F::DateOfExpiry => l2 + 21..l2 + 27,
                    F::DateOfExpiryCheck => l2 + 27..l2 + 28,
                    F::OptionalData if self.layout == MrzLayout::Td3 => l2 + 28..l2 + 42,
                    F::OptionalDataCheck if self.layout == MrzLayout::Td3 => l2 + 42..l2 + 43,
                    F::OptionalData => l2 + 28..l2 + 35,
                    F::CompositeCheck => 2 * l2 - 1..2 * l2,
                    _ => return None,
                }
            }
        };
        Some(range)
    }

    fn field(&self, field: Field) -> &str {
        self.range(field).map_or("", |range| &self.mrz[range])
    }

    fn check(&self, field: Field) -> char {
        self.field(field).chars().next().unwrap_or('<')
    }

    /// Document code with fillers removed, e.g. `P` or `ID`.
    #[must_use]
    pub fn document_code(&self) -> &str {
        trim_fillers(self.field(Field::DocumentCode))
    }

    #[must_use]
    pub fn issuing_state(&self) -> &str {
        trim_fillers(self.field(Field::IssuingState))
    }

    #[must_use]
    pub fn nationality(&self) -> &str {
        trim_fillers(self.field(Field::Nationality))
    }

    /// Name field as printed, fillers included.
    #[must_use]
    pub fn name(&self) -> &str {
        self.field(Field::Name)
    }

    /// Primary identifier (surname), `<` replaced by spaces.
    #[must_use]
    pub fn primary_identifier(&self) -> String {
        let name = self.name();
        let primary = name.split_once("<<").map_or(name, |(primary, _)| primary);
        trim_fillers(primary).replace('<', " ")
    }

    /// Secondary identifiers (given names), `<` replaced by spaces.
    #[must_use]
    pub fn secondary_identifier(&self) -> String {
        self.name()
            .split_once("<<")
            .map(|(_, secondary)| trim_fillers(secondary).replace('<', " "))
            .unwrap_or_default()
    }

    /// Document number and its check digit. TD1 numbers longer than nine
    /// characters continue in the optional data, ICAO Doc 9303-5 Section 4.2.2.
    fn document_number_with_check(&self) -> (String, char) {
        let number = self.field(Field::DocumentNumber);
        let check = self.check(Field::DocumentNumberCheck);
        if self.layout == MrzLayout::Td1 && check == '<' {
            let extension = self
                .field(Field::OptionalData)
                .split('<')
                .next()
                .unwrap_or_default();
            if let Some((last, rest)) = extension
                .char_indices()
                .last()
                .map(|(i, last)| (last, &extension[..i]))
            {
                return (format!("{number}{rest}"), last);
            }
        }
        (trim_fillers(number).to_owned(), check)
    }

    /// Document number with fillers removed.
    #[must_use]
    pub fn document_number(&self) -> String {
        self.document_number_with_check().0
    }

    /// Date of birth, `YYMMDD`.
    #[must_use]
    pub fn date_of_birth(&self) -> &str {
        self.field(Field::DateOfBirth)
    }

    /// Sex, `M`, `F` or `<` for unspecified.
    #[must_use]
    pub fn sex(&self) -> char {
        self.check(Field::Sex)
    }

    /// Date of expiry, `YYMMDD`.
    #[must_use]
    pub fn date_of_expiry(&self) -> &str {
        self.field(Field::DateOfExpiry)
    }

    /// Personal number (TD3) or optional data of line 1 (TD1) or 2 (TD2).
    #[must_use]
    pub fn optional_data(&self) -> &str {
        self.field(Field::OptionalData)
    }

    /// Optional data of line 2, TD1 only.
    #[must_use]
    pub fn optional_data2(&self) -> Option<&str> {
        self.range(Field::OptionalData2).map(|range| &self.mrz[range])
    }

    /// Verifies every check digit, composite included.
    ///
    /// # Errors
    ///
    /// * `MrzError::CheckDigitMismatch` naming the first failing field.
    pub fn verify_check_digits(&self) -> Result<(), MrzError> {
        let (number, check) = self.document_number_with_check();
        mrz::verify_check_digit("Document number", &number, check)?;
        mrz::verify_check_digit(
            "Birth date",
            self.date_of_birth(),
            self.check(Field::DateOfBirthCheck),
        )?;
        mrz::verify_check_digit(
            "Expiry date",
            self.date_of_expiry(),
            self.check(Field::DateOfExpiryCheck),
        )?;
        if self.range(Field::OptionalDataCheck).is_some() {
            mrz::verify_check_digit(
                "Personal number",
                self.optional_data(),
                self.check(Field::OptionalDataCheck),
            )?;
        }

        let l2 = self.layout.line_len();
        let composite = match self.layout {
            MrzLayout::Td1 => [5..30, 30..37, 38..45, 48..59]
                .into_iter()
                .map(|range| &self.mrz[range])
                .collect::<String>(),
            MrzLayout::Td2 | MrzLayout::Td3 => {
                [l2..l2 + 10, l2 + 13..l2 + 20, l2 + 21..2 * l2 - 1]
                    .into_iter()
                    .map(|range| &self.mrz[range])
                    .collect::<String>()
            }
        };
        mrz::verify_check_digit("Composite", &composite, self.check(Field::CompositeCheck))
    }

    /// MRZ information for BAC key derivation.
    ///
    /// # Errors
    ///
    /// * `MrzError` if a field is not usable.
    pub fn mrz_information(&self) -> Result<String, MrzError> {
        mrz::other_mrz(
            &self.document_number(),
            self.date_of_birth(),
            self.date_of_expiry(),
        )
    }

    /// BAC keys derived from this MRZ.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if a field is not usable or hashing fails.
    pub fn access_key_seed(&self) -> Result<AccessKeySeed, EmrtdError> {
        AccessKeySeed::from_mrz_information(&self.mrz_information()?)
    }
}

impl fmt::Display for MrzInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(line)?;
        }
        Ok(())
    }
}

fn trim_fillers(value: &str) -> &str {
    value.trim_matches('<')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lds::{DataGroup, DataGroupFile, Registry};
    use crate::tlv;

    // Specimens of ICAO Doc 9303-4 Appendix A, 9303-5 Appendix A and 9303-6 Appendix A
    const TD3: &str = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\
                       L898902C36UTO7408122F1204159ZE184226B<<<<<10";
    const TD2: &str = "I<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<\
                       D231458907UTO7408122F1204159<<<<<<<6";
    const TD1: &str = "I<UTOD231458907<<<<<<<<<<<<<<<\
                       7408122F1204159UTO<<<<<<<<<<<6\
                       ERIKSSON<<ANNA<MARIA<<<<<<<<<<";
    const TD1_LONG_NUMBER: &str = "I<UTOD23145890<7349<<<<<<<<<<<\
                                   3407127M9507122UTO<<<<<<<<<<<2\
                                   STEVENSON<<PETER<JOHN<<<<<<<<<";

    #[test]
    fn test_td3() -> Result<(), MrzError> {
        let mrz = MrzInfo::parse(TD3)?;
        assert_eq!(mrz.layout(), MrzLayout::Td3);
        assert_eq!(mrz.document_code(), "P");
        assert_eq!(mrz.issuing_state(), "UTO");
        assert_eq!(mrz.primary_identifier(), "ERIKSSON");
        assert_eq!(mrz.secondary_identifier(), "ANNA MARIA");
        assert_eq!(mrz.document_number(), "L898902C3");
        assert_eq!(mrz.nationality(), "UTO");
        assert_eq!(mrz.date_of_birth(), "740812");
        assert_eq!(mrz.sex(), 'F');
        assert_eq!(mrz.date_of_expiry(), "120415");
        assert_eq!(mrz.optional_data(), "ZE184226B<<<<<");
        assert_eq!(mrz.optional_data2(), None);
        assert_eq!(mrz.mrz_information()?, "L898902C3674081221204159");
        mrz.verify_check_digits()?;
        assert_eq!(mrz.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn test_td2() -> Result<(), MrzError> {
        let mrz = MrzInfo::parse(TD2)?;
        assert_eq!(mrz.layout(), MrzLayout::Td2);
        assert_eq!(mrz.document_code(), "I");
        assert_eq!(mrz.document_number(), "D23145890");
        assert_eq!(mrz.optional_data(), "<<<<<<<");
        mrz.verify_check_digits()?;
        Ok(())
    }

    #[test]
    fn test_td1() -> Result<(), MrzError> {
        let mrz = MrzInfo::parse(TD1)?;
        assert_eq!(mrz.layout(), MrzLayout::Td1);
        assert_eq!(mrz.document_number(), "D23145890");
        assert_eq!(mrz.nationality(), "UTO");
        assert_eq!(mrz.date_of_expiry(), "120415");
        assert_eq!(mrz.optional_data2(), Some("<<<<<<<<<<<"));
        assert_eq!(mrz.primary_identifier(), "ERIKSSON");
        mrz.verify_check_digits()?;

        let long = MrzInfo::parse(TD1_LONG_NUMBER)?;
        assert_eq!(long.document_number(), "D23145890734");
        assert_eq!(long.secondary_identifier(), "PETER JOHN");
        long.verify_check_digits()?;
        // Appendix D.2 of ICAO Doc 9303-11
        assert_eq!(long.mrz_information()?, "D23145890734934071279507122");
        Ok(())
    }

    #[test]
    fn test_check_digit_mismatch() -> Result<(), MrzError> {
        let tampered = TD3.replace("7408122F", "7408132F");
        let mrz = MrzInfo::parse(&tampered)?;
        assert_eq!(
            mrz.verify_check_digits(),
            Err(MrzError::CheckDigitMismatch {
                field: "Birth date",
                expected: '3',
                found: '2'
            })
        );

        let composite = TD3.replace("<10", "<11");
        assert!(matches!(
            MrzInfo::parse(&composite)?.verify_check_digits(),
            Err(MrzError::CheckDigitMismatch {
                field: "Composite",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(MrzInfo::parse(&TD3[..87]), Err(MrzError::UnknownLayout(87)));
        assert_eq!(
            MrzInfo::parse(&TD3.replace('P', "p")),
            Err(MrzError::InvalidCharacter('p'))
        );
    }

    #[test]
    fn test_dg1_round_trip() -> Result<(), EncodingError> {
        let dg1 = TlvNode::constructed(0x61, vec![TlvNode::primitive(0x5F1F, TD3.as_bytes())])
            .encode()?;
        assert_eq!(dg1[..5], [0x61, 0x5B, 0x5F, 0x1F, 0x58]);
        let file = DataGroupFile::decode(&dg1)?;
        assert_eq!(file.group(), DataGroup::Dg1);
        assert_eq!(file.mrz().map(MrzInfo::document_number).as_deref(), Some("L898902C3"));
        assert_eq!(Registry::standard().encode(&file)?, dg1);

        let not_mrz = tlv::encode(0x5F1F, b"TOO SHORT")?;
        let mut bad = vec![0x61, u8::try_from(not_mrz.len()).unwrap_or(0)];
        bad.extend_from_slice(&not_mrz);
        assert!(DataGroupFile::decode(&bad).is_err());
        Ok(())
    }

    #[test]
    fn test_access_key_seed_from_dg1() -> Result<(), EmrtdError> {
        let mrz = MrzInfo::parse(
            "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\
             L898902C<3UTO6908061F9406236ZE184226B<<<<<14",
        )?;
        assert_eq!(mrz.mrz_information()?, "L898902C<369080619406236");
        let seed = mrz.access_key_seed()?;
        assert_eq!(format!("{seed:?}"), "AccessKeySeed { .. }");
        Ok(())
    }
}
