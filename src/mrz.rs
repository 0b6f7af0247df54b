//! MRZ check digits and derivation of the BAC access keys.

use core::fmt;

use tracing::error;
use zeroize::Zeroizing;

use crate::crypto::{self, CipherSuite, KeyType, SecretKey};
use crate::error::{EmrtdError, MrzError};

/// Characters allowed in an MRZ.
pub const MRZ_ALPHABET: &str = "0123456789<ABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn char_value(c: char) -> Option<u32> {
    match c {
        '0'..='9' => c.to_digit(10),
        '<' => Some(0),
        'A'..='Z' => Some(u32::from(c) - u32::from('A') + 10),
        _ => None,
    }
}

/// Calculates the check digit for the given data using a specific algorithm.
/// Calculation is explained at ICAO Doc 9303-3 Section 4.9:
/// <https://www.icao.int/publications/Documents/9303_p3_cons_en.pdf>
///
/// # Errors
///
/// * `MrzError::InvalidCharacter` if `data` holds a character outside the MRZ alphabet.
///
/// # Example
///
/// ```
/// # use emrtd_access::EmrtdError;
/// #
/// # fn main() -> Result<(), EmrtdError> {
/// use emrtd_access::mrz::calculate_check_digit;
/// assert_eq!(calculate_check_digit("520727")?, '3');
/// #
/// #     Ok(())
/// # }
/// ```
pub fn calculate_check_digit(data: &str) -> Result<char, MrzError> {
    const WEIGHTS: [u32; 3] = [7, 3, 1];
    let mut total = 0;

    for (counter, c) in data.chars().enumerate() {
        let Some(value) = char_value(c) else {
            error!("Can not calculate check digit for invalid character: `{c}`");
            return Err(MrzError::InvalidCharacter(c));
        };
        total += WEIGHTS[counter % 3] * value;
    }

    Ok(char::from_digit(total % 10, 10).unwrap_or('0'))
}

/// Checks that `check` is the check digit of `data`.
///
/// A filler `<` is accepted as the check digit of an all filler field, ICAO
/// Doc 9303-3 Section 4.9.
///
/// # Errors
///
/// * `MrzError` if the character set is invalid or the digits differ.
pub fn verify_check_digit(field: &'static str, data: &str, check: char) -> Result<(), MrzError> {
    let expected = calculate_check_digit(data)?;
    if check == expected || (check == '<' && data.chars().all(|c| c == '<')) {
        return Ok(());
    }
    error!("Check digit of {field} is wrong, expected {expected}, found {check}");
    Err(MrzError::CheckDigitMismatch {
        field,
        expected,
        found: check,
    })
}

fn validate_field(field: &'static str, value: &str, valid_len: bool) -> Result<(), MrzError> {
    if !valid_len || value.chars().any(|c| !MRZ_ALPHABET.contains(c)) {
        error!("MRZ field {field} has an invalid length or illegal characters, received {value}");
        return Err(MrzError::InvalidField(field, value.to_owned()));
    }
    Ok(())
}

/// Builds the MRZ information used for BAC key derivation: document number,
/// date of birth and date of expiry, each followed by its check digit.
///
/// ICAO Doc 9303-11 Section 4.3.2. Document numbers shorter than nine
/// characters are padded with `<`.
///
/// # Errors
///
/// * `MrzError::InvalidField` if a field length is invalid or it contains illegal characters.
///
/// # Example
///
/// ```
/// # use emrtd_access::EmrtdError;
/// #
/// # fn main() -> Result<(), EmrtdError> {
/// use emrtd_access::mrz::other_mrz;
/// let result = other_mrz("L898902C3", "740812", "120415")?;
/// assert_eq!(result, String::from("L898902C3674081221204159"));
/// #
/// #     Ok(())
/// # }
/// ```
pub fn other_mrz(doc_no: &str, birthdate: &str, expirydate: &str) -> Result<String, MrzError> {
    // Document numbers are up to 9 characters on TD3, 14 on TD2 and 22 on TD1 (ICAO Doc 9303-4..6)
    validate_field("Document number", doc_no, doc_no.len() <= 22)?;
    validate_field("Birth date", birthdate, birthdate.len() == 6)?;
    validate_field("Expiry date", expirydate, expirydate.len() == 6)?;

    let doc_no = format!("{doc_no:<<9}");
    Ok(format!(
        "{}{}{}{}{}{}",
        doc_no,
        calculate_check_digit(&doc_no)?,
        birthdate,
        calculate_check_digit(birthdate)?,
        expirydate,
        calculate_check_digit(expirydate)?
    ))
}

/// The BAC bootstrap keys `K.Enc` and `K.MAC`.
///
/// Consumed by value when a handshake starts, so one seed authenticates at
/// most one session. The keys are wiped on drop.
pub struct AccessKeySeed {
    k_enc: SecretKey,
    k_mac: SecretKey,
}

impl AccessKeySeed {
    /// Uses already derived 3DES keys.
    #[must_use]
    pub fn new(k_enc: [u8; 16], k_mac: [u8; 16]) -> Self {
        let k_enc = Zeroizing::new(k_enc);
        let k_mac = Zeroizing::new(k_mac);
        Self {
            k_enc: Zeroizing::new(k_enc.to_vec()),
            k_mac: Zeroizing::new(k_mac.to_vec()),
        }
    }

    /// Derives the keys from an MRZ information string as built by [`other_mrz`].
    ///
    /// `Kseed` is the first 16 bytes of its SHA-1, `K.Enc` and `K.MAC` are
    /// derived from `Kseed` with the KDF counters 1 and 2.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if the hash calculation fails.
    pub fn from_mrz_information(mrz_information: &str) -> Result<Self, EmrtdError> {
        let hash = crypto::sha1(mrz_information.as_bytes())?;
        let key_seed = &hash[..16];
        Ok(Self {
            k_enc: crypto::compute_key(key_seed, KeyType::Encryption, CipherSuite::Des3)?,
            k_mac: crypto::compute_key(key_seed, KeyType::Mac, CipherSuite::Des3)?,
        })
    }

    /// Derives the keys from the document number, date of birth and date of
    /// expiry (both `YYMMDD`).
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if a field is invalid or the hash calculation fails.
    pub fn from_mrz(doc_no: &str, birthdate: &str, expirydate: &str) -> Result<Self, EmrtdError> {
        Self::from_mrz_information(&other_mrz(doc_no, birthdate, expirydate)?)
    }

    pub(crate) fn k_enc(&self) -> &[u8] {
        &self.k_enc
    }

    pub(crate) fn k_mac(&self) -> &[u8] {
        &self.k_mac
    }
}

impl fmt::Debug for AccessKeySeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKeySeed").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_calculate_check_digit_valid_data() -> Result<(), MrzError> {
        // Examples taken from https://www.icao.int/publications/Documents/9303_p3_cons_en.pdf Appendix A
        assert_eq!(calculate_check_digit("520727")?, '3');
        assert_eq!(calculate_check_digit("AB2134<<<")?, '5');
        assert_eq!(
            calculate_check_digit("HA672242<658022549601086<<<<<<<<<<<<<<0")?,
            '8'
        );
        assert_eq!(
            calculate_check_digit("D231458907<<<<<<<<<<<<<<<34071279507122<<<<<<<<<<<")?,
            '2'
        );
        assert_eq!(calculate_check_digit("")?, '0');
        assert_eq!(calculate_check_digit("1")?, '7');
        Ok(())
    }

    #[test]
    fn test_calculate_check_digit_invalid_character() {
        assert_eq!(
            calculate_check_digit("ABC*123"),
            Err(MrzError::InvalidCharacter('*'))
        );
        assert_eq!(
            calculate_check_digit("abc"),
            Err(MrzError::InvalidCharacter('a'))
        );
    }

    #[test]
    fn test_verify_check_digit() {
        assert_eq!(verify_check_digit("Birth date", "520727", '3'), Ok(()));
        assert_eq!(verify_check_digit("Optional data", "<<<<<<", '<'), Ok(()));
        assert_eq!(
            verify_check_digit("Birth date", "520727", '4'),
            Err(MrzError::CheckDigitMismatch {
                field: "Birth date",
                expected: '3',
                found: '4'
            })
        );
    }

    #[test]
    fn test_other_mrz_valid_input() -> Result<(), MrzError> {
        // Example taken from https://www.icao.int/publications/Documents/9303_p4_cons_en.pdf Appendix B
        assert_eq!(
            other_mrz("L898902C3", "740812", "120415")?,
            "L898902C3674081221204159"
        );

        // Examples taken from https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf Appendix D.2
        assert_eq!(
            other_mrz("D23145890734", "340712", "950712")?,
            "D23145890734934071279507122"
        );
        assert_eq!(
            other_mrz("L898902C<", "690806", "940623")?,
            "L898902C<369080619406236"
        );
        assert_eq!(
            other_mrz("L898902C", "690806", "940623")?,
            "L898902C<369080619406236"
        );

        // Example taken from https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf Appendix G
        assert_eq!(
            other_mrz("T22000129", "640812", "101031")?,
            "T22000129364081251010318"
        );
        Ok(())
    }

    #[test]
    fn test_other_mrz_invalid_input() {
        assert!(matches!(
            other_mrz("L898902C300000000000000", "740812", "120415"),
            Err(MrzError::InvalidField("Document number", _))
        ));
        assert!(matches!(
            other_mrz("L898902C3", "7408121", "120415"),
            Err(MrzError::InvalidField("Birth date", _))
        ));
        assert!(matches!(
            other_mrz("L898902C3", "740812", "12041"),
            Err(MrzError::InvalidField("Expiry date", _))
        ));
        assert!(matches!(
            other_mrz("l898902c3", "740812", "120415"),
            Err(MrzError::InvalidField("Document number", _))
        ));
    }

    #[test]
    fn test_access_key_seed_from_mrz() -> Result<(), EmrtdError> {
        // Example taken from https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf Appendix D.2
        let seed = AccessKeySeed::from_mrz("L898902C<", "690806", "940623")?;
        assert_eq!(seed.k_enc(), hex!("AB94FDECF2674FDFB9B391F85D7F76F2"));
        assert_eq!(seed.k_mac(), hex!("7962D9ECE03D1ACD4C76089DCE131543"));
        assert_eq!(format!("{seed:?}"), "AccessKeySeed { .. }");
        Ok(())
    }
}
