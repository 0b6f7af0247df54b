//! Basic Access Control and secure messaging for eMRTDs.
//!
//! A library that reads an eMRTD (Electronic Machine Readable Travel Document)
//! as described in ICAO Doc 9303.
//!
//! The `emrtd_access` crate selects the eMRTD application, derives the
//! document access keys from the MRZ, runs Basic Access Control (BAC) and
//! reads the elementary files of the LDS under secure messaging, with 3DES
//! or AES session keys. Data groups are decoded with a strict BER-TLV codec
//! into typed values where the LDS defines them (EF.COM, EF.DG1, EF.DG2,
//! EF.DG11, EF.DG12, EF.DG14, EF.DG15) and kept as TLV trees otherwise.
//!
//! The transport is abstracted by [`CardChannel`]; enable the `pcsc`
//! feature for a PC/SC reader implementation.
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! Passive Authentication, Active Authentication, Chip Authentication, PACE
//! and EAC are **not** supported.
//!
//! # Quick Start
//!
//! ```
//! use emrtd_access::lds::DataGroup;
//! use emrtd_access::{AccessKeySeed, CardChannel, EmrtdError, PassportSession, SessionConfig};
//! use tracing::info;
//!
//! fn read_document<C: CardChannel>(channel: C) -> Result<Vec<u8>, EmrtdError> {
//!     let mut session = PassportSession::new(channel, SessionConfig::default());
//!
//!     // Select eMRTD application
//!     session.select_application()?;
//!
//!     let seed = AccessKeySeed::from_mrz("L898902C<", "690806", "940623")?;
//!     session.perform_bac(seed)?;
//!
//!     // Read EF.DG1
//!     let dg1 = session.read_data_group(DataGroup::Dg1)?;
//!     if let Some(mrz) = dg1.mrz() {
//!         info!("Document number: {}", mrz.document_number());
//!     }
//!
//!     // Read EF.DG2
//!     let dg2 = session.read_data_group(DataGroup::Dg2)?;
//!     session.close()?;
//!     let jpeg = match dg2.face_infos() {
//!         Some(faces) => faces.face_image()?.data.to_vec(),
//!         None => Vec::new(),
//!     };
//!     Ok(jpeg)
//! }
//! ```

#![forbid(unsafe_code)]

extern crate alloc;

pub mod apdu;
pub mod bac;
pub mod channel;
pub mod crypto;
pub mod error;
pub mod lds;
#[cfg(test)]
mod mock;
pub mod mrz;
pub mod secure_messaging;
pub mod session;
pub mod tlv;

pub use apdu::{CommandApdu, ResponseApdu, StatusWord};
pub use channel::CardChannel;
#[cfg(feature = "pcsc")]
pub use channel::PcscChannel;
pub use error::{CardError, ChannelError, EmrtdError, EncodingError, MrzError, ProtocolError};
pub use mrz::AccessKeySeed;
pub use session::{PassportSession, SessionConfig, SessionState};

/// Converts a byte slice to an uppercase hexadecimal string.
///
/// # Arguments
///
/// * `bytes` - A slice of bytes to be converted.
///
/// # Returns
///
/// A `String` containing the hexadecimal representation of the input bytes.
///
/// # Examples
///
/// ```
/// use emrtd_access::bytes2hex;
///
/// let bytes = [0x6A, 0x82, 0x00, 0xFF];
/// assert_eq!(bytes2hex(&bytes), "6A8200FF");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut acc, &byte| {
            acc.push_str(&format!("{byte:02X}"));
            acc
        })
}
