//! ISO/IEC 7816-4 command and response APDUs.
//!
//! Commands use short framing (one byte Lc and Le) while the data is at most
//! 255 bytes and Ne at most 256, extended framing otherwise.

use core::fmt;

use tracing::error;

use crate::error::{CardError, EmrtdError, EncodingError};
use crate::tlv;

/// Largest Ne expressible with extended framing.
pub const MAX_NE: usize = 65536;
/// Largest Nc expressible with extended framing.
pub const MAX_NC: usize = 65535;

/// The AID of the eMRTD application, ICAO 9303-10 Section 3.6.
pub const EMRTD_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Instruction bytes used by this crate.
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const GET_CHALLENGE: u8 = 0x84;
    pub const EXTERNAL_AUTHENTICATE: u8 = 0x82;
    pub const READ_BINARY: u8 = 0xB0;
    /// READ BINARY with the offset in a data object, for offsets above 0x7FFF.
    pub const READ_BINARY_ODD: u8 = 0xB1;
}

/// Two byte status word trailing every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(u16);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x9000);

    #[must_use]
    pub const fn new(sw: u16) -> Self {
        Self(sw)
    }

    #[must_use]
    pub const fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0x9000
    }

    /// Maps the status word to a [`CardError`] unless it is `9000`.
    ///
    /// # Errors
    ///
    /// * `CardError` for every status word other than `9000`.
    pub fn check(self) -> Result<(), CardError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(CardError::from(self))
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// A command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    /// Class byte of the APDU
    cla: u8,
    /// Instruction byte of the APDU
    ins: u8,
    /// Parameter 1 byte of the APDU
    p1: u8,
    /// Parameter 2 byte of the APDU
    p2: u8,
    /// Command data field, Nc is its length
    data: Vec<u8>,
    /// Maximum number of response data bytes expected
    ne: Option<usize>,
}

impl CommandApdu {
    /// Constructs a new command APDU.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::InvalidArgument` if the data is longer than 65535
    ///   bytes or `ne` is zero or above 65536.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_access::EmrtdError;
    /// #
    /// # fn main() -> Result<(), EmrtdError> {
    /// use emrtd_access::apdu::CommandApdu;
    /// use hex_literal::hex;
    ///
    /// let apdu = CommandApdu::new(0x00, 0x84, 0x00, 0x00, Vec::new(), Some(8))?;
    /// assert_eq!(apdu.header(), hex!("00840000"));
    /// assert_eq!(apdu.to_bytes(), hex!("0084000008"));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn new(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        data: impl Into<Vec<u8>>,
        ne: Option<usize>,
    ) -> Result<Self, EmrtdError> {
        let data = data.into();
        if data.len() > MAX_NC {
            error!("Command data of {} bytes can not be framed", data.len());
            return Err(EmrtdError::InvalidArgument("command data longer than 65535 bytes"));
        }
        if matches!(ne, Some(0)) || ne.is_some_and(|ne| ne > MAX_NE) {
            error!("Ne {ne:?} can not be framed");
            return Err(EmrtdError::InvalidArgument("Ne must be between 1 and 65536"));
        }
        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            data,
            ne,
        })
    }

    /// SELECT of the eMRTD application by its AID, no response data.
    #[must_use]
    pub fn select_emrtd_application() -> Self {
        Self::fixed(0x00, ins::SELECT, 0x04, 0x0C, EMRTD_AID.to_vec(), None)
    }

    /// SELECT of an elementary file by its file identifier, no response data.
    #[must_use]
    pub fn select_ef(fid: u16) -> Self {
        Self::fixed(0x00, ins::SELECT, 0x02, 0x0C, fid.to_be_bytes().to_vec(), None)
    }

    /// GET CHALLENGE for an 8 byte nonce.
    #[must_use]
    pub fn get_challenge() -> Self {
        Self::fixed(0x00, ins::GET_CHALLENGE, 0x00, 0x00, Vec::new(), Some(8))
    }

    /// EXTERNAL AUTHENTICATE carrying `E.IFD || M.IFD`, expecting `E.ICC || M.ICC`.
    #[must_use]
    pub fn external_authenticate(cryptogram: [u8; 40]) -> Self {
        Self::fixed(
            0x00,
            ins::EXTERNAL_AUTHENTICATE,
            0x00,
            0x00,
            cryptogram.to_vec(),
            Some(40),
        )
    }

    /// READ BINARY of `ne` bytes at `offset` of the current EF.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::InvalidArgument` if `offset` does not fit in 15 bits
    ///   or `ne` is out of range.
    pub fn read_binary(offset: u16, ne: usize) -> Result<Self, EmrtdError> {
        if offset > 0x7FFF {
            error!("READ BINARY offset {offset:#X} needs the odd instruction");
            return Err(EmrtdError::InvalidArgument("READ BINARY offset above 0x7FFF"));
        }
        let [p1, p2] = offset.to_be_bytes();
        Self::new(0x00, ins::READ_BINARY, p1, p2, Vec::new(), Some(ne))
    }

    /// READ BINARY with odd instruction, offset carried in DO'54.
    ///
    /// The response data is wrapped in DO'53, so Ne is raised by the size of
    /// that header (capped at 256).
    ///
    /// # Errors
    ///
    /// * `EmrtdError::InvalidArgument` if `ne` is out of range.
    pub fn read_binary_odd(offset: u32, ne: usize) -> Result<Self, EmrtdError> {
        let ne = match ne {
            1..=127 => ne + 2,
            128..=255 => ne + 3,
            _ => ne,
        };
        let offset = offset.to_be_bytes();
        let skip = offset.iter().take(3).take_while(|&&b| b == 0).count();
        let data = tlv::encode(0x54, &offset[skip..])?;
        Self::new(0x00, ins::READ_BINARY_ODD, 0x00, 0x00, data, Some(ne.min(256)))
    }

    fn fixed(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>, ne: Option<usize>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            ne,
        }
    }

    #[must_use]
    pub fn cla(&self) -> u8 {
        self.cla
    }

    #[must_use]
    pub fn ins(&self) -> u8 {
        self.ins
    }

    #[must_use]
    pub fn p1(&self) -> u8 {
        self.p1
    }

    #[must_use]
    pub fn p2(&self) -> u8 {
        self.p2
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn ne(&self) -> Option<usize> {
        self.ne
    }

    /// Retrieves the command header, `CLA INS P1 P2`.
    #[must_use]
    pub fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Whether the command needs extended length framing.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.data.len() > 255 || self.ne.is_some_and(|ne| ne > 256)
    }

    /// Serialises the command.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        out.extend_from_slice(&self.header());
        let extended = self.is_extended();
        // Nc <= 65535 and Ne <= 65536 hold from construction
        let [_, _, nc_hi, nc_lo] = u32::try_from(self.data.len())
            .unwrap_or(0)
            .to_be_bytes();
        if !self.data.is_empty() {
            if extended {
                out.extend_from_slice(&[0x00, nc_hi, nc_lo]);
            } else {
                out.push(nc_lo);
            }
            out.extend_from_slice(&self.data);
        }
        if let Some(ne) = self.ne {
            // 256 and 65536 are encoded as zero
            let [_, _, ne_hi, ne_lo] = u32::try_from(ne).unwrap_or(0).to_be_bytes();
            if extended {
                if self.data.is_empty() {
                    out.push(0x00);
                }
                out.extend_from_slice(&[ne_hi, ne_lo]);
            } else {
                out.push(ne_lo);
            }
        }
        out
    }
}

/// A response APDU: data followed by the status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    data: Vec<u8>,
    status: StatusWord,
}

impl ResponseApdu {
    #[must_use]
    pub fn new(data: Vec<u8>, status: StatusWord) -> Self {
        Self { data, status }
    }

    /// Splits raw response bytes into data and status word.
    ///
    /// # Errors
    ///
    /// * `EncodingError::TruncatedData` if fewer than two bytes are given.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_access::EmrtdError;
    /// #
    /// # fn main() -> Result<(), EmrtdError> {
    /// use emrtd_access::apdu::ResponseApdu;
    /// use hex_literal::hex;
    ///
    /// let rapdu = ResponseApdu::from_bytes(&hex!("4608F91988702212 9000"))?;
    /// assert!(rapdu.status().is_success());
    /// assert_eq!(rapdu.data(), hex!("4608F91988702212"));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() < 2 {
            error!("Response APDU of {} bytes has no status word", bytes.len());
            return Err(EncodingError::TruncatedData {
                needed: 2,
                available: bytes.len(),
            });
        }
        let (data, sw) = bytes.split_at(bytes.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            status: StatusWord::from_bytes(sw[0], sw[1]),
        })
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn status(&self) -> StatusWord {
        self.status
    }

    /// Response data if the status word is `9000`.
    ///
    /// # Errors
    ///
    /// * `CardError` mapped from any other status word.
    pub fn into_data(self) -> Result<Vec<u8>, CardError> {
        self.status.check()?;
        Ok(self.data)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.extend_from_slice(&self.status.to_bytes());
        out
    }
}
