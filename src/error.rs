//! Error taxonomy.
//!
//! Failures a card (or an attacker sitting between the terminal and the card)
//! can provoke are returned as values of these types. The session layer
//! inspects them to decide whether the secure channel has to be torn down.

use thiserror::Error;

use crate::apdu::StatusWord;

/// Errors raised while decoding or encoding BER-TLV data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EncodingError {
    #[error("TLV data is truncated, needed {needed} bytes but only {available} remain")]
    TruncatedData { needed: usize, available: usize },
    #[error("TLV length field does not fit in the platform word size")]
    LengthOverflow,
    #[error("indefinite length TLV encoding is not supported")]
    IndefiniteLengthUnsupported,
    #[error("TLV nesting exceeds the maximum depth of {0}")]
    RecursionLimitExceeded(usize),
    #[error("invalid BER tag: {0:#X}")]
    InvalidTag(u32),
    #[error("BER tag is longer than four bytes")]
    TagTooLong,
    #[error("{0} unexpected bytes after the TLV object")]
    TrailingData(usize),
    #[error("unexpected TLV tag, expected {expected:#X}, found {found:#X}")]
    UnexpectedTag { expected: u32, found: u32 },
    #[error("invalid TLV content: {0}")]
    InvalidContent(&'static str),
}

/// Non-success status words, ISO/IEC 7816-4 Section 5.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CardError {
    #[error("{0} response bytes still available")]
    BytesRemaining(u8),
    #[error("end of file reached before reading Ne bytes")]
    EndOfFile,
    #[error("wrong length")]
    WrongLength,
    #[error("secure messaging not supported")]
    SecureMessagingNotSupported,
    #[error("security status not satisfied")]
    SecurityStatusNotSatisfied,
    #[error("authentication method blocked")]
    AuthenticationMethodBlocked,
    #[error("reference data not usable")]
    ReferenceDataNotUsable,
    #[error("conditions of use not satisfied")]
    ConditionsNotSatisfied,
    #[error("command not allowed, no current EF")]
    NoCurrentEf,
    #[error("expected secure messaging data objects missing")]
    SecureMessagingObjectsMissing,
    #[error("incorrect secure messaging data objects")]
    IncorrectSecureMessagingObjects,
    #[error("incorrect parameters in the command data field")]
    WrongData,
    #[error("function not supported")]
    FunctionNotSupported,
    #[error("file or application not found")]
    FileNotFound,
    #[error("record not found")]
    RecordNotFound,
    #[error("incorrect parameters P1-P2")]
    IncorrectP1P2,
    #[error("referenced data not found")]
    ReferencedDataNotFound,
    #[error("wrong parameters P1-P2, offset outside of the EF")]
    WrongP1P2,
    #[error("wrong Le field, {0} bytes available")]
    WrongLe(u8),
    #[error("instruction not supported")]
    InstructionNotSupported,
    #[error("class not supported")]
    ClassNotSupported,
    #[error("no precise diagnosis")]
    NoPreciseDiagnosis,
    #[error("card returned status word {0:04X}")]
    Other(u16),
}

impl From<StatusWord> for CardError {
    fn from(sw: StatusWord) -> Self {
        let [sw1, sw2] = sw.to_bytes();
        match (sw1, sw2) {
            (0x61, n) => Self::BytesRemaining(n),
            (0x62, 0x82) => Self::EndOfFile,
            (0x67, 0x00) => Self::WrongLength,
            (0x68, 0x82) => Self::SecureMessagingNotSupported,
            (0x69, 0x82) => Self::SecurityStatusNotSatisfied,
            (0x69, 0x83) => Self::AuthenticationMethodBlocked,
            (0x69, 0x84) => Self::ReferenceDataNotUsable,
            (0x69, 0x85) => Self::ConditionsNotSatisfied,
            (0x69, 0x86) => Self::NoCurrentEf,
            (0x69, 0x87) => Self::SecureMessagingObjectsMissing,
            (0x69, 0x88) => Self::IncorrectSecureMessagingObjects,
            (0x6A, 0x80) => Self::WrongData,
            (0x6A, 0x81) => Self::FunctionNotSupported,
            (0x6A, 0x82) => Self::FileNotFound,
            (0x6A, 0x83) => Self::RecordNotFound,
            (0x6A, 0x86) => Self::IncorrectP1P2,
            (0x6A, 0x88) => Self::ReferencedDataNotFound,
            (0x6B, 0x00) => Self::WrongP1P2,
            (0x6C, n) => Self::WrongLe(n),
            (0x6D, 0x00) => Self::InstructionNotSupported,
            (0x6E, 0x00) => Self::ClassNotSupported,
            (0x6F, 0x00) => Self::NoPreciseDiagnosis,
            _ => Self::Other(sw.to_u16()),
        }
    }
}

/// Failures of the access control and secure messaging protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("unexpected status word: {0}")]
    UnexpectedStatusWord(CardError),
    #[error("mutual authentication with the chip failed")]
    AuthenticationFailed,
    #[error("secure messaging MAC verification failed")]
    MacVerificationFailed,
    #[error("send sequence counter is out of sync")]
    SequenceCounterDesync,
    #[error("operation requires an authenticated session")]
    NotAuthenticated,
    #[error("the eMRTD application has not been selected")]
    ApplicationNotSelected,
    #[error("malformed secure messaging response: {0}")]
    MalformedSecureResponse(&'static str),
    #[error("invalid ISO/IEC 9797-1 padding in decrypted data")]
    PaddingError,
}

impl ProtocolError {
    /// Whether the error means the secure channel can no longer be trusted.
    #[must_use]
    pub fn is_secure_messaging_error(&self) -> bool {
        matches!(
            self,
            Self::MacVerificationFailed
                | Self::SequenceCounterDesync
                | Self::MalformedSecureResponse(_)
                | Self::PaddingError
        )
    }
}

/// Failures of the transport below the APDU layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("card channel is disconnected")]
    Disconnected,
    #[error("card did not answer within the timeout")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[cfg(feature = "pcsc")]
    #[error(transparent)]
    Pcsc(pcsc::Error),
}

/// Errors in MRZ input or content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MrzError {
    #[error("MRZ can not contain the character: {0}")]
    InvalidCharacter(char),
    #[error("MRZ field {0} is invalid: {1}")]
    InvalidField(&'static str, String),
    #[error("MRZ of {0} characters does not match the TD1, TD2 or TD3 layout")]
    UnknownLayout(usize),
    #[error("check digit of {field} is wrong, expected {expected}, found {found}")]
    CheckDigitMismatch {
        field: &'static str,
        expected: char,
        found: char,
    },
}

/// Crate-level error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EmrtdError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Mrz(#[from] MrzError),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("hash calculation failed: {0}")]
    CalculateHashError(&'static str),
}

impl From<CardError> for EmrtdError {
    fn from(err: CardError) -> Self {
        Self::Protocol(ProtocolError::UnexpectedStatusWord(err))
    }
}

impl EmrtdError {
    /// The card error carried by an unexpected status word, if any.
    #[must_use]
    pub fn card_error(&self) -> Option<CardError> {
        match self {
            Self::Protocol(ProtocolError::UnexpectedStatusWord(err)) => Some(*err),
            _ => None,
        }
    }
}
