//! Secure messaging, ICAO Doc 9303-11 Section 9.8.
//!
//! Commands are protected encrypt-then-MAC: command data goes encrypted in
//! DO'87 (even INS) or DO'85 (odd INS), Ne in DO'97 and the MAC over the
//! padded send sequence counter, header and data objects in DO'8E.
//! Responses carry DO'87, the status word in DO'99 and DO'8E. The counter is
//! incremented once before each command is protected and once before each
//! response is verified.

use core::fmt;

use constant_time_eq::constant_time_eq;
use tracing::{error, trace};
use zeroize::{Zeroize, Zeroizing};

use crate::apdu::{CommandApdu, ResponseApdu, StatusWord, MAX_NE};
use crate::crypto::{self, CipherSuite, SecretKey, MAC_LEN};
use crate::error::{EmrtdError, ProtocolError};
use crate::tlv;

const SM_CLA: u8 = 0x0C;
const PADDING_INDICATOR: u8 = 0x01;

const DO85: u32 = 0x85;
const DO87: u32 = 0x87;
const DO8E: u32 = 0x8E;
const DO97: u32 = 0x97;
const DO99: u32 = 0x99;

/// Secure messaging keys and send sequence counter of an authenticated session.
///
/// Any integrity failure closes the channel: every later call fails with
/// `ProtocolError::NotAuthenticated`. Keys are wiped on drop.
pub struct SecureMessaging {
    suite: CipherSuite,
    ks_enc: SecretKey,
    ks_mac: SecretKey,
    ssc: u128,
    closed: bool,
}

/// Data objects of a response whose DO'8E has been verified.
struct MacVerified<'a>(&'a [u8]);

impl SecureMessaging {
    /// # Errors
    ///
    /// * `EmrtdError::InvalidArgument` if a key or the counter has the wrong length for `suite`.
    pub fn new(
        suite: CipherSuite,
        ks_enc: &[u8],
        ks_mac: &[u8],
        ssc: &[u8],
    ) -> Result<Self, EmrtdError> {
        if ks_enc.len() != suite.key_len() || ks_mac.len() != suite.key_len() {
            error!("Session keys must be {} bytes for {suite:?}", suite.key_len());
            return Err(EmrtdError::InvalidArgument("wrong session key length"));
        }
        if ssc.len() != suite.block_len() {
            error!("SSC must be {} bytes for {suite:?}, found {}", suite.block_len(), ssc.len());
            return Err(EmrtdError::InvalidArgument("wrong send sequence counter length"));
        }
        let mut bytes = [0; 16];
        bytes[16 - ssc.len()..].copy_from_slice(ssc);
        Ok(Self {
            suite,
            ks_enc: Zeroizing::new(ks_enc.to_vec()),
            ks_mac: Zeroizing::new(ks_mac.to_vec()),
            ssc: u128::from_be_bytes(bytes),
            closed: false,
        })
    }

    #[must_use]
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Current value of the send sequence counter.
    #[must_use]
    pub fn send_sequence_counter(&self) -> u128 {
        self.ssc
    }

    /// Whether the channel is still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.closed {
            error!("Secure messaging channel is closed");
            return Err(ProtocolError::NotAuthenticated);
        }
        Ok(())
    }

    fn increment_ssc(&mut self) -> Result<(), ProtocolError> {
        let max = match self.suite.block_len() {
            8 => u128::from(u64::MAX),
            _ => u128::MAX,
        };
        if self.ssc >= max {
            error!("Send sequence counter overflow");
            return Err(ProtocolError::SequenceCounterDesync);
        }
        self.ssc += 1;
        Ok(())
    }

    fn ssc_bytes(&self) -> Zeroizing<Vec<u8>> {
        let bytes = Zeroizing::new(self.ssc.to_be_bytes());
        Zeroizing::new(bytes[16 - self.suite.block_len()..].to_vec())
    }

    /// Protects a plain command.
    ///
    /// The protected command always expects a response, Ne is 256 or 65536
    /// when extended length is needed.
    ///
    /// # Errors
    ///
    /// * `ProtocolError::NotAuthenticated` if the channel is closed.
    /// * `ProtocolError::SequenceCounterDesync` if the counter overflows.
    /// * `EmrtdError::InvalidArgument` if the command is already protected or too long.
    pub fn protect(&mut self, command: &CommandApdu) -> Result<CommandApdu, EmrtdError> {
        self.ensure_open()?;
        if command.cla() & SM_CLA == SM_CLA {
            error!("Command {:02X?} is already protected", command.header());
            return Err(EmrtdError::InvalidArgument("command is already protected"));
        }
        let result = self.encrypt_command(command);
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    fn encrypt_command(&mut self, command: &CommandApdu) -> Result<CommandApdu, EmrtdError> {
        self.increment_ssc()?;
        let ssc = self.ssc_bytes();
        let block_len = self.suite.block_len();

        let mut header = command.header();
        header[0] |= SM_CLA;

        let mut objects = Vec::new();
        if !command.data().is_empty() {
            let iv = crypto::secure_messaging_iv(self.suite, &self.ks_enc, &ssc)?;
            let padded = Zeroizing::new(crypto::pad(command.data(), block_len));
            let encrypted = crypto::cbc_encrypt(self.suite, &self.ks_enc, &iv, &padded)?;
            if command.ins() % 2 == 0 {
                let mut value = Vec::with_capacity(encrypted.len() + 1);
                value.push(PADDING_INDICATOR);
                value.extend_from_slice(&encrypted);
                objects.extend(tlv::encode(DO87, &value)?);
            } else {
                objects.extend(tlv::encode(DO85, &encrypted)?);
            }
        }
        if let Some(ne) = command.ne() {
            objects.extend(tlv::encode(DO97, &encode_le(ne))?);
        }

        let mut n = Zeroizing::new(ssc.to_vec());
        n.extend_from_slice(&crypto::pad(&header, block_len));
        n.extend_from_slice(&objects);
        let cc = crypto::compute_mac(self.suite, &self.ks_mac, &crypto::pad(&n, block_len))?;
        objects.extend(tlv::encode(DO8E, &cc)?);

        let ne = if command.is_extended() || objects.len() > 255 {
            MAX_NE
        } else {
            256
        };
        let [cla, ins, p1, p2] = header;
        let protected = CommandApdu::new(cla, ins, p1, p2, objects, Some(ne))?;
        trace!("Protected APDU: {}", crate::bytes2hex(&protected.to_bytes()));
        Ok(protected)
    }

    /// Verifies and decrypts a protected response.
    ///
    /// An empty response means the chip left secure messaging and answered
    /// with a plain status word. The MAC is verified before any data object
    /// is parsed or decrypted.
    ///
    /// # Errors
    ///
    /// * `ProtocolError::UnexpectedStatusWord` if the chip answered in plain.
    /// * `ProtocolError::MacVerificationFailed` if DO'8E is missing or wrong.
    /// * `ProtocolError::MalformedSecureResponse` if the data objects are malformed.
    /// * `ProtocolError::PaddingError` if the decrypted data is not padded.
    ///
    /// The channel is closed after any of them.
    pub fn unprotect(&mut self, response: &ResponseApdu) -> Result<ResponseApdu, EmrtdError> {
        self.ensure_open()?;
        let result = self.open_response(response);
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    fn open_response(&mut self, response: &ResponseApdu) -> Result<ResponseApdu, EmrtdError> {
        trace!(
            "Protected R_APDU ({}): {}",
            response.status(),
            crate::bytes2hex(response.data())
        );
        if response.data().is_empty() {
            error!(
                "Chip answered a protected command with plain status {}",
                response.status()
            );
            return Err(match response.status().check() {
                Err(err) => ProtocolError::UnexpectedStatusWord(err),
                Ok(()) => ProtocolError::MalformedSecureResponse("no secure messaging data objects"),
            }
            .into());
        }

        self.increment_ssc()?;
        let verified = self.verify_mac(response.data())?;
        let (data, status) = self.decrypt(&verified)?;
        if status != response.status() {
            error!(
                "Protected status {status} does not match plain status {}",
                response.status()
            );
            return Err(ProtocolError::MalformedSecureResponse("status word mismatch").into());
        }
        Ok(ResponseApdu::new(data, status))
    }

    fn verify_mac<'a>(&self, data: &'a [u8]) -> Result<MacVerified<'a>, EmrtdError> {
        let Some(split) = data.len().checked_sub(2 + MAC_LEN) else {
            error!("Protected response of {} bytes has no DO'8E", data.len());
            return Err(ProtocolError::MacVerificationFailed.into());
        };
        let (objects, do8e) = data.split_at(split);
        let (do8e_header, mac) = do8e.split_at(2);
        if do8e_header != [0x8E, 0x08] {
            error!("Protected response does not end with DO'8E");
            return Err(ProtocolError::MacVerificationFailed.into());
        }

        let mut k = self.ssc_bytes();
        k.extend_from_slice(objects);
        let cc = crypto::compute_mac(
            self.suite,
            &self.ks_mac,
            &crypto::pad(&k, self.suite.block_len()),
        )?;
        if !constant_time_eq(&cc, mac) {
            error!("MAC verification failed");
            return Err(ProtocolError::MacVerificationFailed.into());
        }
        Ok(MacVerified(objects))
    }

    fn decrypt(&self, verified: &MacVerified<'_>) -> Result<(Vec<u8>, StatusWord), EmrtdError> {
        let malformed = |reason| {
            error!("Malformed protected response: {reason}");
            ProtocolError::MalformedSecureResponse(reason)
        };

        let nodes = tlv::decode_all(verified.0).map_err(|_| malformed("invalid data objects"))?;
        let mut encrypted = None;
        let mut status = None;
        for node in &nodes {
            let value = node
                .primitive_value()
                .ok_or_else(|| malformed("constructed data object"))?;
            match node.tag() {
                DO85 | DO87 if encrypted.is_none() => encrypted = Some((node.tag(), value)),
                DO99 if status.is_none() => status = Some(value),
                _ => return Err(malformed("unexpected data object").into()),
            }
        }
        let status = match status {
            Some(&[sw1, sw2]) => StatusWord::from_bytes(sw1, sw2),
            _ => return Err(malformed("missing or invalid DO'99").into()),
        };

        let Some((tag, value)) = encrypted else {
            return Ok((Vec::new(), status));
        };
        let ciphertext = match (tag, value.split_first()) {
            (DO85, _) => value,
            (_, Some((&PADDING_INDICATOR, rest))) => rest,
            _ => return Err(malformed("unknown padding indicator").into()),
        };
        let block_len = self.suite.block_len();
        if ciphertext.is_empty() || ciphertext.len() % block_len != 0 {
            return Err(malformed("ciphertext is not block aligned").into());
        }

        let ssc = self.ssc_bytes();
        let iv = crypto::secure_messaging_iv(self.suite, &self.ks_enc, &ssc)?;
        let padded = Zeroizing::new(crypto::cbc_decrypt(self.suite, &self.ks_enc, &iv, ciphertext)?);
        let data = crypto::unpad(&padded, block_len)?.to_vec();
        Ok((data, status))
    }
}

/// Ne as carried in DO'97: one byte up to 256, two bytes above.
fn encode_le(ne: usize) -> Vec<u8> {
    let bytes = ne.to_be_bytes();
    let len = if ne <= 256 { 1 } else { 2 };
    bytes[bytes.len() - len..].to_vec()
}

impl fmt::Debug for SecureMessaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMessaging")
            .field("suite", &self.suite)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for SecureMessaging {
    fn drop(&mut self) {
        self.ssc.zeroize();
    }
}
