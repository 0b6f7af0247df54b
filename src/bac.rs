//! Basic Access Control, ICAO Doc 9303-11 Section 4.3.
//!
//! [`BacHandshake`] builds the commands of the handshake and checks the
//! answers of the chip. It never touches a channel, the session moves the
//! bytes. The authentication cryptogram of the chip is MAC-verified before
//! anything is decrypted.

use constant_time_eq::constant_time_eq;
use rand::{CryptoRng, RngCore};
use tracing::{debug, error, trace};
use zeroize::Zeroizing;

use crate::apdu::{CommandApdu, ResponseApdu};
use crate::crypto::{self, CipherSuite, KeyType, MAC_LEN};
use crate::error::{EmrtdError, ProtocolError};
use crate::mrz::AccessKeySeed;
use crate::secure_messaging::SecureMessaging;

const NONCE_LEN: usize = 8;
const KEY_MATERIAL_LEN: usize = 16;
const CRYPTOGRAM_LEN: usize = 2 * NONCE_LEN + KEY_MATERIAL_LEN;
const ZERO_IV: [u8; 8] = [0; 8];

/// Progress of a BAC handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacState {
    Init,
    ChallengeRequested,
    ChallengeReceived,
    AuthSent,
    Authenticated,
    Failed,
}

impl BacState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Authenticated | Self::Failed)
    }
}

/// One run of the BAC handshake.
///
/// Owns the access key seed and the terminal nonces, all of them are wiped
/// when the handshake is dropped.
///
/// ```text
/// Init --challenge_command--> ChallengeRequested
///      --process_challenge--> ChallengeReceived
///      --authenticate_command--> AuthSent
///      --process_authentication--> Authenticated
/// ```
///
/// Any error moves the handshake to [`BacState::Failed`].
pub struct BacHandshake {
    state: BacState,
    seed: AccessKeySeed,
    rnd_icc: [u8; NONCE_LEN],
    rnd_ifd: Zeroizing<[u8; NONCE_LEN]>,
    k_ifd: Zeroizing<[u8; KEY_MATERIAL_LEN]>,
}

impl BacHandshake {
    #[must_use]
    pub fn new(seed: AccessKeySeed) -> Self {
        Self {
            state: BacState::Init,
            seed,
            rnd_icc: [0; NONCE_LEN],
            rnd_ifd: Zeroizing::new([0; NONCE_LEN]),
            k_ifd: Zeroizing::new([0; KEY_MATERIAL_LEN]),
        }
    }

    #[must_use]
    pub fn state(&self) -> BacState {
        self.state
    }

    /// GET CHALLENGE, the first command of the handshake.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::InvalidArgument` if the handshake already started.
    pub fn challenge_command(&mut self) -> Result<CommandApdu, EmrtdError> {
        self.expect_state(BacState::Init)?;
        self.transition(BacState::ChallengeRequested);
        Ok(CommandApdu::get_challenge())
    }

    /// Stores `RND.ICC` from the answer to GET CHALLENGE.
    ///
    /// # Errors
    ///
    /// * `ProtocolError::UnexpectedStatusWord` if the chip refused the command.
    /// * `ProtocolError::AuthenticationFailed` if the challenge is not 8 bytes.
    pub fn process_challenge(&mut self, response: ResponseApdu) -> Result<(), EmrtdError> {
        self.expect_state(BacState::ChallengeRequested)?;
        let result = Self::challenge(response);
        let rnd_icc = self.check(result)?;
        self.rnd_icc = rnd_icc;
        self.transition(BacState::ChallengeReceived);
        Ok(())
    }

    fn challenge(response: ResponseApdu) -> Result<[u8; NONCE_LEN], EmrtdError> {
        let data = response.into_data()?;
        <[u8; NONCE_LEN]>::try_from(data.as_slice()).map_err(|_| {
            error!("Challenge should be {NONCE_LEN} bytes, found {}", data.len());
            EmrtdError::from(ProtocolError::AuthenticationFailed)
        })
    }

    /// EXTERNAL AUTHENTICATE carrying `E.IFD || M.IFD`.
    ///
    /// Draws `RND.IFD` and `K.IFD` from `rng`, in that order.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if called out of order or the cryptogram can not be computed.
    pub fn authenticate_command<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<CommandApdu, EmrtdError> {
        self.expect_state(BacState::ChallengeReceived)?;
        rng.fill_bytes(&mut *self.rnd_ifd);
        rng.fill_bytes(&mut *self.k_ifd);

        let result = self.cryptogram();
        let cryptogram = self.check(result)?;
        self.transition(BacState::AuthSent);
        Ok(CommandApdu::external_authenticate(cryptogram))
    }

    fn cryptogram(&self) -> Result<[u8; CRYPTOGRAM_LEN + MAC_LEN], EmrtdError> {
        let mut s = Zeroizing::new(Vec::with_capacity(CRYPTOGRAM_LEN));
        s.extend_from_slice(&*self.rnd_ifd);
        s.extend_from_slice(&self.rnd_icc);
        s.extend_from_slice(&*self.k_ifd);

        let e_ifd = crypto::cbc_encrypt(CipherSuite::Des3, self.seed.k_enc(), &ZERO_IV, &s)?;
        let m_ifd = crypto::compute_mac(
            CipherSuite::Des3,
            self.seed.k_mac(),
            &crypto::pad(&e_ifd, CipherSuite::Des3.block_len()),
        )?;

        let mut cryptogram = [0; CRYPTOGRAM_LEN + MAC_LEN];
        cryptogram[..CRYPTOGRAM_LEN].copy_from_slice(&e_ifd);
        cryptogram[CRYPTOGRAM_LEN..].copy_from_slice(&m_ifd);
        Ok(cryptogram)
    }

    /// Checks `E.ICC || M.ICC` and derives the session keys.
    ///
    /// The MAC is compared in constant time before `E.ICC` is decrypted.
    /// The session key seed is `K.IFD xor K.ICC`, the send sequence counter
    /// the four least significant bytes of `RND.ICC` followed by those of
    /// `RND.IFD`, ICAO Doc 9303-11 Section 9.8.3.2.
    ///
    /// # Errors
    ///
    /// * `ProtocolError::UnexpectedStatusWord` if the chip refused the command.
    /// * `ProtocolError::AuthenticationFailed` if the MAC or a nonce does not match.
    pub fn process_authentication(
        &mut self,
        response: ResponseApdu,
    ) -> Result<SecureMessaging, EmrtdError> {
        self.expect_state(BacState::AuthSent)?;
        let result = self.session(response);
        let session = self.check(result)?;
        self.transition(BacState::Authenticated);
        Ok(session)
    }

    fn session(&self, response: ResponseApdu) -> Result<SecureMessaging, EmrtdError> {
        let data = response.into_data()?;
        if data.len() != CRYPTOGRAM_LEN + MAC_LEN {
            error!(
                "Authentication response should be {} bytes, found {}",
                CRYPTOGRAM_LEN + MAC_LEN,
                data.len()
            );
            return Err(ProtocolError::AuthenticationFailed.into());
        }
        let (e_icc, m_icc) = data.split_at(CRYPTOGRAM_LEN);

        let mac = crypto::compute_mac(
            CipherSuite::Des3,
            self.seed.k_mac(),
            &crypto::pad(e_icc, CipherSuite::Des3.block_len()),
        )?;
        if !constant_time_eq(&mac, m_icc) {
            error!("MAC verification of the authentication response failed");
            return Err(ProtocolError::AuthenticationFailed.into());
        }

        let r = Zeroizing::new(crypto::cbc_decrypt(
            CipherSuite::Des3,
            self.seed.k_enc(),
            &ZERO_IV,
            e_icc,
        )?);
        let (rnd_icc, rest) = r.split_at(NONCE_LEN);
        let (rnd_ifd, k_icc) = rest.split_at(NONCE_LEN);
        if !constant_time_eq(rnd_icc, &self.rnd_icc) {
            error!("RND.ICC returned by the chip does not match the challenge");
            return Err(ProtocolError::AuthenticationFailed.into());
        }
        if !constant_time_eq(rnd_ifd, &*self.rnd_ifd) {
            error!("RND.IFD returned by the chip does not match");
            return Err(ProtocolError::AuthenticationFailed.into());
        }

        let mut ks_seed = Zeroizing::new(self.k_ifd.to_vec());
        crypto::xor_in_place(&mut ks_seed, k_icc);
        trace!("Computing session keys...");
        let ks_enc = crypto::compute_key(&ks_seed, KeyType::Encryption, CipherSuite::Des3)?;
        let ks_mac = crypto::compute_key(&ks_seed, KeyType::Mac, CipherSuite::Des3)?;

        let mut ssc = [0; 8];
        ssc[..4].copy_from_slice(&self.rnd_icc[4..]);
        ssc[4..].copy_from_slice(&self.rnd_ifd[4..]);

        SecureMessaging::new(CipherSuite::Des3, &ks_enc, &ks_mac, &ssc)
    }

    fn expect_state(&mut self, expected: BacState) -> Result<(), EmrtdError> {
        if self.state == expected {
            return Ok(());
        }
        error!("BAC handshake is {:?}, expected {expected:?}", self.state);
        if !self.state.is_terminal() {
            self.transition(BacState::Failed);
        }
        Err(EmrtdError::InvalidArgument("BAC handshake step out of order"))
    }

    fn check<T>(&mut self, result: Result<T, EmrtdError>) -> Result<T, EmrtdError> {
        if result.is_err() {
            self.transition(BacState::Failed);
        }
        result
    }

    fn transition(&mut self, state: BacState) {
        debug!("BAC handshake {:?} -> {state:?}", self.state);
        self.state = state;
    }
}
