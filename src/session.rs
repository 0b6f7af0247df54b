//! A reading session with one eMRTD.
//!
//! [`PassportSession`] drives a [`CardChannel`]: it selects the eMRTD
//! application, runs BAC and reads data groups under secure messaging.
//! Handshake failures, secure messaging integrity failures and channel
//! failures tear the secure channel down; the caller has to select the
//! application and run BAC again before reading further.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use tracing::{debug, error, info, trace, warn};

use crate::apdu::{CommandApdu, ResponseApdu, EMRTD_AID};
use crate::bac::BacHandshake;
use crate::bytes2hex;
use crate::channel::CardChannel;
use crate::error::{ChannelError, EmrtdError, EncodingError, ProtocolError};
use crate::lds::{DataGroup, DataGroupFile};
use crate::mrz::AccessKeySeed;
use crate::secure_messaging::SecureMessaging;
use crate::tlv;

/// Tag of the data object carrying READ BINARY data for the odd instruction.
const DO53: u32 = 0x53;
/// Highest offset READ BINARY with even instruction can address.
const MAX_EVEN_OFFSET: usize = 0x7FFF;

/// Settings of a [`PassportSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Passed to every [`CardChannel::transmit`].
    pub timeout: Duration,
    /// Retransmissions of an unprotected command after a timeout.
    /// Protected commands are never retransmitted.
    pub max_retries: u8,
    /// Bytes requested per READ BINARY.
    pub max_read_length: u8,
    /// Data groups the document allows to read before BAC.
    pub unauthenticated_reads: BTreeSet<DataGroup>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            max_read_length: 0xDF,
            unauthenticated_reads: BTreeSet::new(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Zero is raised to one.
    #[must_use]
    pub fn with_max_read_length(mut self, max_read_length: u8) -> Self {
        self.max_read_length = max_read_length.max(1);
        self
    }

    #[must_use]
    pub fn with_unauthenticated_read(mut self, group: DataGroup) -> Self {
        self.unauthenticated_reads.insert(group);
        self
    }
}

/// State of a [`PassportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ApplicationSelected,
    Authenticated,
    /// A handshake, integrity or channel failure ended the session.
    Failed,
    Closed,
}

/// A session with one eMRTD over a [`CardChannel`].
///
/// Exactly one command is in flight at a time; `&mut self` on every
/// exchange makes protecting a command, transmitting it and verifying the
/// response one step.
pub struct PassportSession<C, R = OsRng> {
    channel: C,
    rng: R,
    config: SessionConfig,
    state: SessionState,
    sm: Option<SecureMessaging>,
    connected: bool,
    retries: usize,
}

impl<C: CardChannel> PassportSession<C, OsRng> {
    /// Creates a session drawing its nonces from the operating system.
    #[must_use]
    pub fn new(channel: C, config: SessionConfig) -> Self {
        Self::with_rng(channel, config, OsRng)
    }
}

impl<C: CardChannel, R: RngCore + CryptoRng> PassportSession<C, R> {
    #[must_use]
    pub fn with_rng(channel: C, config: SessionConfig, rng: R) -> Self {
        Self {
            channel,
            rng,
            config,
            state: SessionState::Idle,
            sm: None,
            connected: false,
            retries: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Send sequence counter of the secure channel, if there is one.
    #[must_use]
    pub fn send_sequence_counter(&self) -> Option<u128> {
        self.sm.as_ref().map(SecureMessaging::send_sequence_counter)
    }

    /// Number of retransmissions after timeouts so far.
    #[must_use]
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Connects the channel if needed and selects the eMRTD application.
    ///
    /// Any previous secure channel is discarded.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if the channel fails or the chip refuses the selection.
    pub fn select_application(&mut self) -> Result<(), EmrtdError> {
        self.sm = None;
        if !self.connected {
            if let Err(err) = self.channel.connect() {
                error!("Error while connecting to the card: {err}");
                self.fail();
                return Err(err.into());
            }
            self.connected = true;
        }

        info!(
            "Selecting eMRTD Application `International AID`: {}...",
            bytes2hex(&EMRTD_AID)
        );
        let result = self
            .transmit_plain(&CommandApdu::select_emrtd_application())
            .and_then(|response| response.into_data().map_err(EmrtdError::from));
        match result {
            Ok(_) => {
                self.transition(SessionState::ApplicationSelected);
                Ok(())
            }
            Err(err) => {
                error!("Error while selecting eMRTD Application: {err}");
                self.fail();
                Err(err)
            }
        }
    }

    /// Runs Basic Access Control and switches to secure messaging.
    ///
    /// # Errors
    ///
    /// * `ProtocolError::ApplicationNotSelected` unless the application was
    ///   just selected.
    /// * `EmrtdError` if the handshake fails; the session is then `Failed`.
    pub fn perform_bac(&mut self, seed: AccessKeySeed) -> Result<(), EmrtdError> {
        if self.state != SessionState::ApplicationSelected {
            error!("BAC needs a freshly selected application, session is {:?}", self.state);
            return Err(ProtocolError::ApplicationNotSelected.into());
        }
        trace!("Establishing session keys...");
        let mut handshake = BacHandshake::new(seed);
        match self.run_handshake(&mut handshake) {
            Ok(sm) => {
                self.sm = Some(sm);
                self.transition(SessionState::Authenticated);
                Ok(())
            }
            Err(err) => {
                error!("Error while establishing BAC session keys: {err}");
                self.fail();
                Err(err)
            }
        }
    }

    fn run_handshake(&mut self, handshake: &mut BacHandshake) -> Result<SecureMessaging, EmrtdError> {
        let command = handshake.challenge_command()?;
        let response = self.transmit_plain(&command)?;
        handshake.process_challenge(response)?;
        let command = handshake.authenticate_command(&mut self.rng)?;
        let response = self.transmit_plain(&command)?;
        handshake.process_authentication(response)
    }

    /// Reads and decodes a data group.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` as for [`PassportSession::read_file`].
    /// * `EncodingError` if the content is malformed or belongs to another
    ///   data group. The session stays usable.
    pub fn read_data_group(&mut self, group: DataGroup) -> Result<DataGroupFile, EmrtdError> {
        let bytes = self.read_file(group)?;
        let file = DataGroupFile::decode(&bytes)?;
        if file.group() != group {
            error!("Read {} while {group} was requested", file.group());
            return Err(EncodingError::UnexpectedTag {
                expected: group.tag(),
                found: file.group().tag(),
            }
            .into());
        }
        Ok(file)
    }

    /// Reads the raw bytes of a data group.
    ///
    /// Without BAC only groups listed in
    /// [`SessionConfig::unauthenticated_reads`] can be read.
    ///
    /// # Errors
    ///
    /// * `ProtocolError::NotAuthenticated` if the group needs BAC first.
    /// * `ProtocolError::ApplicationNotSelected` if the application is not selected.
    /// * `ProtocolError::UnexpectedStatusWord` if the chip refuses a command.
    /// * `EmrtdError` for secure messaging and channel failures, which also
    ///   end the session.
    pub fn read_file(&mut self, group: DataGroup) -> Result<Vec<u8>, EmrtdError> {
        let allowed_plain = self.config.unauthenticated_reads.contains(&group);
        match self.state {
            SessionState::Authenticated => {}
            SessionState::ApplicationSelected if allowed_plain => {}
            SessionState::Idle | SessionState::Closed if allowed_plain => {
                error!("Can not read {group}, the application is not selected");
                return Err(ProtocolError::ApplicationNotSelected.into());
            }
            state => {
                error!("Can not read {group} in state {state:?}");
                return Err(ProtocolError::NotAuthenticated.into());
            }
        }

        trace!("Selecting File {group}: {:04X}...", group.fid());
        self.exchange(&CommandApdu::select_ef(group.fid()))?
            .into_data()?;

        // Read Binary of first four bytes
        trace!("Reading first 4 bytes from EF...");
        let mut data = self.read_binary(0, 4)?;
        let total = tlv::peek_header(&data)?.total_len()?;
        data.truncate(total);

        trace!("Reading {total} bytes from EF...");
        while data.len() < total {
            let offset = data.len();
            let ne = (total - offset).min(usize::from(self.config.max_read_length));
            let chunk = self.read_binary(offset, ne)?;
            if chunk.is_empty() {
                error!("Requested bytes while reading EF but received 0 bytes.");
                return Err(EncodingError::TruncatedData {
                    needed: total,
                    available: offset,
                }
                .into());
            }
            data.extend_from_slice(&chunk[..chunk.len().min(total - offset)]);
        }
        debug!("Read {group}, {total} bytes");
        Ok(data)
    }

    fn read_binary(&mut self, offset: usize, ne: usize) -> Result<Vec<u8>, EmrtdError> {
        if offset <= MAX_EVEN_OFFSET {
            let offset = u16::try_from(offset)
                .map_err(|_| EmrtdError::InvalidArgument("READ BINARY offset"))?;
            return Ok(self.exchange(&CommandApdu::read_binary(offset, ne)?)?.into_data()?);
        }

        let offset = u32::try_from(offset)
            .map_err(|_| EmrtdError::InvalidArgument("READ BINARY offset above 32 bits"))?;
        let data = self
            .exchange(&CommandApdu::read_binary_odd(offset, ne)?)?
            .into_data()?;
        let node = tlv::decode(&data)?;
        match node.primitive_value() {
            Some(value) if node.tag() == DO53 => Ok(value.to_vec()),
            _ => {
                error!("READ BINARY response is not wrapped in DO'53");
                Err(EncodingError::UnexpectedTag {
                    expected: DO53,
                    found: node.tag(),
                }
                .into())
            }
        }
    }

    /// Discards the secure channel and disconnects.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::Channel` if the channel fails to disconnect.
    pub fn close(&mut self) -> Result<(), EmrtdError> {
        self.sm = None;
        self.transition(SessionState::Closed);
        if self.connected {
            self.connected = false;
            self.channel.disconnect()?;
        }
        Ok(())
    }

    fn exchange(&mut self, command: &CommandApdu) -> Result<ResponseApdu, EmrtdError> {
        if self.sm.is_none() {
            return self.transmit_plain(command);
        }
        let result = self.transmit_secure(command);
        if let Err(ref err) = result {
            error!("Error while exchanging protected APDU, closing the session: {err}");
            self.fail();
        }
        result
    }

    fn transmit_plain(&mut self, command: &CommandApdu) -> Result<ResponseApdu, EmrtdError> {
        let bytes = command.to_bytes();
        let mut attempt = 0;
        loop {
            trace!("Sending APDU: {}", bytes2hex(&bytes));
            match self.channel.transmit(&bytes, self.config.timeout) {
                Ok(response) => {
                    let response = ResponseApdu::from_bytes(&response).map_err(|err| {
                        self.fail();
                        err
                    })?;
                    trace!(
                        "APDU response ({}): {}",
                        response.status(),
                        bytes2hex(response.data())
                    );
                    return Ok(response);
                }
                Err(ChannelError::Timeout) if attempt < self.config.max_retries => {
                    attempt += 1;
                    self.retries += 1;
                    warn!(
                        "Card did not answer within {:?}, retry {attempt} of {}",
                        self.config.timeout, self.config.max_retries
                    );
                }
                Err(err) => {
                    error!("Error while sending APDU: {err}");
                    self.fail();
                    return Err(err.into());
                }
            }
        }
    }

    fn transmit_secure(&mut self, command: &CommandApdu) -> Result<ResponseApdu, EmrtdError> {
        let Some(sm) = self.sm.as_mut() else {
            return Err(ProtocolError::NotAuthenticated.into());
        };
        trace!("Sending APDU: {}", bytes2hex(&command.to_bytes()));
        let protected = sm.protect(command)?;
        let response = self
            .channel
            .transmit(&protected.to_bytes(), self.config.timeout)?;
        let response = sm.unprotect(&ResponseApdu::from_bytes(&response)?)?;
        trace!(
            "APDU response ({}): {}",
            response.status(),
            bytes2hex(response.data())
        );
        Ok(response)
    }

    fn fail(&mut self) {
        self.sm = None;
        self.transition(SessionState::Failed);
    }

    fn transition(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }
}
