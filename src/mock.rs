//! Test doubles: a deterministic RNG, a channel replaying a fixed transcript
//! and a simulated chip implementing the card side of BAC and secure
//! messaging.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use hex_literal::hex;
use rand::{CryptoRng, RngCore};

use crate::apdu::{ins, CommandApdu, StatusWord, EMRTD_AID};
use crate::bytes2hex;
use crate::channel::CardChannel;
use crate::crypto::{self, CipherSuite, KeyType};
use crate::error::ChannelError;
use crate::tlv;

/// `RND.IFD` and `K.IFD` of ICAO Doc 9303-11 Appendix D.3.
pub(crate) const ICAO_RND_IFD_K_IFD: [u8; 24] =
    hex!("781723860C06C226 0B795240CB7049B01C19B33E32804F0B");

/// Appendix D.3 and D.4 of ICAO Doc 9303-11: BAC followed by reading EF.COM.
pub(crate) const ICAO_TRANSCRIPT: [(&[u8], &[u8]); 6] = [
    (&hex!("00A4040C07A0000002471001"), &hex!("9000")),
    (&hex!("0084000008"), &hex!("4608F91988702212 9000")),
    (
        &hex!(
            "0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA
             56A8799FAE2F498F76ED92F25F1448EEA8AD90A7 28"
        ),
        &hex!(
            "46B9342A41396CD7386BF5803104D7CEDC122B91
             32139BAF2EEDC94EE178534F2F2D235D074D7449 9000"
        ),
    ),
    (
        &hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800"),
        &hex!("990290008E08FA855A5D4C50A8ED9000"),
    ),
    (
        &hex!("0CB000000D9701048E08ED6705417E96BA5500"),
        &hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED9000"),
    ),
    (
        &hex!("0CB000040D9701128E082EA28A70F3C7B53500"),
        &hex!(
            "871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A
             990290008E08C8B2787EAEA07D749000"
        ),
    ),
];

/// Plays back a fixed byte sequence, wrapping around at the end.
#[derive(Clone, Debug)]
pub(crate) struct FixedRng {
    data: Vec<u8>,
    index: usize,
}

impl FixedRng {
    pub(crate) fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            index: 0,
        }
    }

    pub(crate) fn icao() -> Self {
        Self::new(&ICAO_RND_IFD_K_IFD)
    }
}

impl Default for FixedRng {
    fn default() -> Self {
        Self::icao()
    }
}

impl CryptoRng for FixedRng {}

impl RngCore for FixedRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0; 4];
        self.fill_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0; 8];
        self.fill_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.data[self.index];
            self.index = (self.index + 1) % self.data.len();
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Answers commands from a list of expected exchanges, in order.
#[derive(Debug, Default)]
pub(crate) struct ScriptedChannel {
    exchanges: VecDeque<(Vec<u8>, Result<Vec<u8>, ChannelError>)>,
    pub(crate) connected: bool,
}

impl ScriptedChannel {
    pub(crate) fn new(transcript: &[(&[u8], &[u8])]) -> Self {
        let mut channel = Self::default();
        for (command, response) in transcript {
            channel = channel.expect(command, response);
        }
        channel
    }

    pub(crate) fn expect(mut self, command: &[u8], response: &[u8]) -> Self {
        self.exchanges
            .push_back((command.to_vec(), Ok(response.to_vec())));
        self
    }

    pub(crate) fn expect_error(mut self, command: &[u8], error: ChannelError) -> Self {
        self.exchanges.push_back((command.to_vec(), Err(error)));
        self
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.exchanges.is_empty()
    }
}

impl CardChannel for ScriptedChannel {
    fn connect(&mut self) -> Result<(), ChannelError> {
        self.connected = true;
        Ok(())
    }

    fn transmit(&mut self, command: &[u8], _timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Disconnected);
        }
        match self.exchanges.pop_front() {
            Some((expected, response)) if expected == command => response,
            Some((expected, _)) => Err(ChannelError::Transport(format!(
                "expected {}, received {}",
                bytes2hex(&expected),
                bytes2hex(command)
            ))),
            None => Err(ChannelError::Transport(format!(
                "unexpected command {}",
                bytes2hex(command)
            ))),
        }
    }

    fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.connected = false;
        Ok(())
    }
}

/// Parses a serialised command APDU, short or extended length.
pub(crate) fn parse_command(bytes: &[u8]) -> Option<CommandApdu> {
    if bytes.len() < 4 {
        return None;
    }
    let (header, body) = bytes.split_at(4);
    let (cla, ins, p1, p2) = (header[0], header[1], header[2], header[3]);
    let short_ne = |b: u8| if b == 0 { 256 } else { usize::from(b) };
    let extended_ne = |hi: u8, lo: u8| match u16::from_be_bytes([hi, lo]) {
        0 => 65536,
        ne => usize::from(ne),
    };
    let (data, ne) = match *body {
        [] => (&[][..], None),
        [le] => (&[][..], Some(short_ne(le))),
        [0, hi, lo] => (&[][..], Some(extended_ne(hi, lo))),
        [0, hi, lo, ref rest @ ..] => {
            let nc = usize::from(u16::from_be_bytes([hi, lo]));
            match rest.len().checked_sub(nc)? {
                0 => (rest, None),
                2 => (&rest[..nc], Some(extended_ne(rest[nc], rest[nc + 1]))),
                _ => return None,
            }
        }
        [lc, ref rest @ ..] => {
            let nc = usize::from(lc);
            match rest.len().checked_sub(nc)? {
                0 => (rest, None),
                1 => (&rest[..nc], Some(short_ne(rest[nc]))),
                _ => return None,
            }
        }
    };
    CommandApdu::new(cla, ins, p1, p2, data.to_vec(), ne).ok()
}

/// Card side of secure messaging.
pub(crate) struct CardSecureMessaging {
    suite: CipherSuite,
    ks_enc: Vec<u8>,
    ks_mac: Vec<u8>,
    ssc: u128,
}

impl CardSecureMessaging {
    pub(crate) fn new(suite: CipherSuite, ks_enc: &[u8], ks_mac: &[u8], ssc: &[u8]) -> Self {
        let mut bytes = [0; 16];
        bytes[16 - ssc.len()..].copy_from_slice(ssc);
        Self {
            suite,
            ks_enc: ks_enc.to_vec(),
            ks_mac: ks_mac.to_vec(),
            ssc: u128::from_be_bytes(bytes),
        }
    }

    pub(crate) fn send_sequence_counter(&self) -> u128 {
        self.ssc
    }

    fn ssc_bytes(&self) -> Vec<u8> {
        self.ssc.to_be_bytes()[16 - self.suite.block_len()..].to_vec()
    }

    fn mac(&self, data: &[u8]) -> Option<[u8; 8]> {
        crypto::compute_mac(self.suite, &self.ks_mac, &crypto::pad(data, self.suite.block_len())).ok()
    }

    fn iv(&self) -> Option<Vec<u8>> {
        crypto::secure_messaging_iv(self.suite, &self.ks_enc, &self.ssc_bytes()).ok()
    }

    /// Verifies and decrypts a protected command, `None` if it is invalid.
    pub(crate) fn unprotect_command(&mut self, bytes: &[u8]) -> Option<CommandApdu> {
        self.ssc += 1;
        let command = parse_command(bytes)?;
        if command.cla() & 0x0C != 0x0C {
            return None;
        }
        let objects = command.data();
        let split = objects.len().checked_sub(10)?;
        let (protected, do8e) = objects.split_at(split);
        if do8e[..2] != [0x8E, 0x08] {
            return None;
        }
        let mut n = self.ssc_bytes();
        n.extend_from_slice(&crypto::pad(&command.header(), self.suite.block_len()));
        n.extend_from_slice(protected);
        if self.mac(&n)? != do8e[2..] {
            return None;
        }

        let mut data = Vec::new();
        let mut ne = None;
        for node in tlv::decode_all(protected).ok()? {
            let value = node.primitive_value()?;
            match node.tag() {
                0x85 | 0x87 => {
                    let ciphertext = if node.tag() == 0x87 { value.get(1..)? } else { value };
                    let padded = crypto::cbc_decrypt(self.suite, &self.ks_enc, &self.iv()?, ciphertext).ok()?;
                    data = crypto::unpad(&padded, self.suite.block_len()).ok()?.to_vec();
                }
                0x97 => {
                    ne = Some(match *value {
                        [0] => 256,
                        [le] => usize::from(le),
                        [0, 0] => 65536,
                        [hi, lo] => usize::from(u16::from_be_bytes([hi, lo])),
                        _ => return None,
                    });
                }
                _ => return None,
            }
        }
        let [cla, ins, p1, p2] = command.header();
        CommandApdu::new(cla & !0x0C, ins, p1, p2, data, ne).ok()
    }

    /// Protects a response, padding `data`.
    pub(crate) fn protect_response(&mut self, data: &[u8], status: StatusWord) -> Vec<u8> {
        let padded = if data.is_empty() {
            Vec::new()
        } else {
            crypto::pad(data, self.suite.block_len())
        };
        self.protect_padded_response(&padded, status)
    }

    /// Protects a response whose data is already block aligned.
    pub(crate) fn protect_padded_response(&mut self, padded: &[u8], status: StatusWord) -> Vec<u8> {
        self.ssc += 1;
        let mut objects = Vec::new();
        if !padded.is_empty() {
            let iv = self.iv().unwrap_or_default();
            let encrypted =
                crypto::cbc_encrypt(self.suite, &self.ks_enc, &iv, padded).unwrap_or_default();
            let mut value = vec![0x01];
            value.extend_from_slice(&encrypted);
            objects.extend(tlv::encode(0x87, &value).unwrap_or_default());
        }
        objects.extend(tlv::encode(0x99, &status.to_bytes()).unwrap_or_default());

        let mut k = self.ssc_bytes();
        k.extend_from_slice(&objects);
        let mac = self.mac(&k).unwrap_or_default();
        objects.extend_from_slice(&[0x8E, 0x08]);
        objects.extend_from_slice(&mac);
        objects.extend_from_slice(&status.to_bytes());
        objects
    }
}

/// A chip holding elementary files behind BAC.
///
/// Uses the keys and nonces of ICAO Doc 9303-11 Appendix D.3, so a session
/// driven with [`FixedRng::icao`] sees the published transcript.
pub(crate) struct SimulatedChip {
    k_enc: Vec<u8>,
    k_mac: Vec<u8>,
    rnd_icc: [u8; 8],
    k_icc: [u8; 16],
    files: BTreeMap<u16, Vec<u8>>,
    /// Files readable without secure messaging.
    pub(crate) unprotected: BTreeSet<u16>,
    application_selected: bool,
    challenge_sent: bool,
    sm: Option<CardSecureMessaging>,
    selected: Option<u16>,
    pub(crate) connected: bool,
    transmits: usize,
    protected_responses: usize,
    /// Transmissions, counted from zero, that time out without reaching the chip.
    pub(crate) time_out: BTreeSet<usize>,
    /// Flips byte `.1` of the data of protected response number `.0`.
    pub(crate) tamper_response: Option<(usize, usize)>,
    /// Flips a byte of the EXTERNAL AUTHENTICATE response.
    pub(crate) tamper_authentication: Option<usize>,
    /// Answers protected command number `.0` with the plain status word `.1`.
    pub(crate) abort_with: Option<(usize, u16)>,
    /// Ne of each READ BINARY with odd instruction answered.
    pub(crate) odd_read_ne: Vec<usize>,
}

impl SimulatedChip {
    /// A chip for the MRZ information `L898902C<369080619406236`.
    pub(crate) fn icao() -> Self {
        Self {
            k_enc: hex!("AB94FDECF2674FDFB9B391F85D7F76F2").to_vec(),
            k_mac: hex!("7962D9ECE03D1ACD4C76089DCE131543").to_vec(),
            rnd_icc: hex!("4608F91988702212"),
            k_icc: hex!("0B4F80323EB3191CB04970CB4052790B"),
            files: BTreeMap::new(),
            unprotected: BTreeSet::new(),
            application_selected: false,
            challenge_sent: false,
            sm: None,
            selected: None,
            connected: false,
            transmits: 0,
            protected_responses: 0,
            time_out: BTreeSet::new(),
            tamper_response: None,
            tamper_authentication: None,
            abort_with: None,
            odd_read_ne: Vec::new(),
        }
    }

    pub(crate) fn with_file(mut self, fid: u16, contents: &[u8]) -> Self {
        self.files.insert(fid, contents.to_vec());
        self
    }

    /// Send sequence counter of the chip, if secure messaging is active.
    pub(crate) fn send_sequence_counter(&self) -> Option<u128> {
        self.sm.as_ref().map(CardSecureMessaging::send_sequence_counter)
    }

    fn plain(status: u16) -> Vec<u8> {
        StatusWord::new(status).to_bytes().to_vec()
    }

    fn respond(&mut self, bytes: &[u8]) -> Vec<u8> {
        if bytes.first().is_some_and(|cla| cla & 0x0C == 0x0C) {
            return self.respond_protected(bytes);
        }
        let Some(command) = parse_command(bytes) else {
            return Self::plain(0x6700);
        };
        if command.ins() == ins::SELECT && command.p1() == 0x04 {
            self.sm = None;
            self.application_selected = command.data() == EMRTD_AID;
            return Self::plain(if self.application_selected { 0x9000 } else { 0x6A82 });
        }
        // plain commands end secure messaging
        self.sm = None;
        if !self.application_selected {
            return Self::plain(0x6985);
        }
        match command.ins() {
            ins::GET_CHALLENGE => {
                self.challenge_sent = true;
                let mut response = self.rnd_icc.to_vec();
                response.extend_from_slice(&[0x90, 0x00]);
                response
            }
            ins::EXTERNAL_AUTHENTICATE => self.authenticate(command.data()),
            _ => {
                let (data, status) = self.file_command(&command, false);
                let mut response = data;
                response.extend_from_slice(&status.to_bytes());
                response
            }
        }
    }

    fn authenticate(&mut self, cryptogram: &[u8]) -> Vec<u8> {
        if !self.challenge_sent || cryptogram.len() != 40 {
            return Self::plain(0x6985);
        }
        self.challenge_sent = false;
        let (e_ifd, m_ifd) = cryptogram.split_at(32);
        let mac = crypto::compute_mac(CipherSuite::Des3, &self.k_mac, &crypto::pad(e_ifd, 8));
        if mac.ok().as_ref().map(<[u8; 8]>::as_slice) != Some(m_ifd) {
            return Self::plain(0x6300);
        }
        let Ok(s) = crypto::cbc_decrypt(CipherSuite::Des3, &self.k_enc, &[0; 8], e_ifd) else {
            return Self::plain(0x6300);
        };
        let (rnd_ifd, rest) = s.split_at(8);
        let (rnd_icc, k_ifd) = rest.split_at(8);
        if rnd_icc != self.rnd_icc {
            return Self::plain(0x6300);
        }

        let mut r = rnd_icc.to_vec();
        r.extend_from_slice(rnd_ifd);
        r.extend_from_slice(&self.k_icc);
        let e_icc =
            crypto::cbc_encrypt(CipherSuite::Des3, &self.k_enc, &[0; 8], &r).unwrap_or_default();
        let m_icc = crypto::compute_mac(CipherSuite::Des3, &self.k_mac, &crypto::pad(&e_icc, 8))
            .unwrap_or_default();
        let mut response = e_icc;
        response.extend_from_slice(&m_icc);
        if let Some(i) = self.tamper_authentication {
            response[i] ^= 0x01;
        }
        response.extend_from_slice(&[0x90, 0x00]);

        let mut ks_seed = k_ifd.to_vec();
        crypto::xor_in_place(&mut ks_seed, &self.k_icc);
        let ks_enc = crypto::compute_key(&ks_seed, KeyType::Encryption, CipherSuite::Des3);
        let ks_mac = crypto::compute_key(&ks_seed, KeyType::Mac, CipherSuite::Des3);
        let mut ssc = self.rnd_icc[4..].to_vec();
        ssc.extend_from_slice(&rnd_ifd[4..]);
        if let (Ok(ks_enc), Ok(ks_mac)) = (ks_enc, ks_mac) {
            self.sm = Some(CardSecureMessaging::new(
                CipherSuite::Des3,
                &ks_enc,
                &ks_mac,
                &ssc,
            ));
        }
        response
    }

    fn respond_protected(&mut self, bytes: &[u8]) -> Vec<u8> {
        let number = self.protected_responses;
        self.protected_responses += 1;
        let Some(mut sm) = self.sm.take() else {
            return Self::plain(0x6988);
        };
        if let Some((_, status)) = self.abort_with.filter(|&(n, _)| n == number) {
            return Self::plain(status);
        }
        let Some(command) = sm.unprotect_command(bytes) else {
            return Self::plain(0x6988);
        };
        let (data, status) = self.file_command(&command, true);
        let mut response = sm.protect_response(&data, status);
        if let Some((_, i)) = self.tamper_response.filter(|&(n, _)| n == number) {
            response[i] ^= 0x01;
        }
        self.sm = Some(sm);
        response
    }

    fn file_command(&mut self, command: &CommandApdu, protected: bool) -> (Vec<u8>, StatusWord) {
        match command.ins() {
            ins::SELECT if command.p1() == 0x02 => {
                let fid = match *command.data() {
                    [hi, lo] => u16::from_be_bytes([hi, lo]),
                    _ => return (Vec::new(), StatusWord::new(0x6A80)),
                };
                if !self.files.contains_key(&fid) {
                    return (Vec::new(), StatusWord::new(0x6A82));
                }
                if !protected && !self.unprotected.contains(&fid) {
                    return (Vec::new(), StatusWord::new(0x6982));
                }
                self.selected = Some(fid);
                (Vec::new(), StatusWord::SUCCESS)
            }
            ins::READ_BINARY => {
                let offset = usize::from(u16::from_be_bytes([command.p1(), command.p2()]));
                self.read(offset, command.ne().unwrap_or(256), false)
            }
            ins::READ_BINARY_ODD => {
                let offset = tlv::decode(command.data())
                    .ok()
                    .filter(|node| node.tag() == 0x54)
                    .and_then(|node| {
                        node.primitive_value()
                            .map(|v| v.iter().fold(0, |acc, &b| (acc << 8) | usize::from(b)))
                    });
                match offset {
                    Some(offset) => {
                        let ne = command.ne().unwrap_or(256);
                        self.odd_read_ne.push(ne);
                        self.read(offset, ne, true)
                    }
                    None => (Vec::new(), StatusWord::new(0x6A80)),
                }
            }
            _ => (Vec::new(), StatusWord::new(0x6D00)),
        }
    }

    fn read(&self, offset: usize, ne: usize, odd: bool) -> (Vec<u8>, StatusWord) {
        let Some(contents) = self.selected.and_then(|fid| self.files.get(&fid)) else {
            return (Vec::new(), StatusWord::new(0x6986));
        };
        let Some(remaining) = contents.get(offset..) else {
            return (Vec::new(), StatusWord::new(0x6B00));
        };
        if !odd {
            return (remaining[..ne.min(remaining.len())].to_vec(), StatusWord::SUCCESS);
        }
        // DO'53 and its header must fit in Ne
        let mut len = ne.saturating_sub(2).min(remaining.len());
        if len >= 128 {
            len = ne.saturating_sub(3).min(remaining.len());
        }
        let data = tlv::encode(0x53, &remaining[..len]).unwrap_or_default();
        (data, StatusWord::SUCCESS)
    }
}

impl CardChannel for SimulatedChip {
    fn connect(&mut self) -> Result<(), ChannelError> {
        self.connected = true;
        Ok(())
    }

    fn transmit(&mut self, command: &[u8], _timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Disconnected);
        }
        let transmit = self.transmits;
        self.transmits += 1;
        if self.time_out.contains(&transmit) {
            return Err(ChannelError::Timeout);
        }
        Ok(self.respond(command))
    }

    fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.connected = false;
        self.sm = None;
        self.application_selected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let select = parse_command(&hex!("00A4020C02011E"));
        assert_eq!(select, Some(CommandApdu::select_ef(0x011E)));
        assert_eq!(parse_command(&hex!("0084000008")), Some(CommandApdu::get_challenge()));
        let extended = parse_command(&hex!("00B00000 000100"));
        assert_eq!(extended.and_then(|c| c.ne()), Some(256));
        assert_eq!(parse_command(&hex!("00B000")), None);
        assert_eq!(parse_command(&hex!("00A4020C03011E")), None);
    }

    #[test]
    fn test_simulated_chip_replays_icao_transcript() -> Result<(), ChannelError> {
        let mut chip = SimulatedChip::icao().with_file(0x011E, &hex!("60145F0104303130365F36063034303030305C026175"));
        chip.connect()?;
        for (command, response) in ICAO_TRANSCRIPT {
            assert_eq!(chip.transmit(command, Duration::from_secs(1))?, response);
        }
        assert_eq!(chip.send_sequence_counter(), Some(0x8870_2212_0C06_C22C));
        Ok(())
    }
}
