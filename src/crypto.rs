//! Symmetric primitives for BAC and secure messaging.
//!
//! Cipher suites form a closed set selected explicitly by the caller. Every
//! derived key is returned in a [`Zeroizing`] buffer so it is wiped when the
//! owning session goes away.

use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cmac::{digest::InvalidLength, Cmac, Mac};
use sha1_checked::Sha1;
use sha2::{Digest, Sha256};
use tracing::error;
use zeroize::Zeroizing;

use crate::error::{EmrtdError, ProtocolError};

/// Length of the cryptographic checksum carried in DO'8E and in `M.IFD`/`M.ICC`.
pub const MAC_LEN: usize = 8;

/// Block cipher and MAC pair used by a secure messaging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CipherSuite {
    /// Two-key 3DES in CBC mode with ISO/IEC 9797-1 MAC algorithm 3.
    Des3,
    /// AES-128 in CBC mode with AES-CMAC.
    Aes128,
    /// AES-192 in CBC mode with AES-CMAC.
    Aes192,
    /// AES-256 in CBC mode with AES-CMAC.
    Aes256,
}

impl CipherSuite {
    /// Key length in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Des3 | Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Block length in bytes, also the length of the send sequence counter.
    #[must_use]
    pub const fn block_len(self) -> usize {
        match self {
            Self::Des3 => 8,
            Self::Aes128 | Self::Aes192 | Self::Aes256 => 16,
        }
    }
}

/// Purpose of a derived key, selects the KDF counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Encryption,
    Mac,
}

impl KeyType {
    const fn counter(self) -> [u8; 4] {
        match self {
            Self::Encryption => [0x00, 0x00, 0x00, 0x01],
            Self::Mac => [0x00, 0x00, 0x00, 0x02],
        }
    }
}

/// Key material wiped on drop.
pub type SecretKey = Zeroizing<Vec<u8>>;

/// Calculates the SHA-1 of `secret`.
///
/// Calculation is explained at ICAO Doc 9303-11 Section 4.3.2:
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
///
/// # Errors
///
/// `EmrtdError` if SHA-1 detects a collision attack on the input.
pub fn sha1(secret: &[u8]) -> Result<Zeroizing<Vec<u8>>, EmrtdError> {
    let hash_result = Sha1::try_digest(secret);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation had collision");
        return Err(EmrtdError::CalculateHashError(
            "SHA1 hash calculation had collision",
        ));
    }
    Ok(Zeroizing::new(hash_result.hash().as_slice().to_vec()))
}

/// Derives a key from `key_seed`, ICAO Doc 9303-11 Section 9.7.1.
///
/// For calculation examples see ICAO Doc 9303-11 Appendix D.1:
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
///
/// # Errors
///
/// `EmrtdError` if the hash calculation fails.
pub fn compute_key(
    key_seed: &[u8],
    key_type: KeyType,
    suite: CipherSuite,
) -> Result<SecretKey, EmrtdError> {
    let mut d = Zeroizing::new(key_seed.to_vec());
    d.extend_from_slice(&key_type.counter());

    match suite {
        CipherSuite::Des3 => {
            let hash = sha1(&d)?;
            let mut key = Zeroizing::new(hash[..16].to_vec());
            des_adjust_parity_bits(&mut key);
            Ok(key)
        }
        CipherSuite::Aes128 => {
            let hash = sha1(&d)?;
            Ok(Zeroizing::new(hash[..16].to_vec()))
        }
        CipherSuite::Aes192 | CipherSuite::Aes256 => {
            let hash = Zeroizing::new(Sha256::digest(&*d).to_vec());
            Ok(Zeroizing::new(hash[..suite.key_len()].to_vec()))
        }
    }
}

fn check_lengths(
    what: &'static str,
    key: &[u8],
    key_size: usize,
    data: &[u8],
    block_size: usize,
) -> Result<(), EmrtdError> {
    if key.len() != key_size {
        error!(
            "Wrong key size for {what}, expected {key_size}, found {}",
            key.len()
        );
        return Err(EmrtdError::InvalidArgument("wrong key size for cipher"));
    }
    if data.len() % block_size != 0 {
        error!(
            "Wrong data size for {what}, expected a multiple of {block_size}, found {}",
            data.len()
        );
        return Err(EmrtdError::InvalidArgument("data is not block aligned"));
    }
    Ok(())
}

fn check_iv(what: &'static str, iv: &[u8], iv_size: usize) -> Result<(), EmrtdError> {
    if iv.len() != iv_size {
        error!(
            "Wrong IV size for {what}, expected {iv_size}, found {}",
            iv.len()
        );
        return Err(EmrtdError::InvalidArgument("wrong IV size for cipher"));
    }
    Ok(())
}

fn encrypt<CM>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockEncryptMut + KeyIvInit,
{
    check_lengths("cipher encryption", key, CM::key_size(), data, CM::block_size())?;
    check_iv("cipher encryption", iv, CM::iv_size())?;
    Ok(CM::new(key.into(), iv.into())
        .encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

fn decrypt<CM>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockDecryptMut + KeyIvInit,
{
    check_lengths("cipher decryption", key, CM::key_size(), data, CM::block_size())?;
    check_iv("cipher decryption", iv, CM::iv_size())?;
    CM::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(|_| EmrtdError::InvalidArgument("data is not block aligned"))
}

fn encrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockEncryptMut + KeyInit,
{
    check_lengths("ECB encryption", key, CM::key_size(), data, CM::block_size())?;
    Ok(CM::new(key.into()).encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

fn decrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockDecryptMut + KeyInit,
{
    check_lengths("ECB decryption", key, CM::key_size(), data, CM::block_size())?;
    CM::new(key.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(|_| EmrtdError::InvalidArgument("data is not block aligned"))
}

/// CBC encryption of block aligned `data`.
///
/// # Errors
///
/// * `EmrtdError::InvalidArgument` if key, IV or data length is wrong for `suite`.
pub fn cbc_encrypt(
    suite: CipherSuite,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, EmrtdError> {
    match suite {
        CipherSuite::Des3 => encrypt::<cbc::Encryptor<des::TdesEde2>>(key, iv, data),
        CipherSuite::Aes128 => encrypt::<cbc::Encryptor<aes::Aes128>>(key, iv, data),
        CipherSuite::Aes192 => encrypt::<cbc::Encryptor<aes::Aes192>>(key, iv, data),
        CipherSuite::Aes256 => encrypt::<cbc::Encryptor<aes::Aes256>>(key, iv, data),
    }
}

/// CBC decryption of block aligned `data`.
///
/// # Errors
///
/// * `EmrtdError::InvalidArgument` if key, IV or data length is wrong for `suite`.
pub fn cbc_decrypt(
    suite: CipherSuite,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, EmrtdError> {
    match suite {
        CipherSuite::Des3 => decrypt::<cbc::Decryptor<des::TdesEde2>>(key, iv, data),
        CipherSuite::Aes128 => decrypt::<cbc::Decryptor<aes::Aes128>>(key, iv, data),
        CipherSuite::Aes192 => decrypt::<cbc::Decryptor<aes::Aes192>>(key, iv, data),
        CipherSuite::Aes256 => decrypt::<cbc::Decryptor<aes::Aes256>>(key, iv, data),
    }
}

/// Initialisation vector for secure messaging encryption.
///
/// 3DES uses the zero IV (ICAO Doc 9303-11 Section 9.8.6.1), AES uses
/// `E(KSenc, SSC)` (Section 9.8.6.2).
///
/// # Errors
///
/// * `EmrtdError::InvalidArgument` if `ssc` is not one block long.
pub fn secure_messaging_iv(
    suite: CipherSuite,
    ks_enc: &[u8],
    ssc: &[u8],
) -> Result<Vec<u8>, EmrtdError> {
    match suite {
        CipherSuite::Des3 => {
            check_iv("3DES secure messaging", ssc, suite.block_len())?;
            Ok(vec![0; suite.block_len()])
        }
        CipherSuite::Aes128 => encrypt_ecb::<ecb::Encryptor<aes::Aes128>>(ks_enc, ssc),
        CipherSuite::Aes192 => encrypt_ecb::<ecb::Encryptor<aes::Aes192>>(ks_enc, ssc),
        CipherSuite::Aes256 => encrypt_ecb::<ecb::Encryptor<aes::Aes256>>(ks_enc, ssc),
    }
}

/// Computes the 8 byte MAC of already padded `data`.
///
/// 3DES uses ISO/IEC 9797-1 MAC algorithm 3 (retail MAC), AES uses AES-CMAC
/// truncated to 8 bytes.
///
/// # Errors
///
/// * `EmrtdError::InvalidArgument` if `key` or `data` length is wrong.
pub fn compute_mac(
    suite: CipherSuite,
    key: &[u8],
    data: &[u8],
) -> Result<[u8; MAC_LEN], EmrtdError> {
    let full = match suite {
        CipherSuite::Des3 => retail_mac(key, data)?,
        CipherSuite::Aes128 => cmac(<Cmac<aes::Aes128> as Mac>::new_from_slice(key), data)?,
        CipherSuite::Aes192 => cmac(<Cmac<aes::Aes192> as Mac>::new_from_slice(key), data)?,
        CipherSuite::Aes256 => cmac(<Cmac<aes::Aes256> as Mac>::new_from_slice(key), data)?,
    };
    let mut mac = [0; MAC_LEN];
    mac.copy_from_slice(&full[..MAC_LEN]);
    Ok(mac)
}

fn retail_mac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    if key.len() != 16 {
        error!("Can not compute MAC, MAC key is invalid.");
        return Err(EmrtdError::InvalidArgument("retail MAC key must be 16 bytes"));
    }
    if data.is_empty() || data.len() % 8 != 0 {
        error!(
            "MAC calculation input should be a multiple of 8, but found {}",
            data.len()
        );
        return Err(EmrtdError::InvalidArgument("MAC input is not block aligned"));
    }

    let (key1, key2) = key.split_at(8);

    let mut h = encrypt_ecb::<ecb::Encryptor<des::Des>>(key1, &data[..8])?;
    for block in data[8..].chunks_exact(8) {
        xor_in_place(&mut h, block);
        h = encrypt_ecb::<ecb::Encryptor<des::Des>>(key1, &h)?;
    }

    encrypt_ecb::<ecb::Encryptor<des::Des>>(key1, &decrypt_ecb::<ecb::Decryptor<des::Des>>(key2, &h)?)
}

fn cmac<M: Mac>(mac: Result<M, InvalidLength>, data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    let mut mac = mac.map_err(|_| {
        error!("Can not compute CMAC, MAC key is invalid.");
        EmrtdError::InvalidArgument("wrong key size for CMAC")
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// XORs `b` into `a`. Both slices are expected to be the same length; extra
/// bytes of the longer one are ignored.
pub fn xor_in_place(a: &mut [u8], b: &[u8]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x ^= y;
    }
}

/// Pads the input data using ISO/IEC 9797-1 padding method 2.
///
/// <https://en.wikipedia.org/wiki/ISO/IEC_9797-1#Padding_method_2>
///
/// `block_len` must be greater than zero.
#[must_use]
pub fn pad(data: &[u8], block_len: usize) -> Vec<u8> {
    let block_len = block_len.max(1);
    let padded_len = (data.len() / block_len + 1) * block_len;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(data);
    out.push(0x80);
    out.resize(padded_len, 0x00);
    out
}

/// Removes ISO/IEC 9797-1 padding method 2.
///
/// The padding must be a single `0x80` followed by fewer than `block_len`
/// zero bytes.
///
/// # Errors
///
/// * `ProtocolError::PaddingError` if the padding is missing or longer than a block.
pub fn unpad(data: &[u8], block_len: usize) -> Result<&[u8], ProtocolError> {
    let zeros = data.iter().rev().take_while(|&&b| b == 0x00).count();
    let marker = data.len().checked_sub(zeros + 1);
    match marker {
        Some(i) if data[i] == 0x80 && zeros < block_len => Ok(&data[..i]),
        _ => {
            error!("Decrypted data has invalid padding");
            Err(ProtocolError::PaddingError)
        }
    }
}

/// Adjusts the parity bits of a DES key so every byte has odd parity.
pub fn des_adjust_parity_bits(key: &mut [u8]) {
    for byte in key {
        let mut bitmask = 1;
        let mut b = *byte;
        for _ in 0..8 {
            bitmask ^= b & 0x1;
            b >>= 1;
        }
        *byte ^= bitmask;
    }
}
