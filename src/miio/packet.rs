//! miIO network packet codec
//!
//! Wire format (all integers big-endian, total length >= 32 bytes):
//!
//! ```text
//! ┌───────┬────────┬────────┬──────────┬───────────┬──────────┬────────┐
//! │ Magic │ Length │ Unused │ DeviceID │ TimeStamp │ Checksum │ Data   │
//! │ u16   │ u16    │ u32    │ u32      │ u32       │ [u8; 16] │ [u8;N] │
//! └───────┴────────┴────────┴──────────┴───────────┴──────────┴────────┘
//! ```
//!
//! `Length` counts the full frame (32-byte header plus payload). The payload
//! is AES-128-CBC ciphertext on the wire and plaintext JSON after decoding.
//!
//! # Key schedule
//!
//! Per 16-byte device token `T`:
//!
//! ```text
//! K  = MD5(T)
//! IV = MD5(K ‖ T)
//! ```
//!
//! The payload is PKCS#7-padded to the AES block size (a full extra block if
//! already aligned) and the checksum is the MD5 of the whole frame with the
//! checksum field temporarily holding the raw token.
//!
//! # Hello packets
//!
//! Discovery uses a fixed 32-byte frame with every field past `Length` set to
//! `0xff`. Devices answer with their own `DeviceID` and uptime stamp, still
//! with an empty payload; some firmwares zero the checksum instead, so empty
//! frames accept either all-`0xff` or all-`0x00` there.

use crate::error::{Error, Result};
use crate::miio::timestamp::TimeStamp;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use md5::{Digest, Md5};
use std::fmt;

/// Magic bytes opening every miIO frame
pub const MAGIC: u16 = 0x2131;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 32;

/// Sentinel filling the hello packet's id/stamp fields
const HELLO_SENTINEL: u32 = 0xffff_ffff;

const AES_BLOCK_SIZE: usize = 16;
const TOKEN_SIZE: usize = 16;

/// A decoded miIO protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: u16,
    pub length: u16,
    pub unused: u32,
    pub device_id: u32,
    pub stamp: TimeStamp,
    pub checksum: [u8; 16],
    pub data: Vec<u8>,
}

impl Packet {
    /// Fixed broadcast discovery packet
    pub fn hello() -> Packet {
        Packet {
            magic: MAGIC,
            length: HEADER_SIZE as u16,
            unused: HELLO_SENTINEL,
            device_id: HELLO_SENTINEL,
            stamp: TimeStamp::from_secs(HELLO_SENTINEL),
            checksum: [0xff; 16],
            data: Vec::new(),
        }
    }

    /// Plaintext packet for the given device; the checksum is filled in
    /// during [`Packet::encode`]
    pub fn new(device_id: u32, stamp: TimeStamp, data: Vec<u8>) -> Packet {
        Packet {
            magic: MAGIC,
            length: (HEADER_SIZE + data.len()) as u16,
            unused: 0,
            device_id,
            stamp,
            checksum: [0; 16],
            data,
        }
    }

    pub fn is_hello(&self) -> bool {
        self.unused == HELLO_SENTINEL
            && self.device_id == HELLO_SENTINEL
            && self.stamp.secs() == HELLO_SENTINEL
    }

    /// Encrypt the payload and serialize the full frame
    pub fn encode(&self, token: &[u8]) -> Result<Vec<u8>> {
        let encrypted = self.encrypt(token)?;
        Ok(encrypted.frame_bytes(&encrypted.checksum))
    }

    /// Serialize the frame with an explicit checksum field
    fn frame_bytes(&self, checksum: &[u8; 16]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.unused.to_be_bytes());
        buf.extend_from_slice(&self.device_id.to_be_bytes());
        buf.extend_from_slice(&self.stamp.secs().to_be_bytes());
        buf.extend_from_slice(checksum);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// MD5 over the frame with the raw token standing in for the checksum
    fn calc_checksum(&self, token: &[u8]) -> Result<[u8; 16]> {
        if self.data.is_empty() {
            return Err(Error::InvalidDataLength);
        }
        let token: &[u8; 16] = token
            .try_into()
            .map_err(|_| Error::InvalidTokenLength)?;
        Ok(md5_digest(&[&self.frame_bytes(token)]))
    }

    /// Field and checksum validation against the raw-frame rules
    fn validate(&self, token: &[u8]) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::InvalidMagicField);
        }
        if self.length as usize != HEADER_SIZE + self.data.len() {
            return Err(Error::InvalidDataLength);
        }
        if self.data.is_empty() {
            // Hello and handshake replies: all-0xff or all-0x00 checksum.
            if self.checksum == [0xff; 16] || self.checksum == [0x00; 16] {
                return Ok(());
            }
            return Err(Error::InvalidChecksum);
        }
        if self.calc_checksum(token)? != self.checksum {
            return Err(Error::InvalidChecksum);
        }
        Ok(())
    }

    fn encrypt(&self, token: &[u8]) -> Result<Packet> {
        if token.is_empty() || self.data.is_empty() {
            return Ok(self.clone());
        }
        let token16: &[u8; 16] = token
            .try_into()
            .map_err(|_| Error::InvalidTokenLength)?;
        let (key, iv) = derive_key(token16);
        let cipher = Aes128::new((&key).into());
        let mut encrypted = pkcs7_pad(&self.data, AES_BLOCK_SIZE)?;
        cbc_encrypt(&cipher, iv, &mut encrypted);

        let mut result = Packet {
            length: (HEADER_SIZE + encrypted.len()) as u16,
            data: encrypted,
            ..self.clone()
        };
        result.checksum = result.calc_checksum(token)?;
        Ok(result)
    }

    fn decrypt(&mut self, token: &[u8]) -> Result<()> {
        if token.is_empty() || self.data.is_empty() {
            return Ok(());
        }
        let token16: &[u8; 16] = token
            .try_into()
            .map_err(|_| Error::InvalidTokenLength)?;
        if self.data.len() % AES_BLOCK_SIZE != 0 {
            return Err(Error::InvalidDataLength);
        }
        let (key, iv) = derive_key(token16);
        let cipher = Aes128::new((&key).into());
        let mut decrypted = self.data.clone();
        cbc_decrypt(&cipher, iv, &mut decrypted);
        let decrypted = pkcs7_strip(decrypted, AES_BLOCK_SIZE)?;

        self.length = (HEADER_SIZE + decrypted.len()) as u16;
        self.data = decrypted;
        self.checksum = [0; 16];
        Ok(())
    }
}

/// Decode and decrypt a raw frame
///
/// On success the returned packet carries the plaintext payload and a zeroed
/// checksum. Hello frames decode with an empty token.
pub fn decode(raw: &[u8], token: &[u8]) -> Result<Packet> {
    let mut packet = parse_frame(raw)?;
    packet.validate(token)?;
    packet.decrypt(token)?;
    Ok(packet)
}

/// Header-only peek at the DeviceID field; no crypto involved
///
/// Used to route replies to a device before any token is applied.
pub fn get_device_id(raw: &[u8]) -> Result<u32> {
    if raw.len() < HEADER_SIZE {
        return Err(Error::InvalidDataLength);
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[8..12]);
    Ok(u32::from_be_bytes(bytes))
}

fn parse_frame(raw: &[u8]) -> Result<Packet> {
    if raw.len() < HEADER_SIZE {
        return Err(Error::InvalidDataLength);
    }
    let mut checksum = [0u8; 16];
    checksum.copy_from_slice(&raw[16..32]);
    Ok(Packet {
        magic: u16::from_be_bytes([raw[0], raw[1]]),
        length: u16::from_be_bytes([raw[2], raw[3]]),
        unused: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        device_id: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        stamp: TimeStamp::from_secs(u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]])),
        checksum,
        data: raw[HEADER_SIZE..].to_vec(),
    })
}

fn derive_key(token: &[u8; TOKEN_SIZE]) -> ([u8; 16], [u8; 16]) {
    let key = md5_digest(&[token]);
    let iv = md5_digest(&[&key, token]);
    (key, iv)
}

fn md5_digest(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn cbc_encrypt(cipher: &Aes128, iv: [u8; 16], data: &mut [u8]) {
    let mut prev = iv;
    for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        for (byte, mask) in chunk.iter_mut().zip(prev.iter()) {
            *byte ^= mask;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
}

fn cbc_decrypt(cipher: &Aes128, iv: [u8; 16], data: &mut [u8]) {
    let mut prev = iv;
    for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        let mut ciphertext = [0u8; AES_BLOCK_SIZE];
        ciphertext.copy_from_slice(chunk);
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        for (byte, mask) in chunk.iter_mut().zip(prev.iter()) {
            *byte ^= mask;
        }
        prev = ciphertext;
    }
}

fn pkcs7_pad(data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if block_size <= 1 || block_size > 255 {
        return Err(Error::InvalidBlockSize);
    }
    if data.is_empty() {
        return Err(Error::InvalidDataLength);
    }
    let pad_len = block_size - data.len() % block_size;
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    Ok(padded)
}

fn pkcs7_strip(mut data: Vec<u8>, block_size: usize) -> Result<Vec<u8>> {
    if block_size <= 1 || block_size > 255 {
        return Err(Error::InvalidBlockSize);
    }
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(Error::InvalidDataLength);
    }
    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > block_size {
        return Err(Error::InvalidPadding);
    }
    if data[data.len() - pad_len..].iter().any(|&b| b as usize != pad_len) {
        return Err(Error::InvalidPadding);
    }
    data.truncate(data.len() - pad_len);
    Ok(data)
}

fn is_printable_ascii(data: &[u8]) -> bool {
    data.iter().all(|&b| (0x20..0x7f).contains(&b))
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hello() {
            return write!(f, "<hello packet>");
        }
        write!(f, "{{device_id: {:08x}, time: {}", self.device_id, self.stamp)?;
        if !self.data.is_empty() {
            if is_printable_ascii(&self.data) {
                write!(f, ", data: {}", String::from_utf8_lossy(&self.data))?;
            } else {
                write!(f, ", data: {}", hex::encode(&self.data))?;
            }
        }
        write!(f, "}}")
    }
}
