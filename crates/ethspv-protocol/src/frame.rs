//! RLPx frame codec: AES-256-CTR encrypted, keccak-MACed frames carrying
//! `RLP(message_code) || payload` bodies.
//!
//! Wire format per frame:
//!
//! ```text
//! header      16 bytes  u24_be(body_size) || RLP([0, context_id?, total_size?]) || zero pad
//! header-mac  16 bytes
//! body        body_size bytes, zero padded to a multiple of 16
//! body-mac    16 bytes
//! ```
//!
//! Messages larger than the chunk size are split across frames that share a
//! context id and declare the total payload size.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use bytes::{BufMut, Bytes, BytesMut};
use sha3::{Digest, Keccak256};
use tokio_util::codec::{Decoder, Encoder};

use crate::params::CURRENT_PARAMS;
use crate::rlp::{self, Encodable, Rlp};
use crate::ProtocolError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Encrypted header size in bytes.
const HEADER_SIZE: usize = 16;

/// Size of each MAC in bytes.
const MAC_SIZE: usize = 16;

/// Body bytes are padded to this block size.
const BLOCK_SIZE: usize = 16;

/// Largest body size representable in the 24-bit header field.
const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

fn padded(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// A whole message as carried by the transport: code plus RLP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub code: u64,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(code: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }
}

/// Session secrets established by the handshake.
#[derive(Clone)]
pub struct Secrets {
    pub aes: [u8; 32],
    pub mac: [u8; 32],
    pub egress_mac: Keccak256,
    pub ingress_mac: Keccak256,
    /// Session resumption token; carried but not used by the codec.
    pub token: [u8; 32],
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

/// Running keccak MAC for one direction.
struct MacState {
    cipher: Aes256,
    hasher: Keccak256,
}

impl MacState {
    fn new(mac_secret: &[u8; 32], hasher: Keccak256) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(mac_secret)),
            hasher,
        }
    }

    fn digest(&self) -> [u8; MAC_SIZE] {
        let full = self.hasher.clone().finalize();
        let mut out = [0u8; MAC_SIZE];
        out.copy_from_slice(&full[..MAC_SIZE]);
        out
    }

    fn absorb_seed(&mut self, seed: &[u8; MAC_SIZE]) -> [u8; MAC_SIZE] {
        let mut block = GenericArray::clone_from_slice(&self.digest());
        self.cipher.encrypt_block(&mut block);
        for (b, s) in block.iter_mut().zip(seed) {
            *b ^= s;
        }
        self.hasher.update(block);
        self.digest()
    }

    fn header_mac(&mut self, header_cipher: &[u8; HEADER_SIZE]) -> [u8; MAC_SIZE] {
        self.absorb_seed(header_cipher)
    }

    fn body_mac(&mut self, body_cipher: &[u8]) -> [u8; MAC_SIZE] {
        self.hasher.update(body_cipher);
        let seed = self.digest();
        self.absorb_seed(&seed)
    }
}

fn macs_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Decrypted header fields of the frame currently being read.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    size: usize,
    context_id: Option<u64>,
    total_size: Option<usize>,
}

/// A chunked message being put back together.
struct Reassembly {
    context_id: u64,
    code: u64,
    total_size: usize,
    buffer: BytesMut,
}

/// Encrypting frame codec for one RLPx session.
pub struct FrameCodec {
    egress_aes: Aes256Ctr,
    ingress_aes: Aes256Ctr,
    egress_mac: MacState,
    ingress_mac: MacState,
    chunk_size: usize,
    max_message_size: usize,
    next_context_id: u64,
    pending_header: Option<FrameHeader>,
    reassembly: Option<Reassembly>,
}

impl FrameCodec {
    pub fn new(secrets: Secrets) -> Self {
        Self::with_limits(
            secrets,
            CURRENT_PARAMS.frame_chunk_bytes,
            CURRENT_PARAMS.max_message_bytes,
        )
    }

    pub fn with_limits(secrets: Secrets, chunk_size: usize, max_message_size: usize) -> Self {
        let iv = [0u8; 16];
        Self {
            egress_aes: Aes256Ctr::new(
                GenericArray::from_slice(&secrets.aes),
                GenericArray::from_slice(&iv),
            ),
            ingress_aes: Aes256Ctr::new(
                GenericArray::from_slice(&secrets.aes),
                GenericArray::from_slice(&iv),
            ),
            egress_mac: MacState::new(&secrets.mac, secrets.egress_mac),
            ingress_mac: MacState::new(&secrets.mac, secrets.ingress_mac),
            chunk_size: chunk_size.clamp(1, MAX_FRAME_SIZE - 9),
            max_message_size,
            next_context_id: 1,
            pending_header: None,
            reassembly: None,
        }
    }

    /// Encrypt and MAC one frame. `declared_size` is written into the header
    /// and is normally `body.len()`.
    fn write_frame(
        &mut self,
        header_data: &Rlp,
        body: &[u8],
        declared_size: usize,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let header_rlp = header_data.encoded();
        if 3 + header_rlp.len() > HEADER_SIZE {
            return Err(ProtocolError::Frame("header data too long".into()));
        }
        if declared_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: declared_size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut header = [0u8; HEADER_SIZE];
        header[..3].copy_from_slice(&(declared_size as u32).to_be_bytes()[1..]);
        header[3..3 + header_rlp.len()].copy_from_slice(&header_rlp);
        self.egress_aes.apply_keystream(&mut header);
        let header_mac = self.egress_mac.header_mac(&header);

        let mut padded_body = vec![0u8; padded(body.len())];
        padded_body[..body.len()].copy_from_slice(body);
        self.egress_aes.apply_keystream(&mut padded_body);
        let body_mac = self.egress_mac.body_mac(&padded_body);

        dst.reserve(HEADER_SIZE + MAC_SIZE + padded_body.len() + MAC_SIZE);
        dst.put_slice(&header);
        dst.put_slice(&header_mac);
        dst.put_slice(&padded_body);
        dst.put_slice(&body_mac);
        Ok(())
    }

    /// Read, authenticate and decrypt the next header if enough bytes are buffered.
    fn read_header(&mut self, src: &mut BytesMut) -> Result<Option<FrameHeader>, ProtocolError> {
        if let Some(header) = self.pending_header {
            return Ok(Some(header));
        }
        if src.len() < HEADER_SIZE + MAC_SIZE {
            return Ok(None);
        }

        let raw = src.split_to(HEADER_SIZE + MAC_SIZE);
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&raw[..HEADER_SIZE]);
        let expected = self.ingress_mac.header_mac(&header);
        if !macs_equal(&expected, &raw[HEADER_SIZE..]) {
            return Err(ProtocolError::MacMismatch);
        }
        self.ingress_aes.apply_keystream(&mut header);

        let size = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        let (data, _) = rlp::decode(&header[3..])?;
        let fields = data.as_list()?;
        let context_id = fields.get(1).map(Rlp::as_u64).transpose()?;
        let total_size = fields
            .get(2)
            .map(|f| f.as_u64().map(|v| v as usize))
            .transpose()?;

        let parsed = FrameHeader {
            size,
            context_id,
            total_size,
        };
        self.pending_header = Some(parsed);
        Ok(Some(parsed))
    }

    /// Fold one decoded chunk into the message being reassembled.
    fn accept_chunk(
        &mut self,
        header: FrameHeader,
        code: u64,
        chunk: &[u8],
    ) -> Result<Option<RawMessage>, ProtocolError> {
        let (context_id, total_size) = match (header.context_id, header.total_size) {
            (Some(ctx), Some(total)) if ctx != 0 => (ctx, total),
            _ => {
                if self.reassembly.is_some() {
                    return Err(ProtocolError::Frame(
                        "single frame received inside an open context".into(),
                    ));
                }
                if chunk.len() > self.max_message_size {
                    return Err(ProtocolError::MessageTooLarge {
                        size: chunk.len(),
                        max: self.max_message_size,
                    });
                }
                return Ok(Some(RawMessage::new(code, Bytes::copy_from_slice(chunk))));
            }
        };

        if total_size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: total_size,
                max: self.max_message_size,
            });
        }

        let entry = match self.reassembly.take() {
            Some(open) if open.context_id != context_id => {
                return Err(ProtocolError::Frame(format!(
                    "context {context_id} started before context {} completed",
                    open.context_id
                )));
            }
            Some(open) => {
                if open.code != code || open.total_size != total_size {
                    return Err(ProtocolError::Frame(format!(
                        "chunk of context {context_id} disagrees with its first chunk"
                    )));
                }
                open
            }
            None => Reassembly {
                context_id,
                code,
                total_size,
                buffer: BytesMut::with_capacity(total_size),
            },
        };

        let mut entry = entry;
        if entry.buffer.len() + chunk.len() > entry.total_size {
            return Err(ProtocolError::Frame(format!(
                "context {context_id} overflows declared size {}",
                entry.total_size
            )));
        }
        entry.buffer.extend_from_slice(chunk);

        if entry.buffer.len() == entry.total_size {
            tracing::trace!(context_id, size = entry.total_size, "frame: message reassembled");
            return Ok(Some(RawMessage::new(entry.code, entry.buffer.freeze())));
        }
        self.reassembly = Some(entry);
        Ok(None)
    }
}

impl Decoder for FrameCodec {
    type Item = RawMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(header) = self.read_header(src)? else {
                return Ok(None);
            };

            let body_len = padded(header.size);
            if src.len() < body_len + MAC_SIZE {
                src.reserve(body_len + MAC_SIZE - src.len());
                return Ok(None);
            }
            self.pending_header = None;

            let mut body = src.split_to(body_len + MAC_SIZE);
            let mac = body.split_off(body_len);
            let expected = self.ingress_mac.body_mac(&body);
            if !macs_equal(&expected, &mac) {
                return Err(ProtocolError::MacMismatch);
            }
            self.ingress_aes.apply_keystream(&mut body);
            body.truncate(header.size);

            let (code_item, consumed) = rlp::decode(&body)
                .map_err(|_| ProtocolError::Frame("frame body shorter than message code".into()))?;
            let code = code_item.as_u64()?;

            if let Some(message) = self.accept_chunk(header, code, &body[consumed..])? {
                return Ok(Some(message));
            }
            // Partial chunked message: keep reading frames already buffered.
        }
    }
}

impl Encoder<RawMessage> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = item.payload.len();
        if total > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }

        let code = item.code.rlp_bytes();

        if total <= self.chunk_size {
            let mut body = Vec::with_capacity(code.len() + total);
            body.extend_from_slice(&code);
            body.extend_from_slice(&item.payload);
            let size = body.len();
            return self.write_frame(&Rlp::list(vec![0u64.to_rlp()]), &body, size, dst);
        }

        let context_id = self.next_context_id;
        self.next_context_id += 1;
        let header_data = Rlp::list(vec![0u64.to_rlp(), context_id.to_rlp(), total.to_rlp()]);

        for chunk in item.payload.chunks(self.chunk_size) {
            let mut body = Vec::with_capacity(code.len() + chunk.len());
            body.extend_from_slice(&code);
            body.extend_from_slice(chunk);
            let size = body.len();
            self.write_frame(&header_data, &body, size, dst)?;
        }
        tracing::trace!(context_id, total, "frame: message chunked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrored secrets for two ends of one session.
    fn paired_secrets() -> (Secrets, Secrets) {
        let mut a = Keccak256::new();
        a.update(b"initiator egress");
        let mut b = Keccak256::new();
        b.update(b"responder egress");
        let local = Secrets {
            aes: [0x11; 32],
            mac: [0x22; 32],
            egress_mac: a.clone(),
            ingress_mac: b.clone(),
            token: [0x33; 32],
        };
        let remote = Secrets {
            aes: [0x11; 32],
            mac: [0x22; 32],
            egress_mac: b,
            ingress_mac: a,
            token: [0x33; 32],
        };
        (local, remote)
    }

    fn codecs(chunk: usize, max: usize) -> (FrameCodec, FrameCodec) {
        let (l, r) = paired_secrets();
        (
            FrameCodec::with_limits(l, chunk, max),
            FrameCodec::with_limits(r, chunk, max),
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let (mut tx, mut rx) = codecs(1024, 1 << 20);
        let msg = RawMessage::new(0x10, vec![0xc2, 0x01, 0x02]);

        let mut buf = BytesMut::new();
        tx.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 16 + 16 + 16 + 16);

        let decoded = rx.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_messages_keep_stream_state() {
        let (mut tx, mut rx) = codecs(1024, 1 << 20);
        let mut buf = BytesMut::new();
        for i in 0..5u64 {
            tx.encode(RawMessage::new(i, vec![0x80 + i as u8]), &mut buf)
                .unwrap();
        }
        for i in 0..5u64 {
            let decoded = rx.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.code, i);
            assert_eq!(decoded.payload.as_ref(), &[0x80 + i as u8]);
        }
        assert!(rx.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame() {
        let (mut tx, mut rx) = codecs(1024, 1 << 20);
        let mut buf = BytesMut::new();
        tx.encode(RawMessage::new(3, vec![0u8; 100]), &mut buf).unwrap();

        let rest = buf.split_off(40);
        assert!(rx.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&rest);
        let decoded = rx.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 100);
    }

    #[test]
    fn test_chunked_message_reassembles() {
        let (mut tx, mut rx) = codecs(64, 1 << 20);
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let msg = RawMessage::new(0x13, payload);

        let mut buf = BytesMut::new();
        tx.encode(msg.clone(), &mut buf).unwrap();
        // five chunks of at most 64 bytes each
        assert!(buf.len() > 5 * 64);

        let decoded = rx.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_tampered_body_is_mac_mismatch() {
        let (mut tx, mut rx) = codecs(1024, 1 << 20);
        let mut buf = BytesMut::new();
        tx.encode(RawMessage::new(1, vec![1, 2, 3]), &mut buf).unwrap();
        buf[HEADER_SIZE + MAC_SIZE] ^= 0x01;
        assert!(matches!(rx.decode(&mut buf), Err(ProtocolError::MacMismatch)));
    }

    #[test]
    fn test_tampered_header_is_mac_mismatch() {
        let (mut tx, mut rx) = codecs(1024, 1 << 20);
        let mut buf = BytesMut::new();
        tx.encode(RawMessage::new(1, vec![1, 2, 3]), &mut buf).unwrap();
        buf[0] ^= 0x80;
        let err = rx.decode(&mut buf).unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn test_declared_size_smaller_than_body() {
        let (mut tx, mut rx) = codecs(1024, 1 << 20);
        let mut body = 0x05u64.rlp_bytes();
        body.extend_from_slice(&[0xab; 40]);

        let mut buf = BytesMut::new();
        tx.write_frame(&Rlp::list(vec![0u64.to_rlp()]), &body, 10, &mut buf)
            .unwrap();
        assert!(matches!(rx.decode(&mut buf), Err(ProtocolError::MacMismatch)));
    }

    #[test]
    fn test_message_above_limit_rejected_on_encode() {
        let (mut tx, _) = codecs(64, 256);
        let mut buf = BytesMut::new();
        let err = tx
            .encode(RawMessage::new(1, vec![0u8; 257]), &mut buf)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { size: 257, max: 256 }));
    }

    #[test]
    fn test_declared_total_above_limit_rejected() {
        let (mut tx, mut rx) = codecs(64, 1024);
        let mut body = 0x02u64.rlp_bytes();
        body.extend_from_slice(&[0u8; 32]);
        let header = Rlp::list(vec![0u64.to_rlp(), 1u64.to_rlp(), 4096u64.to_rlp()]);

        let mut buf = BytesMut::new();
        let size = body.len();
        tx.write_frame(&header, &body, size, &mut buf).unwrap();
        assert!(matches!(
            rx.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge { size: 4096, max: 1024 })
        ));
    }

    #[test]
    fn test_chunk_with_different_code_rejected() {
        let (mut tx, mut rx) = codecs(64, 1024);
        let header = Rlp::list(vec![0u64.to_rlp(), 1u64.to_rlp(), 20u64.to_rlp()]);
        let mut buf = BytesMut::new();

        let mut first = 0x02u64.rlp_bytes();
        first.extend_from_slice(&[0u8; 10]);
        let size = first.len();
        tx.write_frame(&header, &first, size, &mut buf).unwrap();

        let mut second = 0x03u64.rlp_bytes();
        second.extend_from_slice(&[0u8; 10]);
        let size = second.len();
        tx.write_frame(&header, &second, size, &mut buf).unwrap();

        assert!(matches!(rx.decode(&mut buf), Err(ProtocolError::Frame(_))));
    }

    #[test]
    fn test_new_context_mid_context_rejected() {
        let (mut tx, mut rx) = codecs(64, 1024);
        let mut buf = BytesMut::new();
        let mut body = 0x02u64.rlp_bytes();
        body.extend_from_slice(&[0u8; 10]);
        let size = body.len();

        let first = Rlp::list(vec![0u64.to_rlp(), 1u64.to_rlp(), 20u64.to_rlp()]);
        tx.write_frame(&first, &body, size, &mut buf).unwrap();
        let second = Rlp::list(vec![0u64.to_rlp(), 2u64.to_rlp(), 20u64.to_rlp()]);
        tx.write_frame(&second, &body, size, &mut buf).unwrap();

        assert!(matches!(rx.decode(&mut buf), Err(ProtocolError::Frame(_))));
    }

    #[test]
    fn test_chunk_overflow_rejected() {
        let (mut tx, mut rx) = codecs(64, 1024);
        let header = Rlp::list(vec![0u64.to_rlp(), 1u64.to_rlp(), 15u64.to_rlp()]);
        let mut body = 0x02u64.rlp_bytes();
        body.extend_from_slice(&[0u8; 10]);
        let size = body.len();

        let mut buf = BytesMut::new();
        tx.write_frame(&header, &body, size, &mut buf).unwrap();
        tx.write_frame(&header, &body, size, &mut buf).unwrap();
        assert!(matches!(rx.decode(&mut buf), Err(ProtocolError::Frame(_))));
    }
}
