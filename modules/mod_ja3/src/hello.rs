use crate::registry::{is_grease, sends_server_name, BodyContext, Builtin};
use crate::{ClientHelloSpec, Extension, Ja3};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const SESSION_ID_LEN: usize = 32;

impl ClientHelloSpec {
    /// Renders the handshake message this spec describes.
    ///
    /// GREASE placeholders are written as fixed GREASE code points and the padding
    /// extension follows BoringSSL's rule (pad hellos between 256 and 511 bytes up to 512).
    /// The session ID is the SHA-256 of the same message encoded with an empty session ID.
    pub fn encode(&self, server_name: &str, random: &[u8; 32]) -> Bytes {
        let key_share: [u8; 32] = Sha256::new()
            .chain_update(b"x25519 key share")
            .chain_update(random)
            .finalize()
            .into();
        let mut ctx = BodyContext { server_name, key_share, padding: None };

        let unpadded = self.extension_block(&ctx);
        let unpadded_len = self.message_len(SESSION_ID_LEN, unpadded.len());
        ctx.padding = boring_padding_len(unpadded_len);
        let extensions = match ctx.padding {
            Some(_) => self.extension_block(&ctx),
            None => unpadded,
        };

        let draft = self.assemble(random, &[], &extensions);
        let session_id: [u8; SESSION_ID_LEN] = Sha256::digest(&draft).into();
        self.assemble(random, &session_id, &extensions).freeze()
    }

    /// Rebuilds the JA3 string, GREASE stripped, the way a fingerprinting service would.
    pub fn ja3(&self) -> String {
        self.fingerprint().to_string()
    }

    /// JA3 fields of this spec, GREASE stripped.
    pub fn fingerprint(&self) -> Ja3 {
        Ja3 {
            version: self.legacy_version,
            ciphers: strip_grease(&self.cipher_suites),
            extensions: self
                .extensions
                .iter()
                .map(Extension::id)
                .filter(|id| !is_grease(*id))
                .collect(),
            curves: strip_grease(self.supported_groups()),
            point_formats: self.point_formats().to_vec(),
        }
    }

    /// JA3 a peer should observe when this hello is sent to `server_name`.
    ///
    /// The server_name record is dropped for names that cannot be sent, and padding is
    /// dropped always: whether it appears depends on the final message size.
    pub fn wire_fingerprint(&self, server_name: &str) -> Ja3 {
        let mut expected = self.fingerprint();
        expected.extensions.retain(|id| {
            *id != Builtin::Padding.id()
                && (*id != Builtin::ServerName.id() || sends_server_name(server_name))
        });
        expected
    }

    fn extension_block(&self, ctx: &BodyContext<'_>) -> BytesMut {
        let mut block = BytesMut::with_capacity(512);
        let mut body = BytesMut::with_capacity(64);

        for ext in &self.extensions {
            body.clear();
            match ext {
                Extension::Builtin(Builtin::Padding) if ctx.padding.is_none() => continue,
                Extension::Builtin(Builtin::ServerName) if !sends_server_name(ctx.server_name) => {
                    continue
                }
                Extension::Builtin(builtin) => builtin.write_body(ctx, &mut body),
                Extension::SupportedGroups(groups) => {
                    body.put_u16(groups.len() as u16 * 2);
                    for group in groups {
                        body.put_u16(*group);
                    }
                }
                Extension::PointFormats(points) => {
                    body.put_u8(points.len() as u8);
                    body.put_slice(points);
                }
                Extension::Opaque { data, .. } => body.put_slice(data),
                Extension::Grease(_) => {}
            }
            block.put_u16(ext.id());
            block.put_u16(body.len() as u16);
            block.put_slice(&body);
        }
        block
    }

    fn message_len(&self, session_id_len: usize, extensions_len: usize) -> usize {
        4 + 2
            + 32
            + 1
            + session_id_len
            + 2
            + self.cipher_suites.len() * 2
            + 1
            + self.compression_methods.len()
            + 2
            + extensions_len
    }

    fn assemble(&self, random: &[u8; 32], session_id: &[u8], extensions: &[u8]) -> BytesMut {
        let len = self.message_len(session_id.len(), extensions.len());
        let mut msg = BytesMut::with_capacity(len);

        msg.put_u8(HANDSHAKE_CLIENT_HELLO);
        msg.put_uint((len - 4) as u64, 3);
        msg.put_u16(self.legacy_version);
        msg.put_slice(random);
        msg.put_u8(session_id.len() as u8);
        msg.put_slice(session_id);
        msg.put_u16(self.cipher_suites.len() as u16 * 2);
        for suite in &self.cipher_suites {
            msg.put_u16(*suite);
        }
        msg.put_u8(self.compression_methods.len() as u8);
        msg.put_slice(&self.compression_methods);
        msg.put_u16(extensions.len() as u16);
        msg.put_slice(extensions);
        msg
    }
}

impl Ja3 {
    /// Reads the JA3 fields out of a ClientHello handshake message (type byte first),
    /// GREASE removed. `None` if the bytes are not a complete ClientHello.
    pub fn from_client_hello(message: &[u8]) -> Option<Ja3> {
        let mut msg = message;
        if msg.remaining() < 4 || msg.get_u8() != HANDSHAKE_CLIENT_HELLO {
            return None;
        }
        let body_len = msg.get_uint(3) as usize;
        if msg.remaining() < body_len {
            return None;
        }
        let mut body = &msg[..body_len];

        if body.remaining() < 2 + 32 + 1 {
            return None;
        }
        let version = body.get_u16();
        body.advance(32);
        let session_id = take_u8_prefixed(&mut body)?;
        if session_id.len() > SESSION_ID_LEN {
            return None;
        }
        let mut suites = take_u16_prefixed(&mut body)?;
        let mut ciphers = Vec::with_capacity(suites.len() / 2);
        while suites.remaining() >= 2 {
            ciphers.push(suites.get_u16());
        }
        take_u8_prefixed(&mut body)?;

        let mut ja3 = Ja3 {
            version,
            ciphers: strip_grease(&ciphers),
            extensions: Vec::new(),
            curves: Vec::new(),
            point_formats: Vec::new(),
        };
        if !body.has_remaining() {
            return Some(ja3);
        }

        let mut extensions = take_u16_prefixed(&mut body)?;
        while extensions.has_remaining() {
            if extensions.remaining() < 2 {
                return None;
            }
            let id = extensions.get_u16();
            let mut data = take_u16_prefixed(&mut extensions)?;
            if is_grease(id) {
                continue;
            }
            ja3.extensions.push(id);
            match id {
                10 => {
                    let mut groups = take_u16_prefixed(&mut data)?;
                    while groups.remaining() >= 2 {
                        let group = groups.get_u16();
                        if !is_grease(group) {
                            ja3.curves.push(group);
                        }
                    }
                }
                11 => ja3.point_formats = take_u8_prefixed(&mut data)?.to_vec(),
                _ => {}
            }
        }
        Some(ja3)
    }
}

impl Display for Ja3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.version,
            dash_join(&self.ciphers),
            dash_join(&self.extensions),
            dash_join(&self.curves),
            dash_join(&self.point_formats),
        )
    }
}

fn take_u8_prefixed<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    if !buf.has_remaining() {
        return None;
    }
    let len = buf.get_u8() as usize;
    take(buf, len)
}

fn take_u16_prefixed<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    take(buf, len)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if buf.len() < len {
        return None;
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Some(head)
}

fn strip_grease(values: &[u16]) -> Vec<u16> {
    values.iter().copied().filter(|v| !is_grease(*v)).collect()
}

/// Padding body length for a hello of `unpadded_len` bytes, or `None` when no padding is sent.
fn boring_padding_len(unpadded_len: usize) -> Option<usize> {
    if unpadded_len > 0xff && unpadded_len < 0x200 {
        let len = 0x200 - unpadded_len;
        Some(if len >= 4 + 1 { len - 4 } else { 1 })
    } else {
        None
    }
}

fn dash_join<T: Display>(values: impl IntoIterator<Item = T>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}
