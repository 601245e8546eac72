//! Elevation Channel (`spec.md` §4.8): the length-prefixed, typed-message
//! pipe between the unprivileged parent process and the privileged elevated
//! child it launches for Apply.
//!
//! Message authentication borrows the HMAC-SHA256 idiom used elsewhere in
//! this workspace for verifying an inbound payload against a shared secret —
//! here the "payload" is the child's first message on the pipe, and the
//! "secret" is a one-time token the parent generates and passes to the child
//! via its elevated-launch command line instead of a webhook header.

use std::io::{self, Read, Write};

use anyhow::{Context, Result, bail};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Reserved message types on the elevation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Hello = 0,
    Log = 1,
    Progress = 2,
    ElevatedOperation = 3,
    Complete = 4,
    Terminate = 5,
}

impl MessageType {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => MessageType::Hello,
            1 => MessageType::Log,
            2 => MessageType::Progress,
            3 => MessageType::ElevatedOperation,
            4 => MessageType::Complete,
            5 => MessageType::Terminate,
            other => bail!("unknown elevation message type {other}"),
        })
    }
}

/// A single framed message: `{u32 message_type, u32 payload_length, payload}`.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

const MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

/// Generate a fresh one-time secret the parent passes to the elevated child on its command
/// line. 32 random bytes, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Sign `payload` with `secret`, returning the hex-encoded HMAC-SHA256.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time-equivalent verification (via `hmac::Mac::verify_slice`) of a signature the
/// child attached to its `Hello` message, confirming it was launched by this parent and not by
/// an unrelated process that guessed the pipe name.
pub fn verify(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// One half of a framed, bidirectional elevation channel over any `Read + Write` transport
/// (a named pipe on Windows, a `UnixStream` elsewhere, or the in-memory `DuplexChannel` below).
pub struct Channel<T: Read + Write> {
    transport: T,
}

impl<T: Read + Write> Channel<T> {
    pub fn new(transport: T) -> Self {
        Channel { transport }
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        if message.payload.len() as u64 > MAX_PAYLOAD_BYTES as u64 {
            bail!("elevation message payload too large: {} bytes", message.payload.len());
        }
        self.transport.write_all(&(message.message_type as u32).to_le_bytes()).context("failed to write message type")?;
        self.transport
            .write_all(&(message.payload.len() as u32).to_le_bytes())
            .context("failed to write payload length")?;
        self.transport.write_all(&message.payload).context("failed to write payload")?;
        self.transport.flush().context("failed to flush elevation channel")?;
        Ok(())
    }

    /// Read the next framed message, or `Ok(None)` on clean EOF — the cancellation signal this
    /// channel uses instead of a dedicated cancel message (`spec.md` §4.8).
    pub fn recv(&mut self) -> Result<Option<Message>> {
        let mut type_buf = [0u8; 4];
        match self.transport.read_exact(&mut type_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("failed to read elevation message type"),
        }
        let message_type = MessageType::from_u32(u32::from_le_bytes(type_buf))?;

        let mut len_buf = [0u8; 4];
        self.transport.read_exact(&mut len_buf).context("failed to read elevation payload length")?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_PAYLOAD_BYTES {
            bail!("elevation message payload too large: {len} bytes");
        }

        let mut payload = vec![0u8; len as usize];
        self.transport.read_exact(&mut payload).context("failed to read elevation payload")?;

        Ok(Some(Message { message_type, payload }))
    }

    /// Perform the parent side of the `Hello` handshake: send the shared secret's signature
    /// over a nonce, and accept the connection only if the child echoes a matching signature
    /// back over the same nonce. Returns `Err(EngineError::PipeDisconnect)`-equivalent via the
    /// `anyhow` error chain if the handshake does not complete.
    pub fn parent_handshake(&mut self, secret: &str, nonce: &[u8]) -> Result<()> {
        self.send(&Message { message_type: MessageType::Hello, payload: nonce.to_vec() })?;
        let reply = self.recv()?.context("elevated child disconnected during handshake")?;
        if reply.message_type != MessageType::Hello {
            bail!("expected Hello reply, got {:?}", reply.message_type);
        }
        let signature_hex = String::from_utf8(reply.payload).context("handshake reply is not valid UTF-8")?;
        if !verify(secret, nonce, &signature_hex) {
            bail!("elevated child failed handshake signature verification");
        }
        Ok(())
    }

    /// Perform the child side: wait for the parent's nonce, sign it with the secret passed on
    /// the command line, and reply.
    pub fn child_handshake(&mut self, secret: &str) -> Result<()> {
        let hello = self.recv()?.context("parent disconnected before sending Hello")?;
        if hello.message_type != MessageType::Hello {
            bail!("expected Hello from parent, got {:?}", hello.message_type);
        }
        let signature = sign(secret, &hello.payload);
        self.send(&Message { message_type: MessageType::Hello, payload: signature.into_bytes() })
    }
}

/// In-memory duplex transport for tests: two `Channel`s that write into each other's read
/// buffer, avoiding a real named pipe or socket in unit tests.
pub struct DuplexChannel {
    read_buf: std::collections::VecDeque<u8>,
    peer_buf: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<u8>>>,
    write_buf: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<u8>>>,
}

impl DuplexChannel {
    pub fn pair() -> (Channel<DuplexChannel>, Channel<DuplexChannel>) {
        let a_to_b = std::sync::Arc::new(std::sync::Mutex::new(std::collections::VecDeque::new()));
        let b_to_a = std::sync::Arc::new(std::sync::Mutex::new(std::collections::VecDeque::new()));

        let a = DuplexChannel {
            read_buf: std::collections::VecDeque::new(),
            peer_buf: std::sync::Arc::clone(&b_to_a),
            write_buf: std::sync::Arc::clone(&a_to_b),
        };
        let b = DuplexChannel {
            read_buf: std::collections::VecDeque::new(),
            peer_buf: std::sync::Arc::clone(&a_to_b),
            write_buf: std::sync::Arc::clone(&b_to_a),
        };
        (Channel::new(a), Channel::new(b))
    }
}

impl Read for DuplexChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.read_buf.len() < buf.len() {
            let mut incoming = self.peer_buf.lock().expect("duplex channel mutex poisoned");
            if incoming.is_empty() {
                if self.read_buf.is_empty() {
                    return Ok(0);
                }
                break;
            }
            self.read_buf.extend(incoming.drain(..));
        }
        let n = buf.len().min(self.read_buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.read_buf.pop_front().expect("checked length above");
        }
        Ok(n)
    }
}

impl Write for DuplexChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_buf.lock().expect("duplex channel mutex poisoned").extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
