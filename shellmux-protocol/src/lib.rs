// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire messages shared between `shellmux attach` and the daemon it talks
//! to. The transport itself (a Unix stream socket, plus out-of-band fd
//! passing for exactly one message) lives in `libshellmux::transport`; this
//! crate only defines the tags and payload shapes so both ends agree on
//! them.

use std::io::{self, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};

/// The client's protocol version. Compared against the daemon's own
/// version (carried in a `Version` frame) to detect skew.
pub const PROTOCOL_VERSION: u32 = 8;

/// `IDENTIFY_FLAGS_LOGIN` marks that the shell exec in the Terminator should
/// prefix argv0 with `-`, as if the shell were a login shell.
pub const IDENTIFY_FLAGS_LOGIN: u32 = 1 << 0;
/// `IDENTIFY_FLAGS_CONTROL_CONTROL` marks machine-readable terminal control
/// mode (`%exit`-prefixed banners, `ESC \` termination).
pub const IDENTIFY_FLAGS_CONTROL_CONTROL: u32 = 1 << 1;

/// MsgType tags every frame that crosses the transport. Naming mirrors
/// spec section 6 exactly: outbound tags are things the client sends,
/// inbound tags are things the client receives. A handful of tags
/// (`Stdin`, `Exited`) are legitimately used in both directions with
/// different payload shapes depending on who is speaking.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    // --- outbound (client -> server) ---
    IdentifyFlags = 1,
    IdentifyTerm = 2,
    IdentifyTtyName = 3,
    IdentifyCwd = 4,
    IdentifyStdin = 5,
    IdentifyClientPid = 6,
    IdentifyEnviron = 7,
    IdentifyDone = 8,
    Command = 9,
    Shell = 10,
    Stdin = 11,
    Resize = 12,
    Exiting = 13,
    Wakeup = 14,
    Unlock = 15,

    // --- inbound (server -> client) ---
    Ready = 16,
    Stdout = 17,
    Stderr = 18,
    Version = 19,
    Exit = 20,
    Exited = 21,
    Shutdown = 22,
    Detach = 23,
    DetachKill = 24,
    Exec = 25,
    Suspend = 26,
    Lock = 27,
}

impl TryFrom<u8> for MsgType {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        use MsgType::*;
        Ok(match v {
            1 => IdentifyFlags,
            2 => IdentifyTerm,
            3 => IdentifyTtyName,
            4 => IdentifyCwd,
            5 => IdentifyStdin,
            6 => IdentifyClientPid,
            7 => IdentifyEnviron,
            8 => IdentifyDone,
            9 => Command,
            10 => Shell,
            11 => Stdin,
            12 => Resize,
            13 => Exiting,
            14 => Wakeup,
            15 => Unlock,
            16 => Ready,
            17 => Stdout,
            18 => Stderr,
            19 => Version,
            20 => Exit,
            21 => Exited,
            22 => Shutdown,
            23 => Detach,
            24 => DetachKill,
            25 => Exec,
            26 => Suspend,
            27 => Lock,
            other => return Err(anyhow!("unknown MsgType {}", other)),
        })
    }
}

/// A single frame on the wire.
///
/// format:
///
/// ```text
/// 1 byte:  kind tag
/// 4 bytes: little endian length prefix
/// N bytes: payload
/// ```
///
/// Exactly one kind (`IdentifyStdin`) additionally carries an ancillary file
/// descriptor out of band; that part of the contract is owned by the
/// transport, not this struct, since `Frame` itself is transport-agnostic.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'data> {
    pub kind: MsgType,
    pub buf: &'data [u8],
}

impl<'data> Frame<'data> {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.kind as u8)?;
        w.write_u32::<LittleEndian>(self.buf.len() as u32)?;
        w.write_all(self.buf)?;
        Ok(())
    }

    /// Reads one frame into `buf`, which must be large enough to hold the
    /// payload. Payloads larger than `buf` are a protocol violation and
    /// produce an error rather than a truncated read.
    pub fn read_into<R: Read>(r: &mut R, buf: &'data mut [u8]) -> anyhow::Result<Self> {
        let kind = MsgType::try_from(r.read_u8().context("reading frame kind")?)?;
        let len = r.read_u32::<LittleEndian>().context("reading frame length")? as usize;
        if len > buf.len() {
            return Err(anyhow!("frame of size {} exceeds buffer of {} bytes", len, buf.len()));
        }
        r.read_exact(&mut buf[..len]).context("reading frame payload")?;
        Ok(Frame { kind, buf: &buf[..len] })
    }
}

/// Encodes a NUL-terminated string the way every Identify* payload does.
pub fn encode_cstr(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(s.len() + 1);
    v.extend_from_slice(s.as_bytes());
    v.push(0);
    v
}

/// Decodes a single NUL-terminated string, requiring the payload to contain
/// exactly one string (i.e. end exactly at the terminating NUL). This is
/// the `strlen(data) == datalen - 1` check spec.md section 9 calls out for
/// `Exec` generalized to any single-string payload.
pub fn decode_cstr(buf: &[u8]) -> anyhow::Result<&str> {
    if buf.is_empty() || buf[buf.len() - 1] != 0 {
        return Err(anyhow!("payload missing NUL terminator"));
    }
    let s = &buf[..buf.len() - 1];
    if s.contains(&0) {
        return Err(anyhow!("payload contains an embedded NUL"));
    }
    std::str::from_utf8(s).context("decoding payload as utf8")
}

/// Decodes the two-NUL-terminated-strings-back-to-back payload carried by
/// `Exec`: command, then shell. Both must be non-empty and the payload must
/// end with NUL.
pub fn decode_exec_payload(buf: &[u8]) -> anyhow::Result<(&str, &str)> {
    if buf.is_empty() || buf[buf.len() - 1] != 0 {
        return Err(anyhow!("Exec payload missing trailing NUL"));
    }
    let mut parts = buf[..buf.len() - 1].splitn(2, |&b| b == 0);
    let cmd = parts.next().ok_or_else(|| anyhow!("Exec payload missing command"))?;
    let shell = parts.next().ok_or_else(|| anyhow!("Exec payload missing shell"))?;
    if cmd.is_empty() || shell.is_empty() {
        return Err(anyhow!("Exec payload command/shell must be non-empty"));
    }
    Ok((
        std::str::from_utf8(cmd).context("decoding exec command as utf8")?,
        std::str::from_utf8(shell).context("decoding exec shell as utf8")?,
    ))
}

/// `TtySize` is the payload of a `Resize` frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtySize {
    pub rows: u16,
    pub cols: u16,
}

impl TtySize {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(4);
        v.write_u16::<LittleEndian>(self.rows).unwrap();
        v.write_u16::<LittleEndian>(self.cols).unwrap();
        v
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() != 4 {
            return Err(anyhow!("Resize payload must be 4 bytes, got {}", buf.len()));
        }
        let mut r = io::Cursor::new(buf);
        Ok(TtySize {
            rows: r.read_u16::<LittleEndian>()?,
            cols: r.read_u16::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let data: Vec<u8> = vec![1, 2, 3, 4, 5];
        let cases = vec![
            Frame { kind: MsgType::Stdout, buf: data.as_slice() },
            Frame { kind: MsgType::IdentifyDone, buf: &data[..0] },
            Frame { kind: MsgType::Exit, buf: &data[..4] },
        ];

        let mut buf = vec![0; 256];
        for c in cases {
            let mut cursor = io::Cursor::new(vec![0; 256]);
            c.write_to(&mut cursor).expect("write to succeed");
            cursor.set_position(0);
            let round_tripped = Frame::read_into(&mut cursor, &mut buf).expect("parse to succeed");
            assert_eq!(c, round_tripped);
        }
    }

    #[test]
    fn frame_rejects_oversized_payload() {
        let mut cursor = io::Cursor::new(vec![0; 256]);
        Frame { kind: MsgType::Stdout, buf: &[0; 10] }.write_to(&mut cursor).unwrap();
        cursor.set_position(0);
        let mut tiny_buf = vec![0; 4];
        assert!(Frame::read_into(&mut cursor, &mut tiny_buf).is_err());
    }

    #[test]
    fn cstr_round_trip() {
        let encoded = encode_cstr("hello");
        assert_eq!(decode_cstr(&encoded).unwrap(), "hello");
    }

    #[test]
    fn cstr_rejects_missing_nul() {
        assert!(decode_cstr(b"hello").is_err());
    }

    #[test]
    fn exec_payload_round_trip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"ls -la");
        buf.push(0);
        buf.extend_from_slice(b"/bin/sh");
        buf.push(0);
        let (cmd, shell) = decode_exec_payload(&buf).unwrap();
        assert_eq!(cmd, "ls -la");
        assert_eq!(shell, "/bin/sh");
    }

    #[test]
    fn exec_payload_rejects_single_string() {
        // `strlen(data) == datalen - 1` would pass for this payload if the
        // second NUL were missing, so we must reject it explicitly.
        let mut buf = Vec::new();
        buf.extend_from_slice(b"ls -la");
        buf.push(0);
        assert!(decode_exec_payload(&buf).is_err());
    }

    #[test]
    fn exec_payload_rejects_empty_command() {
        let mut buf = Vec::new();
        buf.push(0);
        buf.extend_from_slice(b"/bin/sh");
        buf.push(0);
        assert!(decode_exec_payload(&buf).is_err());
    }

    #[test]
    fn tty_size_round_trip() {
        let size = TtySize { rows: 24, cols: 80 };
        let encoded = size.encode();
        assert_eq!(TtySize::decode(&encoded).unwrap(), size);
    }
}
