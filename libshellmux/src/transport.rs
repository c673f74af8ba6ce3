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

//! The framed, bidirectional channel described in spec section 4.2.
//!
//! We model the transport as a `SOCK_SEQPACKET` Unix domain socket rather
//! than the `SOCK_STREAM` the teacher uses for its own control channel.
//! Spec section 4.2 describes the transport as "a reliable length-delimited
//! datagram channel ... with out-of-band fd passing"; a seqpacket socket
//! gives us that literally (one `sendmsg` call is one message, delivered
//! whole to the matching `recvmsg`), so we don't need to reassemble frames
//! out of a byte stream the way a `SOCK_STREAM` implementation would. See
//! DESIGN.md for the full rationale.

use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::Path,
};

use anyhow::{anyhow, Context};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::{
        socket::{self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr},
        uio::{IoSlice, IoSliceMut},
    },
};
use shellmux_protocol::{Frame, MsgType};

use crate::consts::MAX_FRAME_PAYLOAD;

/// A frame read off the transport, plus whatever ancillary fd rode along
/// with it. Only `IdentifyStdin` ever carries one.
pub struct RecvFrame {
    pub kind: MsgType,
    pub payload: Vec<u8>,
    pub fd: Option<OwnedFd>,
}

pub struct Transport {
    fd: OwnedFd,
}

impl Transport {
    /// Connects a fresh `SOCK_SEQPACKET` socket to `path`. Does not set
    /// non-blocking mode; `SocketBringup` does that once bring-up succeeds.
    pub fn connect<P: AsRef<Path>>(path: P) -> nix::Result<OwnedFd> {
        let fd = socket::socket(AddressFamily::Unix, SockType::SeqPacket, SockFlag::empty(), None)?;
        let addr = UnixAddr::new(path.as_ref())?;
        socket::connect(fd.as_raw_fd(), &addr)?;
        Ok(fd)
    }

    /// Wraps an already-connected socket fd, handed back by `SocketBringup`
    /// or by the `ServerStarter` collaborator after a fresh daemon spawn.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Transport { fd }
    }

    pub fn set_nonblocking(&self) -> anyhow::Result<()> {
        let flags = fcntl(self.fd.as_raw_fd(), FcntlArg::F_GETFL).context("getting socket flags")?;
        let mut flags = OFlag::from_bits_truncate(flags);
        flags.insert(OFlag::O_NONBLOCK);
        fcntl(self.fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).context("setting O_NONBLOCK")?;
        Ok(())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn send(&self, kind: MsgType, payload: &[u8]) -> anyhow::Result<()> {
        self.send_with_fd(kind, payload, None)
    }

    /// Sends one frame, optionally with a single ancillary fd attached.
    /// Only `IdentifyPhase::send_stdin` passes `Some`; this is the "at most
    /// one fd per send" property spec section 8 requires.
    pub fn send_with_fd(&self, kind: MsgType, payload: &[u8], fd: Option<RawFd>) -> anyhow::Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(anyhow!("payload of {} bytes exceeds the {} byte frame limit", payload.len(), MAX_FRAME_PAYLOAD));
        }
        let mut buf = Vec::with_capacity(payload.len() + 5);
        Frame { kind, buf: payload }.write_to(&mut buf).context("encoding frame")?;

        let iov = [IoSlice::new(&buf)];
        let fds = fd.map(|f| [f]);
        let cmsgs: Vec<ControlMessage> = match &fds {
            Some(fds) => vec![ControlMessage::ScmRights(fds)],
            None => Vec::new(),
        };

        loop {
            match socket::sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(anyhow!("sendmsg on transport: {}", e)),
            }
        }
    }

    /// Reads one frame. `Ok(None)` is the frame-terminator sentinel (peer
    /// closed the transport), which the state machine surfaces as
    /// `LostServer`. `Err(EWOULDBLOCK)`-equivalent returns propagate as a
    /// plain `Ok(None)`-free error path is deliberately not collapsed here;
    /// callers in the event loop only invoke `recv` once `poll` has marked
    /// the fd readable, so `EAGAIN` should not normally occur.
    pub fn recv(&self) -> anyhow::Result<Option<RecvFrame>> {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD + 5];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let mut iov = [IoSliceMut::new(&mut buf)];

        let msg = loop {
            match socket::recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Ok(m) => break m,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(anyhow!("recvmsg on transport: {}", e)),
            }
        };

        if msg.bytes == 0 {
            return Ok(None);
        }

        let mut fd = None;
        for cmsg in msg.cmsgs().context("reading ancillary data")? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(raw) = fds.into_iter().next() {
                    fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }

        let received = &buf[..msg.bytes];
        let mut payload_buf = vec![0u8; MAX_FRAME_PAYLOAD];
        let frame = Frame::read_into(&mut &received[..], &mut payload_buf)
            .context("decoding frame from seqpacket message")?;
        Ok(Some(RecvFrame { kind: frame.kind, payload: frame.buf.to_vec(), fd }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn socketpair() -> (Transport, Transport) {
        let (a, b) = nix::sys::socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .expect("socketpair");
        (Transport::from_fd(a), Transport::from_fd(b))
    }

    #[test]
    fn send_recv_round_trip() {
        let (a, b) = socketpair();
        a.send(MsgType::IdentifyDone, &[]).expect("send");
        let got = b.recv().expect("recv").expect("frame present");
        assert_eq!(got.kind, MsgType::IdentifyDone);
        assert!(got.payload.is_empty());
        assert!(got.fd.is_none());
    }

    #[test]
    fn send_recv_carries_fd() {
        let (a, b) = socketpair();
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        a.send_with_fd(MsgType::IdentifyStdin, &[], Some(r.as_raw_fd())).expect("send with fd");
        drop(r);
        let got = b.recv().expect("recv").expect("frame present");
        assert_eq!(got.kind, MsgType::IdentifyStdin);
        assert!(got.fd.is_some());
    }

    #[test]
    fn closed_peer_yields_none() {
        let (a, b) = socketpair();
        drop(a);
        let got = b.recv().expect("recv should not error");
        assert!(got.is_none());
    }
}
