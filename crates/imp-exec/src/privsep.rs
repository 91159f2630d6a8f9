//! The privilege-separation channel: a connected pair of Unix domain
//! sockets carrying length-prefixed `Kv` blobs between the unprivileged
//! front-end and the privileged back-end.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use imp_kv::Kv;

use crate::error::ExecError;

/// One end of a privsep channel.
pub struct PrivsepChannel {
    stream: UnixStream,
}

impl PrivsepChannel {
    /// Create a connected pair: `(parent_end, child_end)`. The caller
    /// forks immediately after and hands one end to each side.
    pub fn pair() -> Result<(PrivsepChannel, PrivsepChannel), ExecError> {
        let (a, b) = UnixStream::pair().map_err(ExecError::Io)?;
        Ok((PrivsepChannel { stream: a }, PrivsepChannel { stream: b }))
    }

    /// Write `kv`'s deterministic encoding as a `u32`-length-prefixed
    /// frame.
    pub fn write_kv(&mut self, kv: &Kv) -> Result<(), ExecError> {
        let bytes = kv.encode();
        let len = bytes.len() as u32;
        self.stream.write_all(&len.to_le_bytes())?;
        self.stream.write_all(&bytes)?;
        Ok(())
    }

    /// Read one length-prefixed `Kv` frame.
    pub fn read_kv(&mut self) -> Result<Kv, ExecError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        Kv::decode(&body).map_err(ExecError::Kv)
    }

    /// Send a single readiness byte. The unprivileged side sends this
    /// after it has validated the shell is allowed, just before the
    /// privileged side is trusted to act on the request.
    pub fn send_ready(&mut self) -> Result<(), ExecError> {
        self.stream.write_all(&[1u8])?;
        Ok(())
    }

    /// Block for the peer's readiness byte. Mirrors `privsep_wait`:
    /// the privileged side refuses to proceed until the unprivileged
    /// side has confirmed it finished its own checks.
    pub fn wait_ready(&mut self) -> Result<(), ExecError> {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte)?;
        if byte[0] != 1 {
            return Err(ExecError::PrivsepHandshake(
                "unexpected readiness byte".to_string(),
            ));
        }
        Ok(())
    }
}
