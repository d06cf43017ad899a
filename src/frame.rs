//! Wire format for the channel buffer (component B/C/D data model, spec §3/§6).
//!
//! Byte 0 of every channel buffer is the handoff tag. The remaining bytes
//! encode either a request frame or a response frame depending on which
//! party currently owns the buffer.

use crate::error::ChannelError;

/// The handoff tag at buffer offset 0, naming which party owns the buffer
/// next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandoffTag {
    /// Client has written a request and is waiting on the server.
    Pending = b'P',
    /// Client owns the buffer (initial state, and after a reply lands).
    Client = b'C',
    /// Server owns the buffer (never observed as a steady state on the
    /// wire by spec design -- included for completeness of the tag space).
    Server = b'S',
    /// The buffer was resized; reconnect to the new region by name.
    Invalid = b'I',
}

impl HandoffTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'P' => Some(Self::Pending),
            b'C' => Some(Self::Client),
            b'S' => Some(Self::Server),
            b'I' => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// `cmd_len: u16 BE, args_len: u32 BE, cmd, args`.
pub struct RequestFrame<'a> {
    pub cmd: &'a [u8],
    pub args: &'a [u8],
}

impl<'a> RequestFrame<'a> {
    pub const HEADER_LEN: usize = 2 + 4;

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.cmd.len() + self.args.len()
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ChannelError> {
        if out.len() < self.encoded_len() {
            return Err(ChannelError::MalformedFrame(
                "request does not fit in destination buffer".into(),
            ));
        }
        let cmd_len: u16 = self
            .cmd
            .len()
            .try_into()
            .map_err(|_| ChannelError::MalformedFrame("cmd too long".into()))?;
        let args_len: u32 = self
            .args
            .len()
            .try_into()
            .map_err(|_| ChannelError::MalformedFrame("args too long".into()))?;

        out[0..2].copy_from_slice(&cmd_len.to_be_bytes());
        out[2..6].copy_from_slice(&args_len.to_be_bytes());
        out[6..6 + self.cmd.len()].copy_from_slice(self.cmd);
        out[6 + self.cmd.len()..6 + self.cmd.len() + self.args.len()].copy_from_slice(self.args);
        Ok(())
    }

    pub fn decode(buf: &'a [u8]) -> Result<Self, ChannelError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(ChannelError::MalformedFrame("request header truncated".into()));
        }
        let cmd_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let args_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        let cmd_start = Self::HEADER_LEN;
        let args_start = cmd_start + cmd_len;
        let args_end = args_start + args_len;
        if buf.len() < args_end {
            return Err(ChannelError::MalformedFrame("request body truncated".into()));
        }
        Ok(Self {
            cmd: &buf[cmd_start..args_start],
            args: &buf[args_start..args_end],
        })
    }
}

/// `status: '+' | '-', data_len: u32 BE, data`.
pub struct ResponseFrame<'a> {
    pub ok: bool,
    pub data: &'a [u8],
}

impl<'a> ResponseFrame<'a> {
    pub const HEADER_LEN: usize = 1 + 4;

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.data.len()
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ChannelError> {
        if out.len() < self.encoded_len() {
            return Err(ChannelError::MalformedFrame(
                "response does not fit in destination buffer".into(),
            ));
        }
        let data_len: u32 = self
            .data
            .len()
            .try_into()
            .map_err(|_| ChannelError::MalformedFrame("response data too long".into()))?;

        out[0] = if self.ok { b'+' } else { b'-' };
        out[1..5].copy_from_slice(&data_len.to_be_bytes());
        out[5..5 + self.data.len()].copy_from_slice(self.data);
        Ok(())
    }

    pub fn decode(buf: &'a [u8]) -> Result<Self, ChannelError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(ChannelError::MalformedFrame("response header truncated".into()));
        }
        let ok = match buf[0] {
            b'+' => true,
            b'-' => false,
            other => return Err(ChannelError::ProtocolViolation(other)),
        };
        let data_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let data_end = Self::HEADER_LEN + data_len;
        if buf.len() < data_end {
            return Err(ChannelError::MalformedFrame("response body truncated".into()));
        }
        Ok(Self {
            ok,
            data: &buf[Self::HEADER_LEN..data_end],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let frame = RequestFrame {
            cmd: b"echo",
            args: b"blah",
        };
        let mut buf = vec![0u8; frame.encoded_len()];
        frame.encode_into(&mut buf).unwrap();

        let decoded = RequestFrame::decode(&buf).unwrap();
        assert_eq!(decoded.cmd, b"echo");
        assert_eq!(decoded.args, b"blah");
    }

    #[test]
    fn response_round_trips_ok_and_error() {
        let ok = ResponseFrame { ok: true, data: b"42" };
        let mut buf = vec![0u8; ok.encoded_len()];
        ok.encode_into(&mut buf).unwrap();
        let decoded = ResponseFrame::decode(&buf).unwrap();
        assert!(decoded.ok);
        assert_eq!(decoded.data, b"42");

        let err = ResponseFrame {
            ok: false,
            data: b"ValueError(x)",
        };
        let mut buf = vec![0u8; err.encoded_len()];
        err.encode_into(&mut buf).unwrap();
        let decoded = ResponseFrame::decode(&buf).unwrap();
        assert!(!decoded.ok);
        assert_eq!(decoded.data, b"ValueError(x)");
    }

    #[test]
    fn truncated_request_is_malformed() {
        let buf = [0u8; 3];
        assert!(RequestFrame::decode(&buf).is_err());
    }

    #[test]
    fn unknown_response_status_is_protocol_violation() {
        let mut buf = vec![0u8; 5];
        buf[0] = b'?';
        let err = ResponseFrame::decode(&buf).unwrap_err();
        assert!(matches!(err, ChannelError::ProtocolViolation(b'?')));
    }
}
