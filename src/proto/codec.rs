//! proto::codec
//!
//! Jute (big-endian) encoding of the supported message subset.
//!
//! Buffers and strings are an `i32` length followed by the bytes, with `-1`
//! standing for null. Vectors are an `i32` count followed by the elements.

use thiserror::Error;

use super::types::*;

/// Errors from decoding malformed payloads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("negative length {0}")]
    NegativeLength(i32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown opcode {code} (xid {xid})")]
    UnknownOpCode { xid: i32, code: i32 },

    #[error("invalid create flags {0}")]
    InvalidCreateFlags(i32),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

/// Append-only writer for jute primitives.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(u8::from(v));
        self
    }

    pub fn put_buffer(&mut self, v: &[u8]) -> &mut Self {
        self.put_i32(v.len() as i32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_string(&mut self, v: &str) -> &mut Self {
        self.put_buffer(v.as_bytes())
    }

    pub fn put_strings(&mut self, v: &[String]) -> &mut Self {
        self.put_i32(v.len() as i32);
        for s in v {
            self.put_string(s);
        }
        self
    }

    pub fn put_acls(&mut self, acls: &[Acl]) -> &mut Self {
        self.put_i32(acls.len() as i32);
        for acl in acls {
            self.put_i32(acl.perms);
            self.put_string(&acl.id.scheme);
            self.put_string(&acl.id.id);
        }
        self
    }

    pub fn put_stat(&mut self, stat: &Stat) -> &mut Self {
        self.put_i64(stat.czxid)
            .put_i64(stat.mzxid)
            .put_i64(stat.ctime)
            .put_i64(stat.mtime)
            .put_i32(stat.version)
            .put_i32(stat.cversion)
            .put_i32(stat.aversion)
            .put_i64(stat.ephemeral_owner)
            .put_i32(stat.data_length)
            .put_i32(stat.num_children)
            .put_i64(stat.pzxid)
    }
}

/// Cursor over a jute payload.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The undecoded tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_be_bytes(raw))
    }

    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.take(1)?[0] != 0)
    }

    /// A buffer; null decodes as empty.
    pub fn get_buffer(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_i32()?;
        if len == -1 {
            return Ok(Vec::new());
        }
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.get_buffer()?).map_err(|_| CodecError::InvalidUtf8)
    }

    fn get_count(&mut self) -> Result<usize, CodecError> {
        let count = self.get_i32()?;
        if count == -1 {
            return Ok(0);
        }
        if count < 0 {
            return Err(CodecError::NegativeLength(count));
        }
        Ok(count as usize)
    }

    pub fn get_strings(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.get_count()?;
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(self.get_string()?);
        }
        Ok(out)
    }

    pub fn get_acls(&mut self) -> Result<Vec<Acl>, CodecError> {
        let count = self.get_count()?;
        let mut out = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let perms = self.get_i32()?;
            let scheme = self.get_string()?;
            let id = self.get_string()?;
            out.push(Acl {
                perms,
                id: Id { scheme, id },
            });
        }
        Ok(out)
    }

    pub fn get_stat(&mut self) -> Result<Stat, CodecError> {
        Ok(Stat {
            czxid: self.get_i64()?,
            mzxid: self.get_i64()?,
            ctime: self.get_i64()?,
            mtime: self.get_i64()?,
            version: self.get_i32()?,
            cversion: self.get_i32()?,
            aversion: self.get_i32()?,
            ephemeral_owner: self.get_i64()?,
            data_length: self.get_i32()?,
            num_children: self.get_i32()?,
            pzxid: self.get_i64()?,
        })
    }
}

pub fn encode_connect_request(req: &ConnectRequest) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_i32(req.protocol_version)
        .put_i64(req.last_zxid_seen)
        .put_i32(req.timeout_ms)
        .put_i64(req.session_id)
        .put_buffer(&req.password)
        .put_bool(req.read_only);
    enc.into_bytes()
}

/// Decode a connect request; the trailing read-only flag is optional.
pub fn decode_connect_request(buf: &[u8]) -> Result<ConnectRequest, CodecError> {
    let mut dec = Decoder::new(buf);
    let protocol_version = dec.get_i32()?;
    let last_zxid_seen = dec.get_i64()?;
    let timeout_ms = dec.get_i32()?;
    let session_id = dec.get_i64()?;
    let password = dec.get_buffer()?;
    let read_only = if dec.remaining() > 0 {
        dec.get_bool()?
    } else {
        false
    };
    Ok(ConnectRequest {
        protocol_version,
        last_zxid_seen,
        timeout_ms,
        session_id,
        password,
        read_only,
    })
}

pub fn encode_connect_response(resp: &ConnectResponse) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_i32(resp.protocol_version)
        .put_i32(resp.timeout_ms)
        .put_i64(resp.session_id)
        .put_buffer(&resp.password)
        .put_bool(resp.read_only);
    enc.into_bytes()
}

pub fn decode_connect_response(buf: &[u8]) -> Result<ConnectResponse, CodecError> {
    let mut dec = Decoder::new(buf);
    let protocol_version = dec.get_i32()?;
    let timeout_ms = dec.get_i32()?;
    let session_id = dec.get_i64()?;
    let password = dec.get_buffer()?;
    let read_only = if dec.remaining() > 0 {
        dec.get_bool()?
    } else {
        false
    };
    Ok(ConnectResponse {
        protocol_version,
        timeout_ms,
        session_id,
        password,
        read_only,
    })
}

/// Encode a request header and body.
pub fn encode_request(xid: i32, request: &Request) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_i32(xid).put_i32(request.op_code().code());
    match request {
        Request::Create {
            path,
            data,
            acl,
            mode,
        } => {
            enc.put_string(path)
                .put_buffer(data)
                .put_acls(acl)
                .put_i32(mode.flags());
        }
        Request::Delete { path, version } => {
            enc.put_string(path).put_i32(*version);
        }
        Request::Exists { path, watch }
        | Request::GetData { path, watch }
        | Request::GetChildren { path, watch }
        | Request::GetChildren2 { path, watch } => {
            enc.put_string(path).put_bool(*watch);
        }
        Request::SetData {
            path,
            data,
            version,
        } => {
            enc.put_string(path).put_buffer(data).put_i32(*version);
        }
        Request::GetAcl { path } | Request::Sync { path } => {
            enc.put_string(path);
        }
        Request::SetAcl { path, acl, version } => {
            enc.put_string(path).put_acls(acl).put_i32(*version);
        }
        Request::Ping | Request::CloseSession => {}
    }
    enc.into_bytes()
}

/// Decode a request header and body into `(xid, request)`.
pub fn decode_request(buf: &[u8]) -> Result<(i32, Request), CodecError> {
    let mut dec = Decoder::new(buf);
    let xid = dec.get_i32()?;
    let code = dec.get_i32()?;
    let op = OpCode::from_code(code).ok_or(CodecError::UnknownOpCode { xid, code })?;
    let request = match op {
        OpCode::Create => {
            let path = dec.get_string()?;
            let data = dec.get_buffer()?;
            let acl = dec.get_acls()?;
            let flags = dec.get_i32()?;
            let mode = CreateMode::from_flags(flags).ok_or(CodecError::InvalidCreateFlags(flags))?;
            Request::Create {
                path,
                data,
                acl,
                mode,
            }
        }
        OpCode::Delete => Request::Delete {
            path: dec.get_string()?,
            version: dec.get_i32()?,
        },
        OpCode::Exists => Request::Exists {
            path: dec.get_string()?,
            watch: dec.get_bool()?,
        },
        OpCode::GetData => Request::GetData {
            path: dec.get_string()?,
            watch: dec.get_bool()?,
        },
        OpCode::SetData => Request::SetData {
            path: dec.get_string()?,
            data: dec.get_buffer()?,
            version: dec.get_i32()?,
        },
        OpCode::GetAcl => Request::GetAcl {
            path: dec.get_string()?,
        },
        OpCode::SetAcl => Request::SetAcl {
            path: dec.get_string()?,
            acl: dec.get_acls()?,
            version: dec.get_i32()?,
        },
        OpCode::GetChildren => Request::GetChildren {
            path: dec.get_string()?,
            watch: dec.get_bool()?,
        },
        OpCode::GetChildren2 => Request::GetChildren2 {
            path: dec.get_string()?,
            watch: dec.get_bool()?,
        },
        OpCode::Sync => Request::Sync {
            path: dec.get_string()?,
        },
        OpCode::Ping => Request::Ping,
        OpCode::CloseSession => Request::CloseSession,
    };
    Ok((xid, request))
}

/// Encode a reply header and, on success, the response body.
pub fn encode_reply(xid: i32, zxid: i64, result: &Result<Response, ZkError>) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_i32(xid).put_i64(zxid);
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            enc.put_i32(err.code());
            return enc.into_bytes();
        }
    };
    enc.put_i32(0);
    match response {
        Response::Create { path } | Response::Sync { path } => {
            enc.put_string(path);
        }
        Response::Exists { stat } | Response::SetData { stat } | Response::SetAcl { stat } => {
            enc.put_stat(stat);
        }
        Response::GetData { data, stat } => {
            enc.put_buffer(data).put_stat(stat);
        }
        Response::GetAcl { acl, stat } => {
            enc.put_acls(acl).put_stat(stat);
        }
        Response::GetChildren { children } => {
            enc.put_strings(children);
        }
        Response::GetChildren2 { children, stat } => {
            enc.put_strings(children).put_stat(stat);
        }
        Response::Delete | Response::Ping | Response::CloseSession => {}
    }
    enc.into_bytes()
}

/// Split a reply into its header and undecoded body.
pub fn decode_reply_header(buf: &[u8]) -> Result<(ReplyHeader, &[u8]), CodecError> {
    let mut dec = Decoder::new(buf);
    let header = ReplyHeader {
        xid: dec.get_i32()?,
        zxid: dec.get_i64()?,
        err: dec.get_i32()?,
    };
    Ok((header, dec.rest()))
}

/// Decode a successful reply body for the request that produced it.
pub fn decode_response(op: OpCode, body: &[u8]) -> Result<Response, CodecError> {
    let mut dec = Decoder::new(body);
    Ok(match op {
        OpCode::Create => Response::Create {
            path: dec.get_string()?,
        },
        OpCode::Delete => Response::Delete,
        OpCode::Exists => Response::Exists {
            stat: dec.get_stat()?,
        },
        OpCode::GetData => Response::GetData {
            data: dec.get_buffer()?,
            stat: dec.get_stat()?,
        },
        OpCode::SetData => Response::SetData {
            stat: dec.get_stat()?,
        },
        OpCode::GetAcl => Response::GetAcl {
            acl: dec.get_acls()?,
            stat: dec.get_stat()?,
        },
        OpCode::SetAcl => Response::SetAcl {
            stat: dec.get_stat()?,
        },
        OpCode::GetChildren => Response::GetChildren {
            children: dec.get_strings()?,
        },
        OpCode::GetChildren2 => Response::GetChildren2 {
            children: dec.get_strings()?,
            stat: dec.get_stat()?,
        },
        OpCode::Sync => Response::Sync {
            path: dec.get_string()?,
        },
        OpCode::Ping => Response::Ping,
        OpCode::CloseSession => Response::CloseSession,
    })
}

pub fn encode_watcher_event(zxid: i64, event: &WatcherEvent) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_i32(WATCH_XID)
        .put_i64(zxid)
        .put_i32(0)
        .put_i32(event.event_type.code())
        .put_i32(event.state)
        .put_string(&event.path);
    enc.into_bytes()
}

/// Decode the body that follows a reply header with xid [`WATCH_XID`].
pub fn decode_watcher_event(body: &[u8]) -> Result<WatcherEvent, CodecError> {
    let mut dec = Decoder::new(body);
    let event_type = EventType::from_code(dec.get_i32()?);
    let state = dec.get_i32()?;
    let path = dec.get_string()?;
    Ok(WatcherEvent {
        event_type,
        state,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> Stat {
        Stat {
            czxid: 7,
            mzxid: 9,
            ctime: 1_700_000_000_000,
            mtime: 1_700_000_000_500,
            version: 2,
            cversion: 3,
            aversion: 0,
            ephemeral_owner: 0x1234,
            data_length: 5,
            num_children: 1,
            pzxid: 11,
        }
    }

    #[test]
    fn create_request_layout() {
        let req = Request::Create {
            path: "/a".into(),
            data: b"hi".to_vec(),
            acl: Acl::world_all(),
            mode: CreateMode::EphemeralSequential,
        };
        let bytes = encode_request(5, &req);
        // xid, type, then the path length
        assert_eq!(&bytes[..4], &5i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &1i32.to_be_bytes());
        assert_eq!(&bytes[8..12], &2i32.to_be_bytes());
        assert_eq!(&bytes[12..14], b"/a");
        assert_eq!(&bytes[bytes.len() - 4..], &3i32.to_be_bytes());

        let (xid, decoded) = decode_request(&bytes).unwrap();
        assert_eq!(xid, 5);
        assert_eq!(decoded, req);
    }

    #[test]
    fn ping_has_no_body() {
        let bytes = encode_request(PING_XID, &Request::Ping);
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_request(&bytes).unwrap(), (PING_XID, Request::Ping));
    }

    #[test]
    fn unknown_opcode_keeps_xid() {
        let mut enc = Encoder::new();
        enc.put_i32(42).put_i32(101);
        let err = decode_request(&enc.into_bytes()).unwrap_err();
        assert_eq!(err, CodecError::UnknownOpCode { xid: 42, code: 101 });
    }

    #[test]
    fn truncated_payload_is_reported() {
        let mut bytes = encode_request(
            1,
            &Request::GetData {
                path: "/abc".into(),
                watch: true,
            },
        );
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            decode_request(&bytes),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn null_buffer_decodes_empty() {
        let mut enc = Encoder::new();
        enc.put_i32(-1);
        let bytes = enc.into_bytes();
        assert_eq!(Decoder::new(&bytes).get_buffer().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn error_reply_has_no_body() {
        let bytes = encode_reply(3, 99, &Err(ZkError::NoNode));
        let (header, body) = decode_reply_header(&bytes).unwrap();
        assert_eq!(
            header,
            ReplyHeader {
                xid: 3,
                zxid: 99,
                err: -101
            }
        );
        assert!(body.is_empty());
    }

    #[test]
    fn get_children2_reply() {
        let response = Response::GetChildren2 {
            children: vec!["x".into(), "y".into()],
            stat: sample_stat(),
        };
        let bytes = encode_reply(8, 12, &Ok(response.clone()));
        let (header, body) = decode_reply_header(&bytes).unwrap();
        assert_eq!(header.err, 0);
        assert_eq!(decode_response(OpCode::GetChildren2, body).unwrap(), response);
    }

    #[test]
    fn connect_request_without_read_only_flag() {
        let req = ConnectRequest::new_session(10_000);
        let mut bytes = encode_connect_request(&req);
        bytes.pop();
        let decoded = decode_connect_request(&bytes).unwrap();
        assert_eq!(decoded.timeout_ms, 10_000);
        assert!(!decoded.read_only);
    }

    #[test]
    fn watcher_event_layout() {
        let event = WatcherEvent::new(EventType::NodeChildrenChanged, "/a");
        let bytes = encode_watcher_event(-1, &event);
        let (header, body) = decode_reply_header(&bytes).unwrap();
        assert_eq!(header.xid, WATCH_XID);
        assert_eq!(decode_watcher_event(body).unwrap(), event);
    }
}
