use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Frame: [code:1][len:1][payload:len]
pub const HEADER_BYTES: usize = 2;
pub const MAX_PAYLOAD_BYTES: usize = u8::MAX as usize;

const TICKET_SEPARATOR: char = '#';

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer closed")]
    Closed,
    #[error("peer closed mid-frame: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
    #[error("unknown frame code 0x{0:02x}")]
    UnknownCode(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Auth,
    Bind,
    NewDataConn,
    Close,
    ReplyCode,
    ReplyAuthContext,
    Notify,
}

impl Code {
    pub const ALL: [Code; 7] = [
        Code::Auth,
        Code::Bind,
        Code::NewDataConn,
        Code::Close,
        Code::ReplyCode,
        Code::ReplyAuthContext,
        Code::Notify,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            Code::Auth => 0x8e,
            Code::Bind => 0x8d,
            Code::NewDataConn => 0x8b,
            Code::Close => 0x87,
            Code::ReplyCode => 0x81,
            Code::ReplyAuthContext => 0x83,
            Code::Notify => 0x85,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        Code::ALL.into_iter().find(|c| c.as_u8() == b)
    }
}

/// Result carried by a `REPLY_CODE` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Ok,
    InvalidCmd,
    AuthFailed,
    ConnClose,
    InvalidPort,
}

impl ReplyCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ReplyCode::Ok => 0x00,
            ReplyCode::InvalidCmd => 0xff,
            ReplyCode::AuthFailed => 0xfe,
            ReplyCode::ConnClose => 0xfd,
            ReplyCode::InvalidPort => 0xfb,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(ReplyCode::Ok),
            0xff => Some(ReplyCode::InvalidCmd),
            0xfe => Some(ReplyCode::AuthFailed),
            0xfd => Some(ReplyCode::ConnClose),
            0xfb => Some(ReplyCode::InvalidPort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    code: Code,
    payload: Bytes,
}

impl Frame {
    pub fn new(code: Code, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { code, payload })
    }

    pub fn auth(uid: &str) -> Result<Self, ProtocolError> {
        Self::new(Code::Auth, Bytes::copy_from_slice(uid.as_bytes()))
    }

    pub fn bind(port: u16) -> Self {
        Self {
            code: Code::Bind,
            payload: Bytes::copy_from_slice(&port.to_be_bytes()),
        }
    }

    pub fn new_data_conn(ticket: &DataConnTicket) -> Result<Self, ProtocolError> {
        Self::new(Code::NewDataConn, ticket.to_string())
    }

    pub fn close() -> Self {
        Self {
            code: Code::Close,
            payload: Bytes::new(),
        }
    }

    pub fn reply_code(rc: ReplyCode) -> Self {
        Self {
            code: Code::ReplyCode,
            payload: Bytes::copy_from_slice(&[rc.as_u8()]),
        }
    }

    pub fn reply_auth_context(token: &str) -> Result<Self, ProtocolError> {
        Self::new(Code::ReplyAuthContext, Bytes::copy_from_slice(token.as_bytes()))
    }

    pub fn notify(ticket: &DataConnTicket) -> Result<Self, ProtocolError> {
        Self::new(Code::Notify, ticket.to_string())
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn len(&self) -> u8 {
        // Bounded by MAX_PAYLOAD_BYTES at construction.
        self.payload.len() as u8
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Big-endian unsigned value of the payload, or -1 when it is empty.
    ///
    /// Payloads wider than 8 bytes keep only their trailing 8 bytes.
    pub fn payload_int(&self) -> i64 {
        if self.payload.is_empty() {
            return -1;
        }
        let tail = &self.payload[self.payload.len().saturating_sub(8)..];
        let v = tail.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        v as i64
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// The result code of a `REPLY_CODE` frame.
    pub fn reply(&self) -> Option<ReplyCode> {
        if self.code != Code::ReplyCode {
            return None;
        }
        self.payload.first().copied().and_then(ReplyCode::from_u8)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_BYTES + self.payload.len());
        dst.put_u8(self.code.as_u8());
        dst.put_u8(self.len());
        dst.put_slice(&self.payload);
    }

    /// Decode one frame from the front of `src`; trailing bytes are ignored.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.is_empty() {
            return Err(ProtocolError::Closed);
        }
        let code = Code::from_u8(src[0]).ok_or(ProtocolError::UnknownCode(src[0]))?;
        if src.len() < HEADER_BYTES {
            return Err(ProtocolError::ShortRead {
                wanted: HEADER_BYTES,
                got: src.len(),
            });
        }
        let n = src[1] as usize;
        let body = &src[HEADER_BYTES..];
        if body.len() < n {
            return Err(ProtocolError::ShortRead {
                wanted: n,
                got: body.len(),
            });
        }
        Ok(Self {
            code,
            payload: Bytes::copy_from_slice(&body[..n]),
        })
    }
}

/// Correlates one `NOTIFY` with the `NEW_DATA_CONN` it triggers.
///
/// Rendered as `<context>#<pairing_id>`. A bare `<context>` (no id) is
/// accepted and paired with the oldest waiting public connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConnTicket {
    pub context: String,
    pub pairing_id: Option<u32>,
}

impl DataConnTicket {
    pub fn new(context: impl Into<String>, pairing_id: Option<u32>) -> Self {
        Self {
            context: context.into(),
            pairing_id,
        }
    }

    /// Never fails: a malformed id leaves the whole string as the context,
    /// which then misses the registry lookup.
    pub fn parse(s: &str) -> Self {
        if let Some((ctx, id)) = s.rsplit_once(TICKET_SEPARATOR) {
            if let Ok(id) = id.parse::<u32>() {
                return Self::new(ctx, Some(id));
            }
        }
        Self::new(s, None)
    }
}

impl std::fmt::Display for DataConnTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pairing_id {
            Some(id) => write!(f, "{}{}{}", self.context, TICKET_SEPARATOR, id),
            None => write!(f, "{}", self.context),
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::with_capacity(HEADER_BYTES + frame.payload.len());
    frame.encode(&mut buf);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let mut buf = BytesMut::zeroed(HEADER_BYTES);
    let got = read_full(r, &mut buf).await?;
    if got == 0 {
        return Err(ProtocolError::Closed);
    }
    // Bad headers fail here, before waiting on a payload.
    if got < HEADER_BYTES || Code::from_u8(buf[0]).is_none() {
        return Frame::decode(&buf[..got]);
    }

    let n = buf[1] as usize;
    buf.resize(HEADER_BYTES + n, 0);
    let got = read_full(r, &mut buf[HEADER_BYTES..]).await?;
    Frame::decode(&buf[..HEADER_BYTES + got])
}

// Fill `buf` until it is full or the peer closes; returns the byte count.
async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
