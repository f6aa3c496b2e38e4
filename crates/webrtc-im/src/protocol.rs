//! Data channel frame codec
//!
//! Text messages travel as string frames. Files travel as one binary frame:
//!
//! ```text
//! [0x01][u16 BE name length][name bytes][file bytes]
//! ```
//!
//! A file must fit a single frame; chunking happens above this layer.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest frame we put on a data channel
pub const MAX_FRAME_SIZE: usize = 65_535;

pub const MSG_TYPE_FILE: u8 = 0x01;

const FILE_HEADER_LEN: usize = 3;

/// One message as it crosses the data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Bytes),
}

impl ChannelFrame {
    pub fn len(&self) -> usize {
        match self {
            ChannelFrame::Text(s) => s.len(),
            ChannelFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub name: String,
    pub data: Bytes,
}

impl FilePayload {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Size of the frame this file encodes to
    pub fn frame_len(&self) -> usize {
        FILE_HEADER_LEN + self.name.len() + self.data.len()
    }
}

/// Decoded application payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    File(FilePayload),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("file name too long: {0} bytes")]
    NameTooLong(usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

pub fn encode_file(file: &FilePayload) -> Result<Bytes, FrameError> {
    let name_len = file.name.len();
    if name_len > u16::MAX as usize {
        return Err(FrameError::NameTooLong(name_len));
    }
    let size = file.frame_len();
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size,
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u8(MSG_TYPE_FILE);
    buf.put_u16(name_len as u16);
    buf.put_slice(file.name.as_bytes());
    buf.put_slice(&file.data);
    Ok(buf.freeze())
}

pub fn encode_payload(payload: &ChannelPayload) -> Result<ChannelFrame, FrameError> {
    match payload {
        ChannelPayload::Text(text) => {
            if text.len() > MAX_FRAME_SIZE {
                return Err(FrameError::TooLarge {
                    size: text.len(),
                    limit: MAX_FRAME_SIZE,
                });
            }
            Ok(ChannelFrame::Text(text.clone()))
        }
        ChannelPayload::File(file) => encode_file(file).map(ChannelFrame::Binary),
    }
}

pub fn decode_frame(frame: ChannelFrame) -> Result<ChannelPayload, FrameError> {
    let data = match frame {
        ChannelFrame::Text(text) => return Ok(ChannelPayload::Text(text)),
        ChannelFrame::Binary(data) => data,
    };

    if data.len() < FILE_HEADER_LEN {
        return Err(FrameError::Malformed("truncated header"));
    }
    if data[0] != MSG_TYPE_FILE {
        return Err(FrameError::Malformed("unknown message type"));
    }
    let name_len = u16::from_be_bytes([data[1], data[2]]) as usize;
    let name_end = FILE_HEADER_LEN + name_len;
    if data.len() < name_end {
        return Err(FrameError::Malformed("truncated file name"));
    }
    let name = std::str::from_utf8(&data[FILE_HEADER_LEN..name_end])
        .map_err(|_| FrameError::Malformed("file name is not utf-8"))?
        .to_string();

    Ok(ChannelPayload::File(FilePayload {
        name,
        data: data.slice(name_end..),
    }))
}
