/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! Wire format (all integers big-endian):
//!
//! ```text
//! update: u64 ok_expiry | u32 sync_id | u32 update_id | u8 type
//!   type=0 Empty, 1 Flush: no body
//!   type=2 Start:  u32 resync_id          (update_id must be 1)
//!   type=3 Insert: u8 klen | key | u8 vlen | val
//!   type=4 Delete: u8 klen | key | u32 delete_id
//! ack: u32 sync_id | u32 update_id
//! ```

use thiserror::Error;

use sm_types::{Error as SmError, ErrorKind, Result};

/// Keys and values are capped at one length byte.
pub const KVPSYNC_MAX_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PktDecodeError {
    #[error("packet truncated")]
    Truncated,
    #[error("invalid packet type {0}")]
    InvalidType(u8),
    #[error("invalid update_id in start packet")]
    InvalidStart,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateBody {
    Empty,
    Flush,
    Start { resync_id: u32 },
    Insert { key: Vec<u8>, val: Vec<u8> },
    Delete { key: Vec<u8>, delete_id: u32 },
}

impl UpdateBody {
    fn type_tag(&self) -> u8 {
        match self {
            UpdateBody::Empty => 0,
            UpdateBody::Flush => 1,
            UpdateBody::Start { .. } => 2,
            UpdateBody::Insert { .. } => 3,
            UpdateBody::Delete { .. } => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub ok_expiry: u64,
    pub sync_id: u32,
    pub update_id: u32,
    pub body: UpdateBody,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], PktDecodeError> {
        if self.pos + n > self.data.len() {
            return Err(PktDecodeError::Truncated);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> std::result::Result<u8, PktDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> std::result::Result<u32, PktDecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> std::result::Result<u64, PktDecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn lv(&mut self) -> std::result::Result<Vec<u8>, PktDecodeError> {
        let len = self.u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn put_lv(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > KVPSYNC_MAX_LEN {
        return Err(SmError::new(
            ErrorKind::Internal,
            "key or value too long for the wire",
        ));
    }
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    Ok(())
}

impl Update {
    pub fn decode(buf: &[u8]) -> std::result::Result<Update, PktDecodeError> {
        let mut c = Cursor::new(buf);
        let ok_expiry = c.u64()?;
        let sync_id = c.u32()?;
        let update_id = c.u32()?;
        let body = match c.u8()? {
            0 => UpdateBody::Empty,
            1 => UpdateBody::Flush,
            2 => {
                if update_id != 1 {
                    return Err(PktDecodeError::InvalidStart);
                }
                UpdateBody::Start {
                    resync_id: c.u32()?,
                }
            }
            3 => {
                let key = c.lv()?;
                let val = c.lv()?;
                UpdateBody::Insert { key, val }
            }
            4 => {
                let key = c.lv()?;
                let delete_id = c.u32()?;
                UpdateBody::Delete { key, delete_id }
            }
            other => return Err(PktDecodeError::InvalidType(other)),
        };
        Ok(Update {
            ok_expiry,
            sync_id,
            update_id,
            body,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        if matches!(self.body, UpdateBody::Start { .. }) && self.update_id != 1 {
            return Err(SmError::new(
                ErrorKind::Internal,
                "invalid update_id in start packet",
            ));
        }
        out.extend_from_slice(&self.ok_expiry.to_be_bytes());
        out.extend_from_slice(&self.sync_id.to_be_bytes());
        out.extend_from_slice(&self.update_id.to_be_bytes());
        out.push(self.body.type_tag());
        match &self.body {
            UpdateBody::Empty | UpdateBody::Flush => {}
            UpdateBody::Start { resync_id } => {
                out.extend_from_slice(&resync_id.to_be_bytes());
            }
            UpdateBody::Insert { key, val } => {
                put_lv(out, key)?;
                put_lv(out, val)?;
            }
            UpdateBody::Delete { key, delete_id } => {
                put_lv(out, key)?;
                out.extend_from_slice(&delete_id.to_be_bytes());
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub sync_id: u32,
    pub update_id: u32,
}

impl Ack {
    /// An ack with `update_id == 0` is a resync request; its sync field
    /// carries the receiver's `recv_id`.
    pub fn is_resync_request(&self) -> bool {
        self.update_id == 0
    }

    pub fn decode(buf: &[u8]) -> std::result::Result<Ack, PktDecodeError> {
        let mut c = Cursor::new(buf);
        Ok(Ack {
            sync_id: c.u32()?,
            update_id: c.u32()?,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sync_id.to_be_bytes());
        out.extend_from_slice(&self.update_id.to_be_bytes());
    }
}
