/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) enum LineError {
    TooLong,
    Io(io::Error),
}

/// Incremental newline framing with a hard length cap.
pub(crate) struct LineReader {
    buf: Vec<u8>,
    max: usize,
}

impl LineReader {
    pub(crate) fn new(max: usize) -> Self {
        LineReader {
            buf: Vec::with_capacity(256),
            max,
        }
    }

    /// The next complete line without its terminator, or `None` on EOF.
    pub(crate) async fn next_line<R>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<Vec<u8>>, LineError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                return Ok(Some(line));
            }
            if self.buf.len() >= self.max {
                return Err(LineError::TooLong);
            }

            let mut chunk = [0u8; 1024];
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(LineError::Io)?;
            if n == 0 {
                // a partial trailing line is dropped with the connection
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
