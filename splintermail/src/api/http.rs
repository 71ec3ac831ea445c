/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! A deliberately small blocking HTTPS POST, sufficient for one-shot CLI
//! API calls. Anything resembling a general HTTP client is out of scope.

use std::io::{Read, Write};
use std::net::TcpStream;

use openssl::ssl::{SslConnector, SslMethod};

use sm_types::{Error, ErrorKind, Result, ResultExt};

/// POST `body` to `https://{server}{path}`, returning the status code and
/// response body. `server` is `host:port`.
pub fn https_post(
    server: &str,
    path: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<(u16, Vec<u8>)> {
    let host = server.rsplit_once(':').map(|(h, _)| h).unwrap_or(server);

    let connector = SslConnector::builder(SslMethod::tls())
        .map(|b| b.build())
        .map_err(Error::from)?;
    let tcp = TcpStream::connect(server)
        .map_err(Error::from)
        .rethrow(ErrorKind::Conn, format!("connecting to {server}"))?;
    let mut tls = connector
        .connect(host, tcp)
        .map_err(|e| Error::ssl(format!("TLS to {host} failed: {e}")))?;

    let mut request = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    tls.write_all(request.as_bytes()).map_err(Error::from)?;
    tls.write_all(body).map_err(Error::from)?;

    let mut response = Vec::new();
    tls.read_to_end(&mut response).map_err(Error::from)?;

    parse_response(&response)
}

fn parse_response(response: &[u8]) -> Result<(u16, Vec<u8>)> {
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::new(ErrorKind::Response, "truncated HTTP response"))?;
    let head = std::str::from_utf8(&response[..header_end])
        .map_err(|_| Error::new(ErrorKind::Response, "non-text HTTP header"))?;

    let status_line = head.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::new(ErrorKind::Response, "bad HTTP status line"))?;

    let mut body = response[header_end + 4..].to_vec();

    // with Connection: close the body simply runs to EOF, but honor an
    // explicit Content-Length when present
    for line in head.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("content-length") {
            if let Ok(len) = value.trim().parse::<usize>() {
                body.truncate(len);
            }
        }
    }

    Ok((status, body))
}
