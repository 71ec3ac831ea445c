/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use tokio::net::UdpSocket;

use sm_types::{Error, ErrorKind, Result};

use crate::pkts::{Ack, Update};
use crate::recv::Receiver;
use crate::send::Sender;

/// Wall-clock milliseconds, the time base of the state machines.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// update packets top out well below this
const DGRAM_MAX: usize = 600;

/// Drives a `Sender` against one receiver peer over UDP.
pub struct SenderIo {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl SenderIo {
    pub async fn bind(addr: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(Error::from)?;
        Ok(SenderIo { socket, peer })
    }

    pub async fn run(&self, sender: &mut Sender) -> Result<()> {
        loop {
            self.step(sender).await?;
        }
    }

    /// Drive the sender until the receiver reaches the OK state; useful at
    /// startup before declaring a replica serviceable.
    pub async fn run_until_ok(&self, sender: &mut Sender) -> Result<()> {
        while !sender.recv_ok() {
            self.step(sender).await?;
        }
        Ok(())
    }

    async fn step(&self, sender: &mut Sender) -> Result<()> {
        let mut rcv_buf = [0u8; DGRAM_MAX];
        let mut snd_buf = Vec::with_capacity(DGRAM_MAX);

        let now = now_ms();
        let (pkt, deadline) = sender.run(now);
        if let Some(update) = pkt {
            snd_buf.clear();
            update.encode(&mut snd_buf)?;
            let nw = self
                .socket
                .send_to(&snd_buf, self.peer)
                .await
                .map_err(Error::from)?;
            if nw != snd_buf.len() {
                return Err(Error::new(ErrorKind::Sock, "short datagram write"));
            }
            if deadline == 0 {
                // another packet may go out immediately
                return Ok(());
            }
        }

        let sleep = Duration::from_millis(deadline.saturating_sub(now_ms()));
        tokio::select! {
            r = self.socket.recv_from(&mut rcv_buf) => {
                let (len, from) = r.map_err(Error::from)?;
                if from != self.peer {
                    debug!("ignoring datagram from unexpected peer {from}");
                    return Ok(());
                }
                match Ack::decode(&rcv_buf[..len]) {
                    Ok(ack) => sender.handle_ack(ack, now_ms()),
                    Err(e) => warn!("invalid ack from {from}: {e}"),
                }
            }
            _ = tokio::time::sleep(sleep) => {}
        }
        Ok(())
    }
}

/// Drives a `Receiver`, acking every update back to its sender.
pub struct ReceiverIo {
    socket: UdpSocket,
}

impl ReceiverIo {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(Error::from)?;
        Ok(ReceiverIo { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::from)
    }

    pub async fn run_once(&self, receiver: &mut Receiver) -> Result<()> {
        let mut rcv_buf = [0u8; DGRAM_MAX];
        let mut snd_buf = Vec::with_capacity(16);

        let (len, from) = self
            .socket
            .recv_from(&mut rcv_buf)
            .await
            .map_err(Error::from)?;
        let update = match Update::decode(&rcv_buf[..len]) {
            Ok(update) => update,
            Err(e) => {
                warn!("invalid update from {from}: {e}");
                return Ok(());
            }
        };
        let ack = receiver.handle_update(now_ms(), &update);
        snd_buf.clear();
        ack.encode(&mut snd_buf);
        self.socket
            .send_to(&snd_buf, from)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    pub async fn run(&self, receiver: &mut Receiver) -> Result<()> {
        loop {
            self.run_once(receiver).await?;
        }
    }
}
