//! Minimal Steam server query (`A2S_INFO`) client.
//!
//! Only the fields needed to decide idleness and readiness are decoded. Replies split across
//! several datagrams never happen for `A2S_INFO` in practice and are rejected.

use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::IdleSource;

const SINGLE_PACKET: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const SPLIT_PACKET: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];
const A2S_INFO: u8 = 0x54;
const S2C_CHALLENGE: u8 = 0x41;
const S2A_INFO: u8 = 0x49;
const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";
const MAX_CHALLENGES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub map: String,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Challenge([u8; 4]),
    Info(ServerInfo),
}

/// Queries a server's A2S port.
#[derive(Debug, Clone)]
pub struct A2sQuery {
    addr: SocketAddr,
}

impl A2sQuery {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send `A2S_INFO`, answering up to a few challenges. Callers bound the wait.
    pub async fn info(&self) -> Result<ServerInfo> {
        let bind: SocketAddr = if self.addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)
            .await
            .context("failed to bind query socket")?;
        socket
            .connect(self.addr)
            .await
            .with_context(|| format!("failed to connect query socket to {}", self.addr))?;

        socket.send(&info_request(None)).await?;
        let mut buf = [0u8; 1400];
        for _ in 0..MAX_CHALLENGES {
            let n = socket.recv(&mut buf).await?;
            match parse_reply(&buf[..n])? {
                Reply::Info(info) => return Ok(info),
                Reply::Challenge(challenge) => {
                    socket.send(&info_request(Some(challenge))).await?;
                }
            }
        }
        bail!("{} kept answering with challenges", self.addr)
    }
}

#[async_trait]
impl IdleSource for A2sQuery {
    async fn player_count(&self) -> Result<u32> {
        let info = self.info().await?;
        // Bots are counted in `players` but never block maintenance.
        Ok(u32::from(info.players.saturating_sub(info.bots)))
    }

    fn describe(&self) -> String {
        format!("a2s://{}", self.addr)
    }
}

fn info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + 1 + INFO_PAYLOAD.len() + 4);
    packet.extend_from_slice(&SINGLE_PACKET);
    packet.push(A2S_INFO);
    packet.extend_from_slice(INFO_PAYLOAD);
    if let Some(challenge) = challenge {
        packet.extend_from_slice(&challenge);
    }
    packet
}

fn parse_reply(datagram: &[u8]) -> Result<Reply> {
    let mut r = Reader::new(datagram);
    let header = r.take(4)?;
    if header == SPLIT_PACKET {
        bail!("split A2S replies are not supported");
    }
    if header != SINGLE_PACKET {
        bail!("unexpected packet header {header:02x?}");
    }

    match r.u8()? {
        S2C_CHALLENGE => {
            let mut challenge = [0u8; 4];
            challenge.copy_from_slice(r.take(4)?);
            Ok(Reply::Challenge(challenge))
        }
        S2A_INFO => {
            let _protocol = r.u8()?;
            let name = r.cstring()?;
            let map = r.cstring()?;
            let _folder = r.cstring()?;
            let _game = r.cstring()?;
            let _app_id = r.take(2)?;
            let players = r.u8()?;
            let max_players = r.u8()?;
            let bots = r.u8()?;
            Ok(Reply::Info(ServerInfo {
                name,
                map,
                players,
                max_players,
                bots,
            }))
        }
        other => bail!("unexpected reply type 0x{other:02x}"),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| anyhow!("truncated A2S reply"))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| anyhow!("unterminated string in A2S reply"))?;
        let s = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(s)
    }
}
