//! Minimal line-oriented IRC test client.

#![allow(dead_code)]

use std::time::Duration;

use bnc_proto::IrcMessage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self { reader: BufReader::new(read_half), writer: write_half })
    }

    pub async fn send_raw(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with("\r\n") {
            self.writer.write_all(b"\r\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<IrcMessage> {
        self.recv_timeout(Duration::from_secs(5)).await
    }

    pub async fn recv_timeout(&mut self, dur: Duration) -> anyhow::Result<IrcMessage> {
        let mut line = String::new();
        timeout(dur, self.reader.read_line(&mut line)).await??;
        line.trim_end().parse::<IrcMessage>().map_err(|e| anyhow::anyhow!("parse error: {e}"))
    }

    /// Receive messages until `predicate` matches one, returning everything
    /// seen along the way (predicate's match included).
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> anyhow::Result<Vec<IrcMessage>>
    where
        F: FnMut(&IrcMessage) -> bool,
    {
        let mut messages = Vec::new();
        loop {
            let msg = self.recv().await?;
            let done = predicate(&msg);
            messages.push(msg);
            if done {
                break;
            }
        }
        Ok(messages)
    }
}
