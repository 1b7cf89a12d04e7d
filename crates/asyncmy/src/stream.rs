//! Byte transport under a connection: plain TCP, TLS over TCP, or (in unit
//! tests) a scripted in-memory server.

#[cfg(feature = "tls")]
use std::io::{Read, Write};

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;

use asyncmy_core::Error;

#[cfg(feature = "tls")]
use asyncmy_core::error::{ConnectionError, ConnectionErrorKind};

#[cfg(feature = "tls")]
use crate::config::{SslMode, TlsConfig};
#[cfg(feature = "tls")]
use crate::tls;

pub(crate) enum MySqlStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<AsyncTlsStream>),
    #[cfg(test)]
    Scripted(ScriptedStream),
    Closed,
}

impl std::fmt::Debug for MySqlStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MySqlStream::Plain(_) => "Plain",
            #[cfg(feature = "tls")]
            MySqlStream::Tls(_) => "Tls",
            #[cfg(test)]
            MySqlStream::Scripted(_) => "Scripted",
            MySqlStream::Closed => "Closed",
        };
        f.write_str(name)
    }
}

fn not_connected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")
}

impl MySqlStream {
    pub(crate) fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        if matches!(self, MySqlStream::Tls(_)) {
            return true;
        }
        false
    }

    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            MySqlStream::Plain(s) => read_some_plain_async(s, buf).await,
            #[cfg(feature = "tls")]
            MySqlStream::Tls(s) => s.read_plain(buf).await,
            #[cfg(test)]
            MySqlStream::Scripted(s) => s.read_some(buf).await,
            MySqlStream::Closed => Err(not_connected()),
        }
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            MySqlStream::Plain(s) => write_all_plain_async(s, buf).await,
            #[cfg(feature = "tls")]
            MySqlStream::Tls(s) => s.write_all(buf).await,
            #[cfg(test)]
            MySqlStream::Scripted(s) => {
                s.record(buf);
                Ok(())
            }
            MySqlStream::Closed => Err(not_connected()),
        }
    }

    pub(crate) async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            MySqlStream::Plain(s) => flush_plain_async(s).await,
            #[cfg(feature = "tls")]
            MySqlStream::Tls(s) => s.flush().await,
            #[cfg(test)]
            MySqlStream::Scripted(_) => Ok(()),
            MySqlStream::Closed => Err(not_connected()),
        }
    }

    /// Run the TLS handshake over a plain TCP stream.
    #[cfg(feature = "tls")]
    pub(crate) async fn upgrade(
        self,
        host: &str,
        ssl_mode: SslMode,
        tls_config: &TlsConfig,
    ) -> Result<Self, Error> {
        match self {
            MySqlStream::Plain(tcp) => {
                let tls = AsyncTlsStream::handshake(tcp, host, ssl_mode, tls_config).await?;
                Ok(MySqlStream::Tls(Box::new(tls)))
            }
            other => Err(tls::tls_error(format!(
                "cannot start TLS on a {other:?} stream"
            ))),
        }
    }
}

#[cfg(feature = "tls")]
pub(crate) struct AsyncTlsStream {
    tcp: TcpStream,
    tls: rustls::ClientConnection,
}

#[cfg(feature = "tls")]
fn disconnected(message: String, e: std::io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message,
        source: Some(Box::new(e)),
    })
}

#[cfg(feature = "tls")]
impl AsyncTlsStream {
    async fn handshake(
        mut tcp: TcpStream,
        host: &str,
        ssl_mode: SslMode,
        tls_config: &TlsConfig,
    ) -> Result<Self, Error> {
        let config = tls::build_client_config(ssl_mode, tls_config)?;
        let server_name = tls::server_name(host, tls_config)?;
        let mut tls = rustls::ClientConnection::new(std::sync::Arc::new(config), server_name)
            .map_err(|e| tls::tls_error(format!("failed to create TLS connection: {e}")))?;

        while tls.is_handshaking() {
            while tls.wants_write() {
                let mut out = Vec::new();
                tls.write_tls(&mut out)
                    .map_err(|e| tls::tls_error(format!("TLS handshake write_tls error: {e}")))?;
                if !out.is_empty() {
                    write_all_plain_async(&mut tcp, &out)
                        .await
                        .map_err(|e| disconnected(format!("TLS handshake write error: {e}"), e))?;
                }
            }

            if tls.wants_read() {
                let mut buf = [0u8; 8192];
                let n = read_some_plain_async(&mut tcp, &mut buf)
                    .await
                    .map_err(|e| disconnected(format!("TLS handshake read error: {e}"), e))?;
                if n == 0 {
                    return Err(tls::tls_error("connection closed during TLS handshake"));
                }

                let mut cursor = std::io::Cursor::new(&buf[..n]);
                tls.read_tls(&mut cursor)
                    .map_err(|e| tls::tls_error(format!("TLS handshake read_tls error: {e}")))?;
                tls.process_new_packets()
                    .map_err(|e| tls::tls_error(format!("TLS handshake error: {e}")))?;
            }
        }

        tracing::debug!(
            version = ?tls.protocol_version(),
            "TLS handshake complete"
        );
        Ok(Self { tcp, tls })
    }

    async fn read_plain(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.tls.reader().read(out) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !self.tls.wants_read() {
                return Ok(0);
            }

            let mut enc = [0u8; 8192];
            let n = read_some_plain_async(&mut self.tcp, &mut enc).await?;
            if n == 0 {
                return Ok(0);
            }

            let mut cursor = std::io::Cursor::new(&enc[..n]);
            self.tls.read_tls(&mut cursor)?;
            self.tls
                .process_new_packets()
                .map_err(|e| std::io::Error::other(format!("TLS error: {e}")))?;
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.tls.writer().write(&buf[written..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "TLS write zero",
                ));
            }
            written += n;
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.tls.writer().flush()?;
        while self.tls.wants_write() {
            let mut out = Vec::new();
            self.tls.write_tls(&mut out)?;
            if !out.is_empty() {
                write_all_plain_async(&mut self.tcp, &out).await?;
            }
        }
        flush_plain_async(&mut self.tcp).await
    }
}

async fn read_some_plain_async(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read_buf = ReadBuf::new(buf);
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_read(cx, &mut read_buf))
        .await?;
    Ok(read_buf.filled().len())
}

async fn write_all_plain_async(stream: &mut TcpStream, buf: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = std::future::poll_fn(|cx| {
            std::pin::Pin::new(&mut *stream).poll_write(cx, &buf[written..])
        })
        .await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "connection closed",
            ));
        }
        written += n;
    }
    Ok(())
}

async fn flush_plain_async(stream: &mut TcpStream) -> std::io::Result<()> {
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_flush(cx)).await
}

#[cfg(test)]
pub(crate) use scripted::ScriptedStream;

#[cfg(test)]
mod scripted {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::task::Poll;

    use crate::protocol::{PacketHeader, frame};

    #[derive(Debug, Default)]
    struct Script {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
        eof_when_empty: bool,
    }

    /// In-memory server. Reads drain the queued bytes; once they run out a
    /// read either reports EOF or stays pending forever.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct ScriptedStream {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedStream {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Queue one server packet.
        pub(crate) fn push_packet(&self, payload: &[u8], seq: u8) -> &Self {
            self.push_bytes(&frame(payload, seq))
        }

        pub(crate) fn push_bytes(&self, bytes: &[u8]) -> &Self {
            self.script
                .lock()
                .expect("script lock")
                .incoming
                .extend(bytes.iter().copied());
            self
        }

        pub(crate) fn set_eof_when_empty(&self, eof: bool) {
            self.script.lock().expect("script lock").eof_when_empty = eof;
        }

        pub(crate) fn pending_bytes(&self) -> usize {
            self.script.lock().expect("script lock").incoming.len()
        }

        /// Everything the client wrote, split into `(seq, payload)` frames.
        pub(crate) fn written_frames(&self) -> Vec<(u8, Vec<u8>)> {
            let written = self.script.lock().expect("script lock").written.clone();
            let mut frames = Vec::new();
            let mut pos = 0;
            while pos + PacketHeader::SIZE <= written.len() {
                let header = PacketHeader::from_bytes([
                    written[pos],
                    written[pos + 1],
                    written[pos + 2],
                    written[pos + 3],
                ]);
                let start = pos + PacketHeader::SIZE;
                let end = start + header.payload_length as usize;
                frames.push((header.sequence_id, written[start..end].to_vec()));
                pos = end;
            }
            frames
        }

        pub(crate) fn clear_written(&self) {
            self.script.lock().expect("script lock").written.clear();
        }

        pub(super) fn record(&self, buf: &[u8]) {
            self.script
                .lock()
                .expect("script lock")
                .written
                .extend_from_slice(buf);
        }

        pub(super) async fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::future::poll_fn(|_| {
                let mut script = self.script.lock().expect("script lock");
                if script.incoming.is_empty() {
                    return if script.eof_when_empty {
                        Poll::Ready(Ok(0))
                    } else {
                        Poll::Pending
                    };
                }
                let n = buf.len().min(script.incoming.len());
                for (slot, byte) in buf.iter_mut().zip(script.incoming.drain(..n)) {
                    *slot = byte;
                }
                Poll::Ready(Ok(n))
            })
            .await
        }
    }
}
