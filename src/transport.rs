//! One non-blocking TCP socket per connection, with optional TLS. The
//! transport performs no protocol work at all: it reports establishment,
//! surfaces decrypted inbound bytes, and writes what it is told to write,
//! parking the overflow in a backlog flushed on the next writable event.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slog::{debug, trace, Logger};
use rustls_pki_types::ServerName;
use socket2::{Domain, Protocol, Socket, Type};

use crate::connection::ConnectionError;

#[derive(Clone)]
pub(crate) struct TlsParams {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

#[derive(Clone)]
pub(crate) struct SessionParams {
    pub addr: SocketAddr,
    pub bind: Option<SocketAddr>,
    pub tls: Option<TlsParams>,
}

pub(crate) enum TransportEvent {
    TcpEstablished,
    TlsEstablished,
    Data(Vec<u8>),
    Closed(ConnectionError),
}

enum Phase {
    Dialing,
    Open,
    Dead,
}

pub(crate) struct Transport {
    log: Logger,
    sock: TcpStream,
    token: Token,
    tls: Option<rustls::ClientConnection>,
    tls_ready: bool,
    phase: Phase,
    /// Unwritten plain-text bytes; only used on non-TLS links, rustls
    /// buffers internally otherwise.
    backlog: VecDeque<Vec<u8>>,
    /// True if WRITABLE interest is currently registered.
    writable_armed: bool,
}

impl Transport {
    /// Begin a non-blocking dial. The socket reports readiness through the
    /// registry; the first writable event decides success.
    pub fn connect(
        params: &SessionParams,
        registry: &Registry,
        token: Token,
        log: Logger,
    ) -> io::Result<Transport> {
        let sock = match params.bind {
            Some(local) => {
                let socket = Socket::new(
                    Domain::for_address(params.addr),
                    Type::STREAM,
                    Some(Protocol::TCP),
                )?;
                socket.set_nonblocking(true)?;
                socket.bind(&local.into())?;
                match socket.connect(&params.addr.into()) {
                    Ok(()) => {}
                    Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err),
                }
                TcpStream::from_std(socket.into())
            }
            None => TcpStream::connect(params.addr)?,
        };
        sock.set_nodelay(true)?;
        let tls = match &params.tls {
            Some(params) => Some(
                rustls::ClientConnection::new(params.config.clone(), params.server_name.clone())
                    .map_err(io::Error::other)?,
            ),
            None => None,
        };
        let mut transport = Transport {
            log,
            sock,
            token,
            tls,
            tls_ready: false,
            phase: Phase::Dialing,
            backlog: VecDeque::new(),
            writable_armed: true,
        };
        registry.register(
            &mut transport.sock,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(transport)
    }

    /// React to socket readiness. Everything notable lands in `out`.
    pub fn handle_event(
        &mut self,
        registry: &Registry,
        readable: bool,
        writable: bool,
        out: &mut Vec<TransportEvent>,
    ) {
        if matches!(self.phase, Phase::Dead) {
            return;
        }
        if writable && matches!(self.phase, Phase::Dialing) {
            match self.dial_outcome() {
                Ok(true) => {
                    trace!(self.log, "tcp established");
                    self.phase = Phase::Open;
                    out.push(TransportEvent::TcpEstablished);
                }
                Ok(false) => {}
                Err(err) => {
                    self.dead(out, ConnectionError::ConnectFailed(err));
                    return;
                }
            }
        }
        if matches!(self.phase, Phase::Open) {
            if readable {
                self.read(out);
            }
            if matches!(self.phase, Phase::Dead) {
                return;
            }
            let tls_pending = self.tls.as_ref().is_some_and(|t| t.wants_write());
            if writable || tls_pending {
                if let Err(err) = self.flush() {
                    self.dead(out, ConnectionError::WriteFailed(err.to_string()));
                    return;
                }
            }
        }
        self.rearm(registry);
    }

    /// Result of an in-flight dial: connected, still pending, or failed.
    fn dial_outcome(&mut self) -> Result<bool, String> {
        match self.sock.take_error() {
            Ok(Some(err)) => return Err(err.to_string()),
            Ok(None) => {}
            Err(err) => return Err(err.to_string()),
        }
        match self.sock.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(err) => Err(err.to_string()),
        }
    }

    fn read(&mut self, out: &mut Vec<TransportEvent>) {
        let mut chunk = [0u8; 8192];
        let mut data = Vec::new();
        loop {
            match self.sock.read(&mut chunk) {
                Ok(0) => {
                    if !data.is_empty() {
                        out.push(TransportEvent::Data(std::mem::take(&mut data)));
                    }
                    self.dead(out, ConnectionError::Reset);
                    return;
                }
                Ok(n) => {
                    if self.tls.is_some() {
                        if let Err(err) = self.tls_input(&chunk[..n], &mut data, out) {
                            if !data.is_empty() {
                                out.push(TransportEvent::Data(std::mem::take(&mut data)));
                            }
                            self.dead(out, ConnectionError::Tls(err));
                            return;
                        }
                    } else {
                        data.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !data.is_empty() {
                        out.push(TransportEvent::Data(std::mem::take(&mut data)));
                    }
                    debug!(self.log, "read failed"; "err" => %err);
                    self.dead(out, ConnectionError::Reset);
                    return;
                }
            }
        }
        if !data.is_empty() {
            out.push(TransportEvent::Data(data));
        }
    }

    /// Feed ciphertext into rustls, pulling out whatever plaintext and
    /// handshake progress results.
    fn tls_input(
        &mut self,
        mut buf: &[u8],
        data: &mut Vec<u8>,
        out: &mut Vec<TransportEvent>,
    ) -> Result<(), String> {
        let tls = self.tls.as_mut().expect("tls session");
        while !buf.is_empty() {
            let n = tls.read_tls(&mut buf).map_err(|err| err.to_string())?;
            if n == 0 {
                break;
            }
            let state = tls.process_new_packets().map_err(|err| err.to_string())?;
            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let start = data.len();
                data.resize(start + pending, 0);
                tls.reader()
                    .read_exact(&mut data[start..])
                    .map_err(|err| err.to_string())?;
            }
        }
        if !self.tls_ready && !tls.is_handshaking() {
            trace!(self.log, "tls established");
            self.tls_ready = true;
            out.push(TransportEvent::TlsEstablished);
        }
        Ok(())
    }

    /// Queue one encoded frame and push as much as the kernel will take.
    pub fn write(&mut self, registry: &Registry, bytes: &[u8]) -> io::Result<()> {
        if matches!(self.phase, Phase::Dead) {
            return Ok(());
        }
        match &mut self.tls {
            Some(tls) => {
                tls.writer().write_all(bytes)?;
            }
            None => self.backlog.push_back(bytes.to_vec()),
        }
        let result = self.flush();
        self.rearm(registry);
        result
    }

    /// Flush queued data until the kernel blocks or the queue empties.
    fn flush(&mut self) -> io::Result<()> {
        if matches!(self.phase, Phase::Dialing | Phase::Dead) {
            return Ok(());
        }
        if let Some(tls) = &mut self.tls {
            while tls.wants_write() {
                match tls.write_tls(&mut self.sock) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
            return Ok(());
        }
        while let Some(front) = self.backlog.front_mut() {
            match self.sock.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    if n == front.len() {
                        self.backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Hold WRITABLE interest only while something still wants to go out.
    fn rearm(&mut self, registry: &Registry) {
        if matches!(self.phase, Phase::Dead) {
            return;
        }
        let want = matches!(self.phase, Phase::Dialing)
            || !self.backlog.is_empty()
            || self.tls.as_ref().is_some_and(|t| t.wants_write());
        if want != self.writable_armed {
            let interest = if want {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if registry
                .reregister(&mut self.sock, self.token, interest)
                .is_ok()
            {
                self.writable_armed = want;
            }
        }
    }

    /// Final flush and teardown. Best effort: the peer may already be gone.
    pub fn close(mut self, registry: &Registry) {
        if let Some(tls) = &mut self.tls {
            tls.send_close_notify();
        }
        let _ = self.flush();
        let _ = registry.deregister(&mut self.sock);
    }

    fn dead(&mut self, out: &mut Vec<TransportEvent>, reason: ConnectionError) {
        if matches!(self.phase, Phase::Dead) {
            return;
        }
        debug!(self.log, "transport closed"; "reason" => %reason);
        self.phase = Phase::Dead;
        out.push(TransportEvent::Closed(reason));
    }
}
