use std::{
    io::{self, Read},
    net::{SocketAddr, TcpListener},
};

use rustix::net::{bind, listen, socket, sockopt, AddressFamily, SocketType};

use crate::{
    buffer::Payload,
    event::{park, TaskContext},
};

pub fn listen_on(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let family = if addr.is_ipv4() {
        AddressFamily::INET
    } else {
        AddressFamily::INET6
    };
    let fd = socket(family, SocketType::STREAM, None)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    bind(&fd, &addr)?;
    listen(&fd, 5)?;
    let listener = TcpListener::from(fd);
    // readiness is observed by the controller's multiplexer, never by
    // blocking in accept/read/write
    listener.set_nonblocking(true)?;
    Ok(listener)
}

impl TaskContext {
    // queue `bytes` on the task owning this socket, then wait until the
    // controller has drained the queue (or hit a send error, which is
    // surfaced here). the call looks synchronous to the handler but never
    // blocks the process
    pub async fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        if !bytes.is_empty() {
            self.rt.enqueue(&self.socket, Payload::new(bytes))?
        }
        if self.rt.has_pending_writes(self.id) {
            self.rt.set_blocking_send(self.id, true);
            park().await;
            self.rt.set_blocking_send(self.id, false)
        }
        if let Some(err) = self.rt.take_write_error(self.id) {
            return Err(err);
        }
        Ok(bytes.len())
    }

    // read exactly `buf.len()` bytes, yielding to the controller while the
    // socket has nothing to offer. Ok(0) means the peer closed; short reads
    // are never returned
    pub async fn recv_exact(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match (&*self.socket).read(&mut buf[filled..]) {
                Ok(0) => return Ok(0),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => park().await,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }
}
