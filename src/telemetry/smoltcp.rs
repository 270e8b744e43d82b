//! An implementation of our `DatagramTransport` trait, built on top of a smoltcp UDP socket.
use super::transport::DatagramTransport;
use crate::hal::Clock;
use log::debug;
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::phy::Device;
use smoltcp::socket::udp;
use smoltcp::wire::IpEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The transport was closed.
    Closed,
    /// The socket refused the datagram, usually because its send buffer is full.
    Send(udp::SendError),
}

/// Sends datagrams to, and receives datagrams from, a single remote endpoint.
///
/// The interface is polled on every send and every [DatagramTransport::poll_inbound] call, so
/// there is no need to poll it separately.
pub struct SmolUdpTransport<'s, D: Device, C: Clock> {
    device: D,
    iface: Interface,
    sockets: SocketSet<'s>,
    handle: SocketHandle,
    remote: IpEndpoint,
    clock: C,
    closed: bool,
}

impl<'s, D: Device, C: Clock> SmolUdpTransport<'s, D, C> {
    /// Binds `socket` to `local_port` and adds it to `sockets`.
    pub fn new(
        device: D,
        iface: Interface,
        mut sockets: SocketSet<'s>,
        mut socket: udp::Socket<'s>,
        local_port: u16,
        remote: IpEndpoint,
        clock: C,
    ) -> Result<SmolUdpTransport<'s, D, C>, udp::BindError> {
        socket.bind(local_port)?;
        let handle = sockets.add(socket);
        debug!("UDP transport bound to port {local_port}, sending to {remote}");
        Ok(SmolUdpTransport {
            device,
            iface,
            sockets,
            handle,
            remote,
            clock,
            closed: false,
        })
    }

    pub fn remote(&self) -> IpEndpoint {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Polls the interface. This is what actually causes queued datagrams to be sent, and
    /// incoming ones to be received.
    pub fn poll(&mut self) {
        self.iface
            .poll(self.clock.now(), &mut self.device, &mut self.sockets);
    }
}

impl<'s, D: Device, C: Clock> DatagramTransport for SmolUdpTransport<'s, D, C> {
    type Error = TransportError;

    fn send_with<F>(&mut self, len: usize, fill: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut [u8]),
    {
        if self.closed {
            return Err(TransportError::Closed);
        }
        // Drains the socket's send buffer if possible, making room for this datagram.
        self.poll();
        let socket = self.sockets.get_mut::<udp::Socket>(self.handle);
        let buffer = socket
            .send(len, self.remote)
            .map_err(TransportError::Send)?;
        fill(buffer);
        self.poll();
        Ok(())
    }

    fn poll_inbound<F>(&mut self, mut on_datagram: F)
    where
        F: FnMut(&[u8]),
    {
        if self.closed {
            return;
        }
        self.poll();
        let socket = self.sockets.get_mut::<udp::Socket>(self.handle);
        while let Ok((payload, meta)) = socket.recv() {
            if meta.endpoint.addr != self.remote.addr {
                debug!("Ignoring datagram from {}", meta.endpoint);
                continue;
            }
            on_datagram(payload);
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        // Give any queued datagrams (e.g. the closing one) a chance to go out first.
        self.poll();
        self.sockets.get_mut::<udp::Socket>(self.handle).close();
        self.closed = true;
        debug!("UDP transport closed");
    }
}
