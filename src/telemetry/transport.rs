/// A best-effort datagram transport connected to a single remote endpoint.
pub trait DatagramTransport {
    type Error: core::fmt::Debug;

    /// Sends a datagram of `len` bytes, using `fill` to produce its contents.
    ///
    /// `fill` is only called if the transport could allocate space for the datagram. A returned
    /// error means the datagram was not queued, and the caller may retry.
    fn send_with<F>(&mut self, len: usize, fill: F) -> Result<(), Self::Error>
    where
        F: FnOnce(&mut [u8]);

    /// Invokes `on_datagram` with the payload of each datagram received from the remote endpoint
    /// since the last call. The payload slice is exactly as long as the datagram.
    fn poll_inbound<F>(&mut self, on_datagram: F)
    where
        F: FnMut(&[u8]);

    /// Releases the endpoint. Subsequent sends fail and no more datagrams are received.
    fn close(&mut self);
}
