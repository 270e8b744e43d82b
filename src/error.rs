use crate::hal::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A transfer was requested while a previous transfer in either direction was still pending.
    TransferBusy,
    /// The DMA engine refused to queue a transfer in the given direction.
    TransferError(Direction),
    /// A completed word could not be stored because the receive buffer is already full.
    BufferOverrun,
    /// The transport rejected a datagram more often than the retry budget allows.
    SendRetryExhausted,
    /// An inbound datagram did not contain one of the known command tokens.
    UnrecognizedCommand,
    /// An interrupt fired without any of the causes owned by its handler being asserted.
    UnrecognizedInterruptCause,
    /// An attempt to attach a component to a second set of peripherals was detected.
    AlreadyAttached,
    /// A configuration value is out of range. The payload names the offending field.
    InvalidConfig(&'static str),
}
pub type Result<T> = core::result::Result<T, Error>;

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TransferBusy => write!(f, "a DMA transfer is still in flight"),
            Error::TransferError(direction) => {
                write!(f, "the DMA engine failed a {direction:?} transfer")
            }
            Error::BufferOverrun => write!(f, "the receive buffer is full"),
            Error::SendRetryExhausted => write!(f, "too many datagram send retries"),
            Error::UnrecognizedCommand => write!(f, "unknown command received"),
            Error::UnrecognizedInterruptCause => write!(f, "interrupt with unknown cause"),
            Error::AlreadyAttached => write!(f, "component is already attached"),
            Error::InvalidConfig(field) => write!(f, "invalid configuration value for {field}"),
        }
    }
}
