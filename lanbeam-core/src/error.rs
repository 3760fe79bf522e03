//! Errors surfaced to the collaborator (UI, CLI) for a transfer.

use std::time::Duration;

use crate::cipher::CryptoError;
use crate::directory::DirectoryError;
use crate::reassembly::AssemblyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Directory,
    Negotiation,
    HandshakeTimeout,
    Declined,
    Crypto,
    TransportClosed,
    Assembly,
}

impl ErrorKind {
    /// Declines are reported but are not faults.
    pub fn is_fault(&self) -> bool {
        !matches!(self, ErrorKind::Declined)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),
    #[error("could not connect to {peer} after {attempts} attempts")]
    Negotiation { peer: String, attempts: u32 },
    #[error("no answer to the transfer offer within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("transfer declined by recipient")]
    Declined,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("connection interrupted")]
    TransportClosed,
    #[error("assembly: {0}")]
    Assembly(#[from] AssemblyError),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Directory(_) => ErrorKind::Directory,
            TransferError::Negotiation { .. } => ErrorKind::Negotiation,
            TransferError::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            TransferError::Declined => ErrorKind::Declined,
            TransferError::Crypto(_) => ErrorKind::Crypto,
            TransferError::TransportClosed => ErrorKind::TransportClosed,
            TransferError::Assembly(_) => ErrorKind::Assembly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_messages() {
        let e = TransferError::from(CryptoError::Authentication { index: 4 });
        assert_eq!(e.kind(), ErrorKind::Crypto);
        assert_eq!(e.to_string(), "chunk 4 failed authentication");
        assert_eq!(TransferError::TransportClosed.to_string(), "connection interrupted");
        assert!(!TransferError::Declined.kind().is_fault());
        assert!(TransferError::HandshakeTimeout(Duration::from_secs(15))
            .kind()
            .is_fault());
    }
}
