//! # Gateway Error Handling
//!
//! This module defines the GatewayError enum, the crate-wide error type.
//! Subsystems with richer failure vocabularies (crypto, hex, device
//! specification parsing) define their own enums and convert into
//! GatewayError at the seam.

use thiserror::Error;

/// Represents the different error types that can occur in the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Indicates an error related to the serial port communication.
    #[error("Serial port error: {0}")]
    SerialPortError(String),

    /// A frame failed CRC, checksum or terminator validation.
    #[error("Corrupt frame: {0}")]
    FrameCorrupt(String),

    /// A telegram could not be parsed at all (truncated below the DLL).
    #[error("Error parsing telegram: {0}")]
    TelegramParseError(String),

    /// Cryptographic failure (bad key length, CMAC mismatch, ...).
    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    /// Invalid hexadecimal input.
    #[error("Hex error: {0}")]
    Hex(#[from] crate::util::hex::HexError),

    /// A device specification string was rejected at startup.
    #[error("Invalid device specification: {0}")]
    ConfigInvalid(String),

    /// Probing a serial device received nothing plausible.
    #[error("Device unresponsive: {0}")]
    DeviceUnresponsive(String),

    /// A supervised device reported not-working and was removed.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// An outbound send was rejected before reaching the device.
    #[error("Send rejected: {0}")]
    SendRejected(String),

    /// A catch-all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}
