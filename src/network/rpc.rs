//! Wire format for rebalance messages.
//!
//! Messages travel inside a versioned envelope encoded with bincode. The
//! version is checked before the body is decoded, so a node never tries to
//! interpret a body laid out by a newer protocol.

use crate::error::{NetworkError, Result};
use crate::rebalancing::messages::{DemandMessage, SupplyMessage};
use serde::{Deserialize, Serialize};

/// Current wire protocol version.
pub const WIRE_VERSION: u16 = 1;

/// Any message exchanged on a rebalance topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RebalanceMessage {
    /// Demander to supplier.
    Demand(DemandMessage),

    /// Supplier to demander.
    Supply(SupplyMessage),
}

impl RebalanceMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RebalanceMessage::Demand(_) => "demand",
            RebalanceMessage::Supply(_) => "supply",
        }
    }
}

/// Versioned envelope around a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub version: u16,
    pub body: RebalanceMessage,
}

#[derive(Deserialize)]
struct WireHeader {
    version: u16,
}

/// Encode a message to bytes.
pub fn encode_message(msg: &RebalanceMessage) -> Result<Vec<u8>> {
    let envelope = WireEnvelope {
        version: WIRE_VERSION,
        body: msg.clone(),
    };
    Ok(bincode::serialize(&envelope)?)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<RebalanceMessage> {
    let header: WireHeader = bincode::deserialize(data)
        .map_err(|e| NetworkError::Deserialization(e.to_string()))?;
    if header.version != WIRE_VERSION {
        return Err(NetworkError::UnsupportedVersion(header.version).into());
    }

    let envelope: WireEnvelope = bincode::deserialize(data)
        .map_err(|e| NetworkError::Deserialization(e.to_string()))?;
    Ok(envelope.body)
}
