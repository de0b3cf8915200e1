//! API crate
//!
//! Wire messages exchanged between the coordinator and workers, the tuple
//! batch codec, and the gRPC transport service they travel over.

pub mod codec;
pub mod proto;

/// gRPC client and server of the `Transport` service.
pub mod transport {
    pub use crate::proto::{transport_client, transport_server};
}

pub use codec::{decode_batch, encode_batch, StreamMessage};
pub use proto::{
    ControlMessage, ControlType, DataKind, DataMessage, DeliveryAck, ExecutionStats,
    OperatorProfile, QueryMessage, QueryType, TransportEnvelope,
};
