//! Message envelopes of the coordinator/worker protocol.
//!
//! Every message on the wire is a [`TransportEnvelope`] tagged with its
//! sender; the payload is a data frame, a control message, or a query
//! lifecycle message. The types are generated from `proto/transport.proto`.

use tessel_common::{ChannelId, QueryId, WorkerId};

include!(concat!(env!("OUT_DIR"), "/tessel.transport.rs"));

impl TransportEnvelope {
    pub fn data(sender: WorkerId, msg: DataMessage) -> Self {
        Self {
            sender,
            payload: Some(transport_envelope::Payload::Data(msg)),
        }
    }

    pub fn control(sender: WorkerId, msg: ControlMessage) -> Self {
        Self {
            sender,
            payload: Some(transport_envelope::Payload::Control(msg)),
        }
    }

    pub fn query(sender: WorkerId, msg: QueryMessage) -> Self {
        Self {
            sender,
            payload: Some(transport_envelope::Payload::Query(msg)),
        }
    }
}

impl ControlMessage {
    fn new(kind: ControlType, worker_id: WorkerId) -> Self {
        Self {
            kind: kind as i32,
            worker_id,
            remote_address: String::new(),
        }
    }

    pub fn shutdown() -> Self {
        Self::new(ControlType::Shutdown, 0)
    }

    pub fn heartbeat(worker_id: WorkerId) -> Self {
        Self::new(ControlType::Heartbeat, worker_id)
    }

    pub fn add_worker(worker_id: WorkerId, address: &str) -> Self {
        Self {
            remote_address: address.to_string(),
            ..Self::new(ControlType::AddWorker, worker_id)
        }
    }

    pub fn remove_worker(worker_id: WorkerId) -> Self {
        Self::new(ControlType::RemoveWorker, worker_id)
    }

    pub fn add_worker_ack(worker_id: WorkerId) -> Self {
        Self::new(ControlType::AddWorkerAck, worker_id)
    }

    pub fn remove_worker_ack(worker_id: WorkerId) -> Self {
        Self::new(ControlType::RemoveWorkerAck, worker_id)
    }

    pub fn control_type(&self) -> Option<ControlType> {
        ControlType::try_from(self.kind).ok()
    }
}

impl QueryMessage {
    fn new(kind: QueryType, query_id: QueryId) -> Self {
        Self {
            kind: kind as i32,
            query_id,
            plan: Vec::new(),
            cause: String::new(),
            stats: None,
        }
    }

    pub fn submit(query_id: QueryId, plan: Vec<u8>) -> Self {
        Self {
            plan,
            ..Self::new(QueryType::QuerySubmit, query_id)
        }
    }

    pub fn ready(query_id: QueryId) -> Self {
        Self::new(QueryType::QueryReady, query_id)
    }

    pub fn start(query_id: QueryId) -> Self {
        Self::new(QueryType::QueryStart, query_id)
    }

    pub fn kill(query_id: QueryId, reason: &str) -> Self {
        Self {
            cause: reason.to_string(),
            ..Self::new(QueryType::QueryKill, query_id)
        }
    }

    pub fn complete(query_id: QueryId, stats: ExecutionStats) -> Self {
        Self {
            stats: Some(stats),
            ..Self::new(QueryType::QueryComplete, query_id)
        }
    }

    pub fn failure(query_id: QueryId, cause: &str, stats: ExecutionStats) -> Self {
        Self {
            cause: cause.to_string(),
            stats: Some(stats),
            ..Self::new(QueryType::QueryFailure, query_id)
        }
    }

    pub fn query_type(&self) -> Option<QueryType> {
        QueryType::try_from(self.kind).ok()
    }
}

impl DataMessage {
    pub fn channel(&self) -> ChannelId {
        ChannelId(self.channel_id)
    }

    pub fn data_kind(&self) -> Option<DataKind> {
        DataKind::try_from(self.kind).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn control_envelope_survives_the_wire() {
        let env = TransportEnvelope::control(3, ControlMessage::add_worker(7, "10.0.0.7:9000"));
        let bytes = env.encode_to_vec();
        let back = TransportEnvelope::decode(bytes.as_slice()).unwrap();
        match back.payload {
            Some(transport_envelope::Payload::Control(cm)) => {
                assert_eq!(cm.control_type(), Some(ControlType::AddWorker));
                assert_eq!(cm.worker_id, 7);
                assert_eq!(cm.remote_address, "10.0.0.7:9000");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(back.sender, 3);
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let msg = QueryMessage {
            kind: 42,
            ..QueryMessage::ready(1)
        };
        assert_eq!(msg.query_type(), None);
    }
}
