//! The wire packet catalog.
//!
//! Each variant mirrors one concrete packet class from the broker protocol:
//! a type id and a fixed, ordered list of typed attributes. Encoding and
//! decoding go through [`crate::bencode`]; this module only knows how to
//! turn a `Value::List` body into a typed [`Packet`] and back.
//!
//! The catalog is wider than what this agent originates or acts on — the
//! server-cluster-internal `command_*`/`peer_*` range and the login/legacy
//! `request_open`/`request_close*` types are included so that decoding never
//! fails with `UnknownPacketError` on a shared connection, even though this
//! agent never constructs them itself.

use crate::bencode::Value;
use crate::error::PacketError;
use std::collections::BTreeMap;

macro_rules! packet_types {
    ($($variant:ident = $id:expr),* $(,)?) => {
        /// The `type` field of a packet, as it appears on the wire.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        #[repr(i64)]
        pub enum PacketType {
            $($variant = $id),*
        }

        impl PacketType {
            pub fn from_i64(n: i64) -> Option<Self> {
                match n {
                    $($id => Some(PacketType::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

packet_types! {
    Null = 0,
    JoinReq = 1,
    IdentifyReq = 2,
    Welcome = 3,
    Log = 4,
    SendReq = 5,
    Route = 6,
    Ping = 7,
    Pong = 8,
    SetIdentity = 9,
    RequestOpen = 10,
    RequestClose = 11,
    RequestCloseAll = 12,
    KeepAlive = 13,
    NotifyOpen = 14,
    RequestLogin = 15,
    Instruction = 16,
    NotifyLoginSuccess = 17,
    NotifyLoginFail = 18,
    NotifyClose = 19,
    LeaveReq = 20,
    Response = 100,
    CommandAddRoute = 101,
    CommandSendInstruction = 102,
    CommandLog = 103,
    CommandBroadcastLog = 104,
    PeerAddRoute = 200,
    PeerForward = 201,
    PeerNotifyDisconnect = 202,
}

/// A decoded, typed wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Null,
    JoinReq,
    IdentifyReq { uuid: Vec<u8> },
    Welcome,
    Log { text: Vec<u8> },
    SendReq { channel: i64, data: Vec<u8> },
    Route { channel: i64, data: Vec<u8> },
    Ping { data: Vec<u8> },
    Pong { data: Vec<u8> },
    SetIdentity { uuid: Vec<u8> },
    RequestOpen,
    RequestClose,
    RequestCloseAll,
    KeepAlive,
    NotifyOpen { channel: i64 },
    RequestLogin { username: Vec<u8>, password: Vec<u8> },
    Instruction { sender: Vec<u8>, data: BTreeMap<Vec<u8>, Value> },
    NotifyLoginSuccess { user: Vec<u8> },
    NotifyLoginFail { message: Vec<u8> },
    NotifyClose { port: i64 },
    LeaveReq,
    Response { command_id: i64, result: BTreeMap<Vec<u8>, Value> },
    /// Server-cluster-internal packets this node only ever passes through
    /// unexamined; kept opaque rather than given dedicated fields.
    Passthrough { packet_type: PacketType, body: Vec<Value> },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Null => PacketType::Null,
            Packet::JoinReq => PacketType::JoinReq,
            Packet::IdentifyReq { .. } => PacketType::IdentifyReq,
            Packet::Welcome => PacketType::Welcome,
            Packet::Log { .. } => PacketType::Log,
            Packet::SendReq { .. } => PacketType::SendReq,
            Packet::Route { .. } => PacketType::Route,
            Packet::Ping { .. } => PacketType::Ping,
            Packet::Pong { .. } => PacketType::Pong,
            Packet::SetIdentity { .. } => PacketType::SetIdentity,
            Packet::RequestOpen => PacketType::RequestOpen,
            Packet::RequestClose => PacketType::RequestClose,
            Packet::RequestCloseAll => PacketType::RequestCloseAll,
            Packet::KeepAlive => PacketType::KeepAlive,
            Packet::NotifyOpen { .. } => PacketType::NotifyOpen,
            Packet::RequestLogin { .. } => PacketType::RequestLogin,
            Packet::Instruction { .. } => PacketType::Instruction,
            Packet::NotifyLoginSuccess { .. } => PacketType::NotifyLoginSuccess,
            Packet::NotifyLoginFail { .. } => PacketType::NotifyLoginFail,
            Packet::NotifyClose { .. } => PacketType::NotifyClose,
            Packet::LeaveReq => PacketType::LeaveReq,
            Packet::Response { .. } => PacketType::Response,
            Packet::Passthrough { packet_type, .. } => *packet_type,
        }
    }

    /// Encode this packet to its canonical Bencode byte representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut list = vec![Value::Int(self.packet_type() as i64)];
        list.extend(self.encode_body());
        crate::bencode::encode(&Value::List(list))
    }

    fn encode_body(&self) -> Vec<Value> {
        match self {
            Packet::Null
            | Packet::JoinReq
            | Packet::Welcome
            | Packet::RequestOpen
            | Packet::RequestClose
            | Packet::RequestCloseAll
            | Packet::KeepAlive
            | Packet::LeaveReq => vec![],
            Packet::IdentifyReq { uuid } | Packet::SetIdentity { uuid } => {
                vec![Value::Bytes(uuid.clone())]
            }
            Packet::Log { text } => vec![Value::Bytes(text.clone())],
            Packet::SendReq { channel, data } | Packet::Route { channel, data } => {
                vec![Value::Int(*channel), Value::Bytes(data.clone())]
            }
            Packet::Ping { data } | Packet::Pong { data } => vec![Value::Bytes(data.clone())],
            Packet::NotifyOpen { channel } => vec![Value::Int(*channel)],
            Packet::RequestLogin { username, password } => vec![
                Value::Bytes(username.clone()),
                Value::Bytes(password.clone()),
            ],
            Packet::Instruction { sender, data } => vec![
                Value::Bytes(sender.clone()),
                Value::Map(data.clone()),
            ],
            Packet::NotifyLoginSuccess { user } => vec![Value::Bytes(user.clone())],
            Packet::NotifyLoginFail { message } => vec![Value::Bytes(message.clone())],
            Packet::NotifyClose { port } => vec![Value::Int(*port)],
            Packet::Response { command_id, result } => vec![
                Value::Int(*command_id),
                Value::Map(result.clone()),
            ],
            Packet::Passthrough { body, .. } => body.clone(),
        }
    }

    /// Decode a complete wire frame (type id + body) into a typed packet.
    pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
        let value = crate::bencode::decode(bytes)?;
        let items = value
            .as_list()
            .ok_or_else(|| PacketError::Malformed("packet must be a list".into()))?;
        let (head, body) = items
            .split_first()
            .ok_or_else(|| PacketError::Malformed("packet list is empty".into()))?;
        let type_id = head
            .as_int()
            .ok_or_else(|| PacketError::Malformed("first packet element must be an integer".into()))?;
        let packet_type = PacketType::from_i64(type_id)
            .ok_or_else(|| PacketError::Malformed(format!("unregistered packet type {type_id}")))?;
        Packet::from_body(packet_type, body)
    }

    fn from_body(packet_type: PacketType, body: &[Value]) -> Result<Packet, PacketError> {
        fn int_at(body: &[Value], i: usize) -> Result<i64, PacketError> {
            body.get(i)
                .and_then(Value::as_int)
                .ok_or_else(|| PacketError::BadPacket(format!("expected integer attribute at index {i}")))
        }
        fn bytes_at(body: &[Value], i: usize) -> Result<Vec<u8>, PacketError> {
            body.get(i)
                .and_then(Value::as_bytes)
                .map(|b| b.to_vec())
                .ok_or_else(|| PacketError::BadPacket(format!("expected byte-string attribute at index {i}")))
        }
        fn map_at(body: &[Value], i: usize) -> Result<BTreeMap<Vec<u8>, Value>, PacketError> {
            body.get(i)
                .and_then(Value::as_map)
                .map(|m| m.clone())
                .ok_or_else(|| PacketError::BadPacket(format!("expected map attribute at index {i}")))
        }

        Ok(match packet_type {
            PacketType::Null => Packet::Null,
            PacketType::JoinReq => Packet::JoinReq,
            PacketType::IdentifyReq => Packet::IdentifyReq { uuid: bytes_at(body, 0)? },
            PacketType::Welcome => Packet::Welcome,
            PacketType::Log => Packet::Log { text: bytes_at(body, 0)? },
            PacketType::SendReq => Packet::SendReq {
                channel: int_at(body, 0)?,
                data: bytes_at(body, 1)?,
            },
            PacketType::Route => Packet::Route {
                channel: int_at(body, 0)?,
                data: bytes_at(body, 1)?,
            },
            PacketType::Ping => Packet::Ping { data: bytes_at(body, 0)? },
            PacketType::Pong => Packet::Pong { data: bytes_at(body, 0)? },
            PacketType::SetIdentity => Packet::SetIdentity { uuid: bytes_at(body, 0)? },
            PacketType::RequestOpen => Packet::RequestOpen,
            PacketType::RequestClose => Packet::RequestClose,
            PacketType::RequestCloseAll => Packet::RequestCloseAll,
            PacketType::KeepAlive => Packet::KeepAlive,
            PacketType::NotifyOpen => Packet::NotifyOpen { channel: int_at(body, 0)? },
            PacketType::RequestLogin => Packet::RequestLogin {
                username: bytes_at(body, 0)?,
                password: bytes_at(body, 1)?,
            },
            PacketType::Instruction => Packet::Instruction {
                sender: bytes_at(body, 0)?,
                data: map_at(body, 1)?,
            },
            PacketType::NotifyLoginSuccess => Packet::NotifyLoginSuccess { user: bytes_at(body, 0)? },
            PacketType::NotifyLoginFail => Packet::NotifyLoginFail { message: bytes_at(body, 0)? },
            PacketType::NotifyClose => Packet::NotifyClose { port: int_at(body, 0)? },
            PacketType::LeaveReq => Packet::LeaveReq,
            PacketType::Response => Packet::Response {
                command_id: int_at(body, 0)?,
                result: map_at(body, 1)?,
            },
            // Server-cluster-only types: keep the decoded attributes opaque.
            other => Packet::Passthrough {
                packet_type: other,
                body: body.to_vec(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_round_trips(p: Packet) {
        let bytes = p.encode();
        let decoded = Packet::decode(&bytes).expect("decode");
        assert_eq!(decoded, p);
        // Re-encoding the decoded packet must be byte-identical (canonicality).
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn round_trips_simple_packets() {
        assert_round_trips(Packet::JoinReq);
        assert_round_trips(Packet::Welcome);
        assert_round_trips(Packet::KeepAlive);
        assert_round_trips(Packet::LeaveReq);
    }

    #[test]
    fn round_trips_data_packets() {
        assert_round_trips(Packet::IdentifyReq { uuid: b"abc-123".to_vec() });
        assert_round_trips(Packet::SetIdentity { uuid: b"abc-123".to_vec() });
        assert_round_trips(Packet::Log { text: b"hello".to_vec() });
        assert_round_trips(Packet::SendReq { channel: 7, data: vec![1, 2, 3] });
        assert_round_trips(Packet::Route { channel: 7, data: vec![4, 5, 6] });
        assert_round_trips(Packet::Ping { data: vec![0xde, 0xad] });
        assert_round_trips(Packet::Pong { data: vec![0xbe, 0xef] });
        assert_round_trips(Packet::NotifyOpen { channel: 12 });
        assert_round_trips(Packet::NotifyClose { port: 12 });
    }

    #[test]
    fn round_trips_instruction_with_map() {
        let mut data = BTreeMap::new();
        data.insert(b"action".to_vec(), Value::Bytes(b"sync".to_vec()));
        data.insert(b"port".to_vec(), Value::Int(9000));
        assert_round_trips(Packet::Instruction { sender: b"node-1".to_vec(), data });
    }

    #[test]
    fn round_trips_response() {
        let mut result = BTreeMap::new();
        result.insert(b"ok".to_vec(), Value::Int(1));
        assert_round_trips(Packet::Response { command_id: 42, result });
    }

    #[test]
    fn passes_through_unknown_cluster_packets_without_error() {
        let packet = Packet::Passthrough {
            packet_type: PacketType::PeerNotifyDisconnect,
            body: vec![Value::Bytes(b"node-2".to_vec())],
        };
        assert_round_trips(packet);
    }

    #[test]
    fn decode_rejects_unknown_type_id() {
        let bytes = crate::bencode::encode(&Value::List(vec![Value::Int(9999)]));
        match Packet::decode(&bytes) {
            Err(PacketError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_malformed_bencode() {
        match Packet::decode(b"not bencode") {
            Err(PacketError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_missing_attributes() {
        let bytes = crate::bencode::encode(&Value::List(vec![Value::Int(PacketType::Ping as i64)]));
        match Packet::decode(&bytes) {
            Err(PacketError::BadPacket(_)) => {}
            other => panic!("expected BadPacket, got {other:?}"),
        }
    }

    #[test]
    fn decode_tolerates_extra_trailing_attributes() {
        let bytes = crate::bencode::encode(&Value::List(vec![
            Value::Int(PacketType::KeepAlive as i64),
            Value::Int(0), // unexpected extra element
        ]));
        assert_eq!(Packet::decode(&bytes).unwrap(), Packet::KeepAlive);
    }
}
