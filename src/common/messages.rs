//! Serialize and deserialize Rpc frames.
//!
//! A frame is `kind (1 byte) | message id (20 bytes) | bencoded payload`.
//! Requests carry `[method, [sender_id, ...args]]`, responses carry the
//! bencoded return value, which can only be decoded knowing the method
//! of the request it answers.

use std::fmt::{self, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, SerializeTuple};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::{Id, Node, Value};
use crate::{Error, Result};

/// Size of the random message id correlating a response to its request.
pub const MESSAGE_ID_SIZE: usize = 20;
/// Kind byte and message id, a frame carrying an empty payload.
pub const MIN_FRAME_SIZE: usize = 1 + MESSAGE_ID_SIZE;
/// Maximum bencoded size of a request's method and arguments.
pub const MAX_REQUEST_SIZE: usize = 8192;

const REQUEST_KIND: u8 = 0;
const RESPONSE_KIND: u8 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// Random message id, unique per outgoing request.
pub struct MessageId(pub [u8; MESSAGE_ID_SIZE]);

impl MessageId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A decoded datagram.
pub enum Frame {
    Request {
        message_id: MessageId,
        request: Request,
    },
    /// Raw payload, see [Response::from_bytes].
    Response {
        message_id: MessageId,
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn message_id(&self) -> MessageId {
        match self {
            Frame::Request { message_id, .. } => *message_id,
            Frame::Response { message_id, .. } => *message_id,
        }
    }

    /// Encode a request frame, failing before anything is sent if the
    /// payload exceeds [MAX_REQUEST_SIZE].
    pub fn encode_request(message_id: MessageId, request: &Request) -> Result<Vec<u8>> {
        let payload = serde_bencode::to_bytes(request)?;

        if payload.len() > MAX_REQUEST_SIZE {
            return Err(Error::RequestTooLarge(payload.len()));
        }

        Ok(encode(REQUEST_KIND, message_id, &payload))
    }

    pub fn encode_response(message_id: MessageId, response: &Response) -> Result<Vec<u8>> {
        let payload = serde_bencode::to_bytes(response)?;

        Ok(encode(RESPONSE_KIND, message_id, &payload))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Frame> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(Error::MalformedFrame("too short"));
        }

        let mut message_id = [0_u8; MESSAGE_ID_SIZE];
        message_id.copy_from_slice(&bytes[1..MIN_FRAME_SIZE]);
        let message_id = MessageId(message_id);

        let payload = &bytes[MIN_FRAME_SIZE..];

        match bytes[0] {
            REQUEST_KIND => Ok(Frame::Request {
                message_id,
                request: serde_bencode::from_bytes(payload)?,
            }),
            RESPONSE_KIND => Ok(Frame::Response {
                message_id,
                payload: payload.to_vec(),
            }),
            _ => Err(Error::MalformedFrame("unknown kind")),
        }
    }
}

fn encode(kind: u8, message_id: MessageId, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MIN_FRAME_SIZE + payload.len());

    bytes.push(kind);
    bytes.extend_from_slice(&message_id.0);
    bytes.extend_from_slice(payload);

    bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The four Rpc methods.
pub enum Method {
    Ping,
    Store,
    FindNode,
    FindValue,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::Store => "store",
            Method::FindNode => "find_node",
            Method::FindValue => "find_value",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Method> {
        match s {
            "ping" => Ok(Method::Ping),
            "store" => Ok(Method::Store),
            "find_node" => Ok(Method::FindNode),
            "find_value" => Ok(Method::FindValue),
            _ => Err(Error::UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub sender_id: Id,
    pub request_type: RequestSpecific,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestSpecific {
    Ping,
    Store { key: Id, value: Value },
    FindNode { target: Id },
    FindValue { key: Id },
}

impl Request {
    pub fn method(&self) -> Method {
        match self.request_type {
            RequestSpecific::Ping => Method::Ping,
            RequestSpecific::Store { .. } => Method::Store,
            RequestSpecific::FindNode { .. } => Method::FindNode,
            RequestSpecific::FindValue { .. } => Method::FindValue,
        }
    }
}

/// `[sender_id, ...args]`
struct Arguments<'a>(&'a Request);

impl Serialize for Arguments<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let request = self.0;

        match &request.request_type {
            RequestSpecific::Ping => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(&request.sender_id)?;
                seq.end()
            }
            RequestSpecific::Store { key, value } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&request.sender_id)?;
                seq.serialize_element(key)?;
                seq.serialize_element(value)?;
                seq.end()
            }
            RequestSpecific::FindNode { target: id } | RequestSpecific::FindValue { key: id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&request.sender_id)?;
                seq.serialize_element(id)?;
                seq.end()
            }
        }
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(self.method().name())?;
        tuple.serialize_element(&Arguments(self))?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RequestVisitor;

        impl<'de> Visitor<'de> for RequestVisitor {
            type Value = Request;

            fn expecting(&self, f: &mut Formatter) -> fmt::Result {
                f.write_str("a list of method name and arguments")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Request, A::Error> {
                let name: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;

                let method = name.parse::<Method>().map_err(de::Error::custom)?;

                let request = seq
                    .next_element_seed(ArgumentsSeed(method))?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;

                while seq.next_element::<IgnoredAny>()?.is_some() {}

                Ok(request)
            }
        }

        deserializer.deserialize_seq(RequestVisitor)
    }
}

struct ArgumentsSeed(Method);

impl<'de> DeserializeSeed<'de> for ArgumentsSeed {
    type Value = Request;

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Request, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ArgumentsSeed {
    type Value = Request;

    fn expecting(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "arguments of {}", self.0)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Request, A::Error> {
        let sender_id: Id = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;

        let request_type = match self.0 {
            Method::Ping => RequestSpecific::Ping,
            Method::Store => {
                let key = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;

                RequestSpecific::Store { key, value }
            }
            Method::FindNode => RequestSpecific::FindNode {
                target: seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?,
            },
            Method::FindValue => RequestSpecific::FindValue {
                key: seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?,
            },
        };

        while seq.next_element::<IgnoredAny>()?.is_some() {}

        Ok(Request {
            sender_id,
            request_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Return values of the four Rpc methods.
pub enum Response {
    /// `ping` returns the responder's Id.
    Ping(Id),
    /// `store` always returns true.
    Stored,
    /// `find_node`, or `find_value` without the value.
    Nodes(Vec<Node>),
    /// `find_value` with the value.
    Value(Value),
}

impl Response {
    /// Decode the payload of a response to a request for `method`.
    pub fn from_bytes(method: Method, payload: &[u8]) -> Result<Response> {
        let response = match method {
            Method::Ping => Response::Ping(serde_bencode::from_bytes(payload)?),
            Method::Store => {
                serde_bencode::from_bytes::<i64>(payload)?;
                Response::Stored
            }
            Method::FindNode => Response::Nodes(
                serde_bencode::from_bytes::<Vec<WireNode>>(payload)?
                    .into_iter()
                    .map(|n| n.0)
                    .collect(),
            ),
            Method::FindValue => serde_bencode::from_bytes::<FindValueResponse>(payload)?.0,
        };

        Ok(response)
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Response::Ping(id) => id.serialize(serializer),
            Response::Stored => serializer.serialize_i64(1),
            Response::Nodes(nodes) => {
                let mut seq = serializer.serialize_seq(Some(nodes.len()))?;
                for node in nodes {
                    seq.serialize_element(&WireNodeRef(node))?;
                }
                seq.end()
            }
            Response::Value(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("value", value)?;
                map.end()
            }
        }
    }
}

/// `[id, ip, port]`
struct WireNodeRef<'a>(&'a Node);

impl Serialize for WireNodeRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let node = self.0;
        (node.id, node.address.ip().to_string(), node.address.port()).serialize(serializer)
    }
}

struct WireNode(Node);

impl<'de> Deserialize<'de> for WireNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (id, ip, port) = <(Id, String, u16)>::deserialize(deserializer)?;
        let ip = ip.parse::<IpAddr>().map_err(de::Error::custom)?;

        Ok(WireNode(Node::new(id, SocketAddr::new(ip, port))))
    }
}

/// Either a list of nodes or a `{"value": ..}` dictionary.
struct FindValueResponse(Response);

impl<'de> Deserialize<'de> for FindValueResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FindValueVisitor;

        impl<'de> Visitor<'de> for FindValueVisitor {
            type Value = FindValueResponse;

            fn expecting(&self, f: &mut Formatter) -> fmt::Result {
                f.write_str("a list of nodes or a value dictionary")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut nodes = vec![];

                while let Some(WireNode(node)) = seq.next_element()? {
                    nodes.push(node);
                }

                Ok(FindValueResponse(Response::Nodes(nodes)))
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut value = None;

                while let Some(key) = map.next_key::<String>()? {
                    if key == "value" {
                        value = Some(map.next_value::<Value>()?);
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }

                value
                    .map(|v| FindValueResponse(Response::Value(v)))
                    .ok_or_else(|| de::Error::missing_field("value"))
            }
        }

        deserializer.deserialize_any(FindValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(request_type: RequestSpecific) -> Request {
        Request {
            sender_id: Id::random(),
            request_type,
        }
    }

    #[test]
    fn request_frames() {
        let requests = [
            request(RequestSpecific::Ping),
            request(RequestSpecific::Store {
                key: Id::digest("alpha"),
                value: "beta".into(),
            }),
            request(RequestSpecific::FindNode {
                target: Id::random(),
            }),
            request(RequestSpecific::FindValue {
                key: Id::random(),
            }),
        ];

        for request in requests {
            let message_id = MessageId::random();
            let bytes = Frame::encode_request(message_id, &request).unwrap();

            assert_eq!(bytes[0], REQUEST_KIND);
            assert_eq!(&bytes[1..MIN_FRAME_SIZE], &message_id.0);

            let frame = Frame::from_bytes(&bytes).unwrap();

            assert_eq!(
                frame,
                Frame::Request {
                    message_id,
                    request
                }
            );
        }
    }

    #[test]
    fn request_payload_layout() {
        let sender_id = Id([b'a'; 20]);
        let request = Request {
            sender_id,
            request_type: RequestSpecific::Ping,
        };

        let payload = serde_bencode::to_bytes(&request).unwrap();

        assert_eq!(payload, b"l4:pingl20:aaaaaaaaaaaaaaaaaaaaee");
    }

    #[test]
    fn extra_arguments_are_ignored() {
        let payload = b"l4:pingl20:aaaaaaaaaaaaaaaaaaaai42eei7ee";
        let request: Request = serde_bencode::from_bytes(payload).unwrap();

        assert_eq!(request.request_type, RequestSpecific::Ping);
        assert_eq!(request.sender_id, Id([b'a'; 20]));
    }

    #[test]
    fn unknown_method() {
        let payload = b"l7:unknownl20:aaaaaaaaaaaaaaaaaaaaee";

        let mut bytes = vec![REQUEST_KIND];
        bytes.extend_from_slice(&[0; MESSAGE_ID_SIZE]);
        bytes.extend_from_slice(payload);

        assert!(Frame::from_bytes(&bytes).is_err());
    }

    #[test]
    fn short_frames_are_malformed() {
        assert!(matches!(
            Frame::from_bytes(&[0; MIN_FRAME_SIZE - 1]),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::from_bytes(&[7; MIN_FRAME_SIZE + 2]),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn request_too_large() {
        let request = request(RequestSpecific::Store {
            key: Id::random(),
            value: vec![0_u8; MAX_REQUEST_SIZE].into(),
        });

        assert!(matches!(
            Frame::encode_request(MessageId::random(), &request),
            Err(Error::RequestTooLarge(_))
        ));
    }

    #[test]
    fn responses() {
        let nodes = vec![
            Node::random(),
            Node::new(Id::random(), "10.0.0.1:6881".parse().unwrap()),
        ];

        let cases = [
            (Method::Ping, Response::Ping(Id::random())),
            (Method::Store, Response::Stored),
            (Method::FindNode, Response::Nodes(nodes.clone())),
            (Method::FindNode, Response::Nodes(vec![])),
            (Method::FindValue, Response::Nodes(nodes)),
            (Method::FindValue, Response::Value(Value::Float(0.25))),
        ];

        for (method, response) in cases {
            let message_id = MessageId::random();
            let bytes = Frame::encode_response(message_id, &response).unwrap();

            let Frame::Response {
                message_id: decoded_id,
                payload,
            } = Frame::from_bytes(&bytes).unwrap()
            else {
                panic!("expected a response frame");
            };

            assert_eq!(decoded_id, message_id);

            let decoded = Response::from_bytes(method, &payload).unwrap();

            assert_eq!(decoded, response);

            if let (Response::Nodes(a), Response::Nodes(b)) = (&decoded, &response) {
                let addresses =
                    |nodes: &[Node]| nodes.iter().map(|n| n.address).collect::<Vec<_>>();
                assert_eq!(addresses(a), addresses(b));
            }
        }
    }

    #[test]
    fn value_response_layout() {
        let payload = serde_bencode::to_bytes(&Response::Value("beta".into())).unwrap();

        assert_eq!(payload, b"d5:valued1:s4:betaee");
    }

    #[test]
    fn wrong_response_shape() {
        let payload = serde_bencode::to_bytes(&Response::Stored).unwrap();

        assert!(Response::from_bytes(Method::FindNode, &payload).is_err());
        assert!(Response::from_bytes(Method::Ping, &payload).is_err());
    }
}
