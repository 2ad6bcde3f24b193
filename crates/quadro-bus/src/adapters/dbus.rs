//! # D-Bus Adapter
//!
//! Transport over the real host and session buses using `zbus` on the tokio
//! executor. Each outgoing call runs as its own task on the dispatch
//! runtime; its reply or error comes back tagged with the originating
//! [`CallId`]. Signals are read from the connection's message stream.
//!
//! Signals carry the sender's unique connection name, never the well-known
//! name that was subscribed to, so the dispatch loop resolves well-known
//! names to their owners ([`SenderMatching::UniqueNames`]).
//!
//! ## Value mapping
//!
//! | Variant | Outgoing | Incoming |
//! |---------|----------|----------|
//! | `Bool` | `b` | `b` |
//! | `Int` | `i` when it fits, else `x` | `y n q i u x t` |
//! | `Float` | `d` | `d` |
//! | `Str` | `s` | `s o g` |
//! | `List` | `av` | arrays, structs |
//! | `Map` | `a{sv}` | dicts (keys stringified) |

use crate::domain::{CallId, InboundMessage, InboundSignal, MethodCall, SenderMatching};
use crate::ports::{BusConnector, BusTransport, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use quadro_types::{BusKind, ConnectionError, Variant};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tracing::debug;
use zbus::message::Type as MessageType;
use zbus::zvariant::{Structure, StructureBuilder, Value};
use zbus::{Connection, Message, MessageStream};

const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

type Reply = Result<InboundMessage, TransportError>;

/// Connects to the host or session bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbusConnector;

impl DbusConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BusConnector for DbusConnector {
    async fn connect(&self, kind: BusKind) -> Result<Box<dyn BusTransport>, ConnectionError> {
        let connection = match kind {
            BusKind::System => Connection::system().await,
            BusKind::Session => Connection::session().await,
        }
        .map_err(|e| ConnectionError::Unreachable {
            bus: kind,
            reason: e.to_string(),
        })?;

        debug!(bus = %kind, unique_name = ?connection.unique_name(), "Connected to D-Bus");
        let stream = MessageStream::from(&connection);
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        Ok(Box::new(DbusTransport {
            connection,
            stream,
            replies_tx,
            replies_rx,
        }))
    }
}

/// One `zbus` connection.
pub struct DbusTransport {
    connection: Connection,
    stream: MessageStream,
    replies_tx: mpsc::UnboundedSender<Reply>,
    replies_rx: mpsc::UnboundedReceiver<Reply>,
}

#[async_trait]
impl BusTransport for DbusTransport {
    async fn send(&mut self, call: MethodCall) -> Result<(), TransportError> {
        let MethodCall { id, endpoint, args } = call;
        let body = encode_body(args)?;
        let connection = self.connection.clone();
        let replies = self.replies_tx.clone();

        tokio::spawn(async move {
            let result = match &body {
                Some(body) => {
                    connection
                        .call_method(
                            Some(endpoint.service()),
                            endpoint.path(),
                            Some(endpoint.interface()),
                            endpoint.member(),
                            body,
                        )
                        .await
                }
                None => {
                    connection
                        .call_method(
                            Some(endpoint.service()),
                            endpoint.path(),
                            Some(endpoint.interface()),
                            endpoint.member(),
                            &(),
                        )
                        .await
                }
            };
            let _ = replies.send(Ok(reply_message(id, result)));
        });
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundMessage, TransportError>> {
        loop {
            tokio::select! {
                Some(reply) = self.replies_rx.recv() => return Some(reply),
                next = self.stream.next() => match next {
                    None => return None,
                    Some(Err(e)) => return Some(Err(TransportError::Io(e.to_string()))),
                    Some(Ok(message)) => {
                        if message.message_type() == MessageType::Signal {
                            return Some(decode_signal(&message));
                        }
                    }
                },
            }
        }
    }

    fn sender_matching(&self) -> SenderMatching {
        SenderMatching::UniqueNames
    }
}

fn reply_message(id: CallId, result: zbus::Result<Message>) -> InboundMessage {
    match result {
        Ok(message) => match decode_body(&message) {
            Ok(body) => InboundMessage::MethodReturn { reply_to: id, body },
            Err(e) => InboundMessage::Error {
                reply_to: id,
                name: ERROR_FAILED.to_string(),
                message: Some(e.to_string()),
            },
        },
        Err(zbus::Error::MethodError(name, message, _)) => InboundMessage::Error {
            reply_to: id,
            name: name.to_string(),
            message,
        },
        Err(e) => InboundMessage::Error {
            reply_to: id,
            name: ERROR_FAILED.to_string(),
            message: Some(e.to_string()),
        },
    }
}

fn decode_signal(message: &Message) -> Result<InboundMessage, TransportError> {
    let header = message.header();
    let field = |name: &str| TransportError::Decode(format!("signal without {name}"));
    let path = header.path().ok_or_else(|| field("path"))?.to_string();
    let interface = header.interface().ok_or_else(|| field("interface"))?.to_string();
    let member = header.member().ok_or_else(|| field("member"))?.to_string();
    let sender = header.sender().map(|s| s.to_string());
    let args = decode_body(message)?;

    Ok(InboundMessage::Signal(InboundSignal::new(
        sender, path, interface, member, args,
    )))
}

fn decode_body(message: &Message) -> Result<Vec<Variant>, TransportError> {
    let has_body = message
        .header()
        .signature()
        .is_some_and(|s| !s.as_str().is_empty());
    if !has_body {
        return Ok(Vec::new());
    }
    let body = message.body();
    let structure: Structure<'_> = body
        .deserialize()
        .map_err(|e| TransportError::Decode(e.to_string()))?;
    structure.fields().iter().map(from_value).collect()
}

fn encode_body(args: Vec<Variant>) -> Result<Option<Structure<'static>>, TransportError> {
    if args.is_empty() {
        return Ok(None);
    }
    let mut builder = StructureBuilder::new();
    for arg in args {
        builder = builder.append_field(to_value(arg)?);
    }
    Ok(Some(builder.build()))
}

fn to_value(variant: Variant) -> Result<Value<'static>, TransportError> {
    Ok(match variant {
        Variant::Empty => {
            return Err(TransportError::Encode(
                "absent value inside a container".to_string(),
            ))
        }
        Variant::Bool(b) => Value::Bool(b),
        Variant::Int(n) => match i32::try_from(n) {
            Ok(small) => Value::I32(small),
            Err(_) => Value::I64(n),
        },
        Variant::Float(f) => Value::F64(f),
        Variant::Str(s) => Value::from(s),
        Variant::List(items) => {
            let items = items
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<Value<'static>>, _>>()?;
            Value::from(items)
        }
        Variant::Map(entries) => {
            let entries = entries
                .into_iter()
                .map(|(k, v)| Ok((k, to_value(v)?)))
                .collect::<Result<HashMap<String, Value<'static>>, TransportError>>()?;
            Value::from(entries)
        }
    })
}

fn from_value(value: &Value<'_>) -> Result<Variant, TransportError> {
    Ok(match value {
        Value::Bool(b) => Variant::Bool(*b),
        Value::U8(n) => Variant::Int(i64::from(*n)),
        Value::I16(n) => Variant::Int(i64::from(*n)),
        Value::U16(n) => Variant::Int(i64::from(*n)),
        Value::I32(n) => Variant::Int(i64::from(*n)),
        Value::U32(n) => Variant::Int(i64::from(*n)),
        Value::I64(n) => Variant::Int(*n),
        Value::U64(n) => match i64::try_from(*n) {
            Ok(n) => Variant::Int(n),
            Err(_) => Variant::Float(*n as f64),
        },
        Value::F64(f) => Variant::Float(*f),
        Value::Str(s) => Variant::Str(s.to_string()),
        Value::ObjectPath(p) => Variant::Str(p.to_string()),
        Value::Signature(s) => Variant::Str(s.to_string()),
        Value::Value(inner) => from_value(inner)?,
        Value::Array(array) => Variant::List(
            array
                .iter()
                .map(from_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Structure(structure) => Variant::List(
            structure
                .fields()
                .iter()
                .map(from_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Dict(dict) => {
            let mut map = BTreeMap::new();
            for (key, value) in dict.iter() {
                let key = match from_value(key)? {
                    Variant::Str(s) => s,
                    Variant::Int(n) => n.to_string(),
                    Variant::Bool(b) => b.to_string(),
                    Variant::Float(f) => f.to_string(),
                    other => {
                        return Err(TransportError::Decode(format!(
                            "unsupported dict key of kind {}",
                            other.kind()
                        )))
                    }
                };
                map.insert(key, from_value(value)?);
            }
            Variant::Map(map)
        }
        other => {
            return Err(TransportError::Decode(format!(
                "unsupported value signature {}",
                other.value_signature()
            )))
        }
    })
}
