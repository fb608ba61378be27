//! Edge wire protocol: method tokens, typed requests, and tunnel control records.

use crate::rlp::{DecodeError, Fields, Value};

/// Outer tag of every response payload.
pub const RESPONSE_TAG: &str = "response";
/// Outer tag of every error payload.
pub const ERROR_TAG: &str = "error";
/// Result token of a successful port open.
pub const OK: &str = "ok";
pub const TICKET_THANKS: &str = "thanks!";
pub const TICKET_TOO_OLD: &str = "too_old";
pub const TICKET_TOO_LOW: &str = "too_low";

/// Every method the edge protocol knows, identified on the wire by a fixed lowercase token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Hello,
    PortOpen,
    PortSend,
    PortClose,
    Goodbye,
    GetBlock,
    GetBlock2,
    GetBlockHeader,
    GetBlockHeader2,
    GetBlockQuick,
    GetBlockQuick2,
    GetBlockPeak,
    GetAccount,
    GetAccountValue,
    GetAccountRoots,
    GetStateRoots,
    GetObject,
    GetNode,
    Ticket,
}

/// Token table. Immutable for the life of the process.
const METHOD_TOKENS: [(Method, &str); 19] = [
    (Method::Hello, "hello"),
    (Method::PortOpen, "portopen"),
    (Method::PortSend, "portsend"),
    (Method::PortClose, "portclose"),
    (Method::Goodbye, "goodbye"),
    (Method::GetBlock, "getblock"),
    (Method::GetBlock2, "getblock2"),
    (Method::GetBlockHeader, "getblockheader"),
    (Method::GetBlockHeader2, "getblockheader2"),
    (Method::GetBlockQuick, "getblockquick"),
    (Method::GetBlockQuick2, "getblockquick2"),
    (Method::GetBlockPeak, "getblockpeak"),
    (Method::GetAccount, "getaccount"),
    (Method::GetAccountValue, "getaccountvalue"),
    (Method::GetAccountRoots, "getaccountroots"),
    (Method::GetStateRoots, "getstateroots"),
    (Method::GetObject, "getobject"),
    (Method::GetNode, "getnode"),
    (Method::Ticket, "ticket"),
];

impl Method {
    pub const ALL: [Method; 19] = [
        Method::Hello,
        Method::PortOpen,
        Method::PortSend,
        Method::PortClose,
        Method::Goodbye,
        Method::GetBlock,
        Method::GetBlock2,
        Method::GetBlockHeader,
        Method::GetBlockHeader2,
        Method::GetBlockQuick,
        Method::GetBlockQuick2,
        Method::GetBlockPeak,
        Method::GetAccount,
        Method::GetAccountValue,
        Method::GetAccountRoots,
        Method::GetStateRoots,
        Method::GetObject,
        Method::GetNode,
        Method::Ticket,
    ];

    pub fn token(self) -> &'static str {
        METHOD_TOKENS
            .iter()
            .find(|(m, _)| *m == self)
            .map(|(_, t)| *t)
            .unwrap_or_default()
    }

    /// Exact token match; never a substring search.
    pub fn from_token(token: &[u8]) -> Option<Method> {
        METHOD_TOKENS
            .iter()
            .find(|(_, t)| t.as_bytes() == token)
            .map(|(m, _)| *m)
    }

    /// Methods an edge server may send to the device as requests.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Method::PortOpen | Method::PortSend | Method::PortClose | Method::Goodbye
        )
    }

    /// Whether the server answers this request. The rest are sent without a
    /// correlator entry.
    pub fn expects_reply(self) -> bool {
        !matches!(
            self,
            Method::Hello | Method::PortSend | Method::PortClose | Method::Goodbye
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Read the method token at the head of a payload.
pub(crate) fn read_method(fields: &mut Fields<'_>) -> Result<Method, DecodeError> {
    let raw = fields.bytes("method")?;
    Method::from_token(raw).ok_or_else(|| DecodeError::UnknownMethod {
        path: fields.child_path("method"),
        method: String::from_utf8_lossy(raw).into_owned(),
    })
}

/// Outbound request. One variant per method, each with its exact argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello {
        flag: u64,
    },
    PortOpen {
        device_id: Vec<u8>,
        port: u64,
        mode: String,
    },
    PortSend {
        ref_id: u64,
        data: Vec<u8>,
    },
    PortClose {
        ref_id: u64,
    },
    Goodbye {
        reason: String,
    },
    GetBlock {
        block_number: u64,
    },
    GetBlock2 {
        block_number: u64,
    },
    GetBlockHeader {
        block_number: u64,
    },
    GetBlockHeader2 {
        block_number: u64,
    },
    GetBlockQuick {
        last_valid: u64,
        window_size: u64,
    },
    GetBlockQuick2 {
        last_valid: u64,
        window_size: u64,
    },
    GetBlockPeak,
    GetAccount {
        block_number: u64,
        address: Vec<u8>,
    },
    GetAccountValue {
        block_number: u64,
        address: Vec<u8>,
        key: Vec<u8>,
    },
    GetAccountRoots {
        block_number: u64,
        address: Vec<u8>,
    },
    GetStateRoots {
        block_number: u64,
    },
    GetObject {
        device_id: Vec<u8>,
    },
    GetNode {
        server_id: Vec<u8>,
    },
    Ticket {
        block_number: u64,
        fleet_addr: Vec<u8>,
        total_connections: u64,
        total_bytes: u64,
        local_addr: Vec<u8>,
        device_sig: Vec<u8>,
    },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Hello { .. } => Method::Hello,
            Request::PortOpen { .. } => Method::PortOpen,
            Request::PortSend { .. } => Method::PortSend,
            Request::PortClose { .. } => Method::PortClose,
            Request::Goodbye { .. } => Method::Goodbye,
            Request::GetBlock { .. } => Method::GetBlock,
            Request::GetBlock2 { .. } => Method::GetBlock2,
            Request::GetBlockHeader { .. } => Method::GetBlockHeader,
            Request::GetBlockHeader2 { .. } => Method::GetBlockHeader2,
            Request::GetBlockQuick { .. } => Method::GetBlockQuick,
            Request::GetBlockQuick2 { .. } => Method::GetBlockQuick2,
            Request::GetBlockPeak => Method::GetBlockPeak,
            Request::GetAccount { .. } => Method::GetAccount,
            Request::GetAccountValue { .. } => Method::GetAccountValue,
            Request::GetAccountRoots { .. } => Method::GetAccountRoots,
            Request::GetStateRoots { .. } => Method::GetStateRoots,
            Request::GetObject { .. } => Method::GetObject,
            Request::GetNode { .. } => Method::GetNode,
            Request::Ticket { .. } => Method::Ticket,
        }
    }

    /// Payload list: method token followed by the arguments.
    pub fn to_value(&self) -> Value {
        let mut items = vec![Value::string(self.method().token())];
        match self {
            Request::Hello { flag } => items.push(Value::uint(*flag)),
            Request::PortOpen {
                device_id,
                port,
                mode,
            } => {
                items.push(Value::Bytes(device_id.clone()));
                items.push(Value::uint(*port));
                items.push(Value::string(mode));
            }
            Request::PortSend { ref_id, data } => {
                items.push(Value::uint(*ref_id));
                items.push(Value::Bytes(data.clone()));
            }
            Request::PortClose { ref_id } => items.push(Value::uint(*ref_id)),
            Request::Goodbye { reason } => items.push(Value::string(reason)),
            Request::GetBlock { block_number }
            | Request::GetBlock2 { block_number }
            | Request::GetBlockHeader { block_number }
            | Request::GetBlockHeader2 { block_number }
            | Request::GetStateRoots { block_number } => items.push(Value::uint(*block_number)),
            Request::GetBlockQuick {
                last_valid,
                window_size,
            }
            | Request::GetBlockQuick2 {
                last_valid,
                window_size,
            } => {
                items.push(Value::uint(*last_valid));
                items.push(Value::uint(*window_size));
            }
            Request::GetBlockPeak => {}
            Request::GetAccount {
                block_number,
                address,
            }
            | Request::GetAccountRoots {
                block_number,
                address,
            } => {
                items.push(Value::uint(*block_number));
                items.push(Value::Bytes(address.clone()));
            }
            Request::GetAccountValue {
                block_number,
                address,
                key,
            } => {
                items.push(Value::uint(*block_number));
                items.push(Value::Bytes(address.clone()));
                items.push(Value::Bytes(key.clone()));
            }
            Request::GetObject { device_id } => items.push(Value::Bytes(device_id.clone())),
            Request::GetNode { server_id } => items.push(Value::Bytes(server_id.clone())),
            Request::Ticket {
                block_number,
                fleet_addr,
                total_connections,
                total_bytes,
                local_addr,
                device_sig,
            } => {
                items.push(Value::uint(*block_number));
                items.push(Value::Bytes(fleet_addr.clone()));
                items.push(Value::uint(*total_connections));
                items.push(Value::uint(*total_bytes));
                items.push(Value::Bytes(local_addr.clone()));
                items.push(Value::Bytes(device_sig.clone()));
            }
        }
        Value::List(items)
    }

    /// Decode an outbound request payload (arity is checked exactly).
    pub fn from_value(payload: &Value) -> Result<Self, DecodeError> {
        let mut f = Fields::new(payload, "payload")?;
        let request = match read_method(&mut f)? {
            Method::Hello => Request::Hello {
                flag: f.uint("flag")?,
            },
            Method::PortOpen => Request::PortOpen {
                device_id: f.bytes("device_id")?.to_vec(),
                port: f.uint("port")?,
                mode: f.string("mode")?,
            },
            Method::PortSend => Request::PortSend {
                ref_id: f.uint("ref")?,
                data: f.bytes("data")?.to_vec(),
            },
            Method::PortClose => Request::PortClose {
                ref_id: f.uint("ref")?,
            },
            Method::Goodbye => Request::Goodbye {
                reason: f.string("reason")?,
            },
            Method::GetBlock => Request::GetBlock {
                block_number: f.uint("block_number")?,
            },
            Method::GetBlock2 => Request::GetBlock2 {
                block_number: f.uint("block_number")?,
            },
            Method::GetBlockHeader => Request::GetBlockHeader {
                block_number: f.uint("block_number")?,
            },
            Method::GetBlockHeader2 => Request::GetBlockHeader2 {
                block_number: f.uint("block_number")?,
            },
            Method::GetBlockQuick => Request::GetBlockQuick {
                last_valid: f.uint("last_valid")?,
                window_size: f.uint("window_size")?,
            },
            Method::GetBlockQuick2 => Request::GetBlockQuick2 {
                last_valid: f.uint("last_valid")?,
                window_size: f.uint("window_size")?,
            },
            Method::GetBlockPeak => Request::GetBlockPeak,
            Method::GetAccount => Request::GetAccount {
                block_number: f.uint("block_number")?,
                address: f.bytes("address")?.to_vec(),
            },
            Method::GetAccountValue => Request::GetAccountValue {
                block_number: f.uint("block_number")?,
                address: f.bytes("address")?.to_vec(),
                key: f.bytes("key")?.to_vec(),
            },
            Method::GetAccountRoots => Request::GetAccountRoots {
                block_number: f.uint("block_number")?,
                address: f.bytes("address")?.to_vec(),
            },
            Method::GetStateRoots => Request::GetStateRoots {
                block_number: f.uint("block_number")?,
            },
            Method::GetObject => Request::GetObject {
                device_id: f.bytes("device_id")?.to_vec(),
            },
            Method::GetNode => Request::GetNode {
                server_id: f.bytes("server_id")?.to_vec(),
            },
            Method::Ticket => Request::Ticket {
                block_number: f.uint("block_number")?,
                fleet_addr: f.bytes("fleet_addr")?.to_vec(),
                total_connections: f.uint("total_connections")?,
                total_bytes: f.uint("total_bytes")?,
                local_addr: f.bytes("local_addr")?.to_vec(),
                device_sig: f.bytes("device_sig")?.to_vec(),
            },
        };
        f.finish()?;
        Ok(request)
    }
}

/// Port open: a device asks for a tunnel, or the server announces one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOpen {
    pub ref_id: u64,
    pub port: u64,
    pub device_id: Vec<u8>,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSend {
    pub ref_id: u64,
    pub data: Vec<u8>,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortClose {
    pub ref_id: u64,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub reason: String,
}

/// Request an edge server sends to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRequest {
    PortOpen(PortOpen),
    PortSend(PortSend),
    PortClose(PortClose),
    Goodbye(Goodbye),
}

impl InboundRequest {
    pub fn method(&self) -> Method {
        match self {
            InboundRequest::PortOpen(_) => Method::PortOpen,
            InboundRequest::PortSend(_) => Method::PortSend,
            InboundRequest::PortClose(_) => Method::PortClose,
            InboundRequest::Goodbye(_) => Method::Goodbye,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut items = vec![Value::string(self.method().token())];
        match self {
            InboundRequest::PortOpen(p) => {
                items.push(Value::uint(p.port));
                items.push(Value::uint(p.ref_id));
                items.push(Value::Bytes(p.device_id.clone()));
            }
            InboundRequest::PortSend(p) => {
                items.push(Value::uint(p.ref_id));
                items.push(Value::Bytes(p.data.clone()));
            }
            InboundRequest::PortClose(p) => items.push(Value::uint(p.ref_id)),
            InboundRequest::Goodbye(g) => items.push(Value::string(&g.reason)),
        }
        Value::List(items)
    }

    /// Decode a server-originated request. Inbound requests are always `ok`.
    pub fn from_value(payload: &Value) -> Result<Self, DecodeError> {
        let mut f = Fields::new(payload, "payload")?;
        let method = read_method(&mut f)?;
        let request = match method {
            Method::PortOpen => InboundRequest::PortOpen(PortOpen {
                port: f.uint("port")?,
                ref_id: f.uint("ref")?,
                device_id: f.bytes("device_id")?.to_vec(),
                ok: true,
            }),
            Method::PortSend => InboundRequest::PortSend(PortSend {
                ref_id: f.uint("ref")?,
                data: f.bytes("data")?.to_vec(),
                ok: true,
            }),
            Method::PortClose => InboundRequest::PortClose(PortClose {
                ref_id: f.uint("ref")?,
                ok: true,
            }),
            Method::Goodbye => {
                let reason = f.string("reason")?;
                // Servers may append a free-form detail after the reason.
                if f.remaining() > 0 {
                    f.string("detail")?;
                }
                InboundRequest::Goodbye(Goodbye { reason })
            }
            other => {
                return Err(DecodeError::UnknownMethod {
                    path: f.child_path("method"),
                    method: other.token().to_string(),
                })
            }
        };
        f.finish()?;
        Ok(request)
    }
}

/// Reply the device sends for an accepted inbound port open.
pub fn port_open_reply(ref_id: u64) -> Value {
    Value::List(vec![
        Value::string(RESPONSE_TAG),
        Value::string(Method::PortOpen.token()),
        Value::uint(ref_id),
        Value::string(OK),
    ])
}

/// Error payload: `["error", method, message]`.
pub fn error_reply(method: Method, message: &str) -> Value {
    Value::List(vec![
        Value::string(ERROR_TAG),
        Value::string(method.token()),
        Value::string(message),
    ])
}
