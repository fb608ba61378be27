//! Typed response decoders, one per method.
//!
//! A decoder is bound to a request when it is registered with the
//! correlator; the reply is decoded with that function, never with one
//! guessed from the reply bytes. Decoders that carry proofs or headers
//! verify them before handing the record back.

use crate::error::Error;
use crate::header::{verify_header, BlockHeader};
use crate::integrity::{Hash, Verifiers};
use crate::merkle::MerkleTree;
use crate::protocol::{read_method, Method, PortOpen, ERROR_TAG, OK, RESPONSE_TAG};
use crate::rlp::{decode_uint, DecodeError, Fields, Value};
use crate::ticket::{DeviceTicket, TicketOutcome};

const TRANSACTION_HASH: &str = "transaction_hash";
const STATE_HASH: &str = "state_hash";
const BLOCK_HASH: &str = "block_hash";
const PREVIOUS_BLOCK: &str = "previous_block";
const NONCE: &str = "nonce";
const MINER_SIGNATURE: &str = "miner_signature";
const TIMESTAMP: &str = "timestamp";
const NUMBER: &str = "number";

const STORAGE_ROOT: &str = "storageRoot";
const CODE: &str = "code";
const BALANCE: &str = "balance";

const SERVER_OBJECT_TAG: &str = "server";

/// Decoder bound to an outstanding request. `payload` is the full
/// `["response", method, ...]` list.
pub type DecodeFn = fn(&Value, &Verifiers) -> Result<Response, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub storage_root: Vec<u8>,
    pub nonce: u64,
    pub code: Vec<u8>,
    pub balance: u64,
    pub proof: MerkleTree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountValue {
    pub proof: MerkleTree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRoots {
    pub roots: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRoots {
    pub roots: Vec<Vec<u8>>,
}

/// Contact record of an edge server, served by `getnode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerObj {
    pub host: Vec<u8>,
    pub edge_port: u64,
    pub server_port: u64,
    pub sig: Vec<u8>,
}

/// Decoded reply to an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// hello, portsend, portclose, goodbye: nothing beyond an optional `ok`.
    Ack { method: Method },
    PortOpen { open: PortOpen, result: String },
    /// Opaque block value; only headers are verified here.
    Block { method: Method, block: Value },
    BlockHeader {
        method: Method,
        header: BlockHeader,
        hash: Hash,
    },
    BlockQuick { method: Method, numbers: Vec<u64> },
    BlockPeak(u64),
    Account(Account),
    AccountValue(AccountValue),
    AccountRoots(AccountRoots),
    StateRoots(StateRoots),
    Object(DeviceTicket),
    Node(ServerObj),
    Ticket(TicketOutcome),
}

impl Response {
    pub fn method(&self) -> Method {
        match self {
            Response::Ack { method }
            | Response::Block { method, .. }
            | Response::BlockHeader { method, .. }
            | Response::BlockQuick { method, .. } => *method,
            Response::PortOpen { .. } => Method::PortOpen,
            Response::BlockPeak(_) => Method::GetBlockPeak,
            Response::Account(_) => Method::GetAccount,
            Response::AccountValue(_) => Method::GetAccountValue,
            Response::AccountRoots(_) => Method::GetAccountRoots,
            Response::StateRoots(_) => Method::GetStateRoots,
            Response::Object(_) => Method::GetObject,
            Response::Node(_) => Method::GetNode,
            Response::Ticket(_) => Method::Ticket,
        }
    }

    /// Server-side encoding of this response, inverse of the bound decoder.
    pub fn to_payload(&self) -> Value {
        let mut items = vec![
            Value::string(RESPONSE_TAG),
            Value::string(self.method().token()),
        ];
        match self {
            Response::Ack { .. } => {}
            Response::PortOpen { open, result } => {
                items.push(Value::string(result));
                items.push(Value::uint(open.ref_id));
            }
            Response::Block { block, .. } => items.push(block.clone()),
            Response::BlockHeader { header, hash, .. } => {
                items.push(pairs(vec![
                    (TRANSACTION_HASH, Value::Bytes(header.tx_hash.clone())),
                    (STATE_HASH, Value::Bytes(header.state_hash.clone())),
                    (BLOCK_HASH, Value::Bytes(hash.to_vec())),
                    (PREVIOUS_BLOCK, Value::Bytes(header.prev_block.clone())),
                    (NONCE, Value::uint(header.nonce)),
                    (MINER_SIGNATURE, Value::Bytes(header.miner_sig.clone())),
                    (TIMESTAMP, Value::uint(header.timestamp)),
                    (NUMBER, Value::uint(header.number)),
                ]));
                items.push(Value::Bytes(header.miner_pubkey.clone()));
            }
            Response::BlockQuick { numbers, .. } => items.push(Value::List(
                numbers.iter().copied().map(Value::uint).collect(),
            )),
            Response::BlockPeak(n) => items.push(Value::uint(*n)),
            Response::Account(a) => {
                items.push(pairs(vec![
                    (STORAGE_ROOT, Value::Bytes(a.storage_root.clone())),
                    (NONCE, Value::uint(a.nonce)),
                    (CODE, Value::Bytes(a.code.clone())),
                    (BALANCE, Value::uint(a.balance)),
                ]));
                items.push(a.proof.raw.clone());
            }
            Response::AccountValue(v) => items.push(v.proof.raw.clone()),
            Response::AccountRoots(AccountRoots { roots })
            | Response::StateRoots(StateRoots { roots }) => items.push(Value::List(
                roots.iter().cloned().map(Value::Bytes).collect(),
            )),
            Response::Object(ticket) => items.push(ticket.to_object()),
            Response::Node(node) => items.push(Value::List(vec![
                Value::string(SERVER_OBJECT_TAG),
                Value::Bytes(node.host.clone()),
                Value::uint(node.edge_port),
                Value::uint(node.server_port),
                Value::Bytes(node.sig.clone()),
            ])),
            Response::Ticket(outcome) => items.extend(outcome.to_body()),
        }
        Value::List(items)
    }
}

fn pairs(entries: Vec<(&str, Value)>) -> Value {
    Value::List(
        entries
            .into_iter()
            .map(|(k, v)| Value::List(vec![Value::string(k), v]))
            .collect(),
    )
}

/// Server error envelope `["error", method, message]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub method: String,
    pub message: String,
}

impl RemoteError {
    /// The message is the last element; anything between it and the method is ignored.
    pub fn from_payload(payload: &Value) -> Result<Self, DecodeError> {
        let mut f = Fields::new(payload, "payload")?;
        f.token("tag", ERROR_TAG)?;
        let method = String::from_utf8_lossy(f.bytes("method")?).into_owned();
        let mut message = f.bytes("message")?;
        while f.remaining() > 0 {
            message = f.bytes("message")?;
        }
        Ok(Self {
            method,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}

/// Skip the `"response"` tag and method token; the cursor is left on the body.
pub(crate) fn response_body(payload: &Value) -> Result<(Method, Fields<'_>), DecodeError> {
    let mut f = Fields::new(payload, "payload")?;
    f.token("tag", RESPONSE_TAG)?;
    let method = read_method(&mut f)?;
    Ok((method, f))
}

/// `[[key, value]...]` lookup table. Unknown keys are ignored.
struct Items<'a> {
    path: String,
    pairs: Vec<(&'a [u8], &'a [u8])>,
}

impl<'a> Items<'a> {
    fn read(f: &mut Fields<'a>, name: &str) -> Result<Self, DecodeError> {
        let mut list = f.list(name)?;
        let path = list.path().to_string();
        let mut pairs = Vec::with_capacity(list.remaining());
        while list.remaining() > 0 {
            let mut pair = list.list(&format!("[{}]", pairs.len()))?;
            let key = pair.bytes("key")?;
            let value = pair.bytes("value")?;
            pair.finish()?;
            pairs.push((key, value));
        }
        Ok(Self { path, pairs })
    }

    fn bytes(&self, key: &str) -> Result<&'a [u8], DecodeError> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == key.as_bytes())
            .map(|(_, v)| *v)
            .ok_or_else(|| DecodeError::MissingField {
                path: format!("{}.{}", self.path, key),
            })
    }

    fn uint(&self, key: &str) -> Result<u64, DecodeError> {
        decode_uint(self.bytes(key)?).ok_or_else(|| DecodeError::IntegerOverflow {
            path: format!("{}.{}", self.path, key),
        })
    }
}

impl Method {
    /// Decoder bound to requests of this method.
    pub fn decoder(self) -> DecodeFn {
        match self {
            Method::Hello | Method::PortSend | Method::PortClose | Method::Goodbye => decode_ack,
            Method::PortOpen => decode_port_open,
            Method::GetBlock | Method::GetBlock2 => decode_block,
            Method::GetBlockHeader | Method::GetBlockHeader2 => decode_block_header,
            Method::GetBlockQuick | Method::GetBlockQuick2 => decode_block_quick,
            Method::GetBlockPeak => decode_block_peak,
            Method::GetAccount => decode_account,
            Method::GetAccountValue => decode_account_value,
            Method::GetAccountRoots => decode_account_roots,
            Method::GetStateRoots => decode_state_roots,
            Method::GetObject => decode_object,
            Method::GetNode => decode_node,
            Method::Ticket => decode_ticket,
        }
    }
}

fn decode_ack(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (method, mut f) = response_body(payload)?;
    if f.remaining() > 0 {
        f.token("result", OK)?;
    }
    f.finish()?;
    Ok(Response::Ack { method })
}

fn decode_port_open(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (_, mut f) = response_body(payload)?;
    let result = f.string("result")?;
    let ok = result == OK;
    // A refusal may omit the ref.
    let ref_id = if ok || f.remaining() > 0 {
        f.uint("ref")?
    } else {
        0
    };
    f.finish()?;
    Ok(Response::PortOpen {
        open: PortOpen {
            ref_id,
            port: 0,
            device_id: Vec::new(),
            ok,
        },
        result,
    })
}

fn decode_block(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (method, mut f) = response_body(payload)?;
    let block = f.value("block")?.clone();
    f.finish()?;
    Ok(Response::Block { method, block })
}

fn decode_block_header(payload: &Value, verifiers: &Verifiers) -> Result<Response, Error> {
    let (method, mut f) = response_body(payload)?;
    let items = Items::read(&mut f, "header")?;
    let miner_pubkey = f.bytes("miner_pubkey")?.to_vec();
    f.finish()?;
    let header = BlockHeader {
        tx_hash: items.bytes(TRANSACTION_HASH)?.to_vec(),
        state_hash: items.bytes(STATE_HASH)?.to_vec(),
        prev_block: items.bytes(PREVIOUS_BLOCK)?.to_vec(),
        miner_sig: items.bytes(MINER_SIGNATURE)?.to_vec(),
        miner_pubkey,
        timestamp: items.uint(TIMESTAMP)?,
        number: items.uint(NUMBER)?,
        nonce: items.uint(NONCE)?,
    };
    let claimed = items.bytes(BLOCK_HASH)?;
    let hash = verify_header(&header, claimed, verifiers.header_hasher.as_ref())?;
    Ok(Response::BlockHeader {
        method,
        header,
        hash,
    })
}

fn decode_block_quick(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (method, mut f) = response_body(payload)?;
    let numbers = f.list("numbers")?.remaining_uints()?;
    f.finish()?;
    Ok(Response::BlockQuick { method, numbers })
}

fn decode_block_peak(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (_, mut f) = response_body(payload)?;
    let number = f.uint("block_number")?;
    f.finish()?;
    Ok(Response::BlockPeak(number))
}

fn decode_account(payload: &Value, verifiers: &Verifiers) -> Result<Response, Error> {
    let (_, mut f) = response_body(payload)?;
    let items = Items::read(&mut f, "account")?;
    let raw_proof = f.value("proof")?;
    f.finish()?;
    Ok(Response::Account(Account {
        storage_root: items.bytes(STORAGE_ROOT)?.to_vec(),
        nonce: items.uint(NONCE)?,
        code: items.bytes(CODE)?.to_vec(),
        balance: items.uint(BALANCE)?,
        proof: MerkleTree::build(raw_proof, verifiers.hasher.as_ref())?,
    }))
}

fn decode_account_value(payload: &Value, verifiers: &Verifiers) -> Result<Response, Error> {
    let (_, mut f) = response_body(payload)?;
    let raw_proof = f.value("proof")?;
    f.finish()?;
    Ok(Response::AccountValue(AccountValue {
        proof: MerkleTree::build(raw_proof, verifiers.hasher.as_ref())?,
    }))
}

fn decode_account_roots(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (_, mut f) = response_body(payload)?;
    let roots = f.list("roots")?.remaining_bytes()?;
    f.finish()?;
    Ok(Response::AccountRoots(AccountRoots { roots }))
}

fn decode_state_roots(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (_, mut f) = response_body(payload)?;
    let roots = f.list("roots")?.remaining_bytes()?;
    f.finish()?;
    Ok(Response::StateRoots(StateRoots { roots }))
}

fn decode_object(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (_, mut f) = response_body(payload)?;
    let ticket = DeviceTicket::from_object(f.list("object")?)?;
    f.finish()?;
    Ok(Response::Object(ticket))
}

fn decode_node(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (_, mut f) = response_body(payload)?;
    let mut node = f.list("server")?;
    node.token("tag", SERVER_OBJECT_TAG)?;
    let server = ServerObj {
        host: node.bytes("host")?.to_vec(),
        edge_port: node.uint("edge_port")?,
        server_port: node.uint("server_port")?,
        sig: node.bytes("sig")?.to_vec(),
    };
    node.finish()?;
    f.finish()?;
    Ok(Response::Node(server))
}

fn decode_ticket(payload: &Value, _: &Verifiers) -> Result<Response, Error> {
    let (_, f) = response_body(payload)?;
    Ok(Response::Ticket(TicketOutcome::from_body(f)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HeaderHasher, RlpHeaderHasher};
    use crate::identity::Address;
    use crate::integrity::{Hasher, Sha256Hasher};
    use crate::rlp;
    use crate::ticket::TicketRejection;

    fn decode(method: Method, payload: &Value) -> Result<Response, Error> {
        let wire = rlp::decode(&rlp::encode(payload)).unwrap();
        (method.decoder())(&wire, &Verifiers::default())
    }

    fn header() -> BlockHeader {
        BlockHeader {
            tx_hash: vec![1; 32],
            state_hash: vec![2; 32],
            prev_block: vec![3; 32],
            miner_sig: vec![4; 65],
            miner_pubkey: vec![5; 33],
            timestamp: 1_600_000_000,
            number: 77,
            nonce: 9,
        }
    }

    fn proof() -> MerkleTree {
        let bucket = Value::List(vec![
            Value::Bytes(vec![]),
            Value::uint(5),
            Value::List(vec![Value::from(&b"k"[..]), Value::from(&b"v"[..])]),
        ]);
        let raw = Value::List(vec![bucket, Value::Bytes(vec![8; 32])]);
        MerkleTree::build(&raw, &Sha256Hasher).unwrap()
    }

    fn responses() -> Vec<Response> {
        let h = header();
        let hash = RlpHeaderHasher::new(Sha256Hasher).header_hash(&h);
        vec![
            Response::Ack {
                method: Method::PortSend,
            },
            Response::PortOpen {
                open: PortOpen {
                    ref_id: 4,
                    port: 0,
                    device_id: vec![],
                    ok: true,
                },
                result: "ok".into(),
            },
            Response::Block {
                method: Method::GetBlock2,
                block: Value::List(vec![Value::uint(1), Value::List(vec![])]),
            },
            Response::BlockHeader {
                method: Method::GetBlockHeader,
                header: h,
                hash,
            },
            Response::BlockQuick {
                method: Method::GetBlockQuick,
                numbers: vec![10, 11, 12],
            },
            Response::BlockPeak(500),
            Response::Account(Account {
                storage_root: vec![6; 32],
                nonce: 3,
                code: vec![7; 32],
                balance: 1_000_000,
                proof: proof(),
            }),
            Response::AccountValue(AccountValue { proof: proof() }),
            Response::AccountRoots(AccountRoots {
                roots: vec![vec![1; 32], vec![2; 32]],
            }),
            Response::StateRoots(StateRoots {
                roots: vec![vec![3; 32]; 16],
            }),
            Response::Object(DeviceTicket {
                server_id: Address::new([1; 20]),
                fleet_addr: Address::new([2; 20]),
                total_connections: 1,
                total_bytes: 10,
                local_addr: vec![1],
                device_sig: vec![3; 65],
                server_sig: vec![4; 65],
                block_number: 99,
                ..DeviceTicket::default()
            }),
            Response::Node(ServerObj {
                host: b"edge.example".to_vec(),
                edge_port: 41046,
                server_port: 443,
                sig: vec![5; 65],
            }),
            Response::Ticket(TicketOutcome::Accepted {
                paid_bytes: Some(1),
            }),
        ]
    }

    #[test]
    fn every_response_roundtrips_through_its_decoder() {
        for response in responses() {
            let decoded = decode(response.method(), &response.to_payload()).unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn account_counters_use_full_unsigned_range() {
        let account = Response::Account(Account {
            storage_root: vec![6; 32],
            nonce: u64::MAX,
            code: vec![],
            balance: i64::MAX as u64 + 1,
            proof: proof(),
        });
        assert_eq!(
            decode(Method::GetAccount, &account.to_payload()).unwrap(),
            account
        );
    }

    #[test]
    fn empty_and_ok_acks_accepted() {
        for body in [vec![], vec![Value::string("ok")]] {
            let mut items = vec![Value::string("response"), Value::string("hello")];
            items.extend(body);
            assert_eq!(
                decode(Method::Hello, &Value::List(items)).unwrap(),
                Response::Ack {
                    method: Method::Hello
                }
            );
        }
    }

    #[test]
    fn refused_port_open_without_ref() {
        let payload = Value::List(vec!["response".into(), "portopen".into(), "not allowed".into()]);
        match decode(Method::PortOpen, &payload).unwrap() {
            Response::PortOpen { open, result } => {
                assert!(!open.ok);
                assert_eq!(result, "not allowed");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tampered_header_is_a_protocol_mismatch() {
        let h = header();
        let hash = RlpHeaderHasher::new(Sha256Hasher).header_hash(&h);
        let mut tampered = h.clone();
        tampered.timestamp += 1;
        let payload = Response::BlockHeader {
            method: Method::GetBlockHeader2,
            header: tampered,
            hash,
        }
        .to_payload();
        assert!(matches!(
            decode(Method::GetBlockHeader2, &payload),
            Err(Error::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn header_missing_key_reports_path() {
        let payload = Value::List(vec![
            "response".into(),
            "getblockheader".into(),
            Value::List(vec![Value::List(vec!["number".into(), Value::uint(1)])]),
            Value::Bytes(vec![5; 33]),
        ]);
        match decode(Method::GetBlockHeader, &payload) {
            Err(Error::Decode(err)) => {
                assert_eq!(err.path(), "payload.header.transaction_hash")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn account_proof_is_verified() {
        let payload = Value::List(vec![
            "response".into(),
            "getaccount".into(),
            pairs(vec![
                (STORAGE_ROOT, Value::Bytes(vec![1; 32])),
                (NONCE, Value::uint(1)),
                (CODE, Value::Bytes(vec![])),
                (BALANCE, Value::uint(2)),
            ]),
            Value::List(vec![Value::Bytes(vec![1, 2]), Value::Bytes(vec![])]),
        ]);
        assert!(matches!(
            decode(Method::GetAccount, &payload),
            Err(Error::Proof(_))
        ));
    }

    #[test]
    fn account_proof_root_matches_manual_hash() {
        let response = Response::AccountValue(AccountValue { proof: proof() });
        match decode(Method::GetAccountValue, &response.to_payload()).unwrap() {
            Response::AccountValue(v) => {
                let bucket = v.proof.raw.as_list().unwrap()[0].clone();
                let mut preimage = Sha256Hasher.hash(&rlp::encode(&bucket)).to_vec();
                preimage.extend_from_slice(&[8; 32]);
                assert_eq!(v.proof.root_hash, Sha256Hasher.hash(&preimage));
                assert_eq!(v.proof.module, 5);
                assert_eq!(v.proof.value(b"k"), Some(&b"v"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ticket_decoder_maps_too_low() {
        let outcome = TicketOutcome::TooLow {
            block_hash: vec![1; 32],
            total_connections: 4,
            total_bytes: 400,
            local_addr: vec![],
            device_sig: vec![2; 65],
        };
        match decode(Method::Ticket, &Response::Ticket(outcome).to_payload()).unwrap() {
            Response::Ticket(o) => {
                assert_eq!(o.ticket().error, Some(TicketRejection::TooLow));
                assert_eq!(o.ticket().total_bytes, 400);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wrong_tag_rejected() {
        let payload = Value::List(vec!["error".into(), "getblockpeak".into(), Value::uint(1)]);
        assert!(matches!(
            decode(Method::GetBlockPeak, &payload),
            Err(Error::Decode(DecodeError::Literal { .. }))
        ));
    }

    #[test]
    fn remote_error_takes_last_element() {
        let payload = Value::List(vec![
            "error".into(),
            "getaccount".into(),
            Value::uint(3),
            "account does not exist".into(),
        ]);
        let err = RemoteError::from_payload(&payload).unwrap();
        assert_eq!(err.method, "getaccount");
        assert_eq!(err.message, "account does not exist");
    }
}
