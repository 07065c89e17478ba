//! Message families carried inside RLPx frames.
//!
//! Two closed families: the DevP2P base protocol (codes 0x00..0x10, fixed)
//! and LES v2 (codes relative to the capability's negotiated offset).
//! Each variant has one encoder and one decoder selected by its code.

use primitive_types::{H256, U256};

use crate::capability::Capability;
use crate::header::BlockHeader;
use crate::rlp::{self, Encodable, Rlp};
use crate::{NodeId, ProtocolError};

/// First message id available to negotiated capabilities.
pub const BASE_PROTOCOL_LENGTH: u64 = 0x10;

fn decode_payload(payload: &[u8]) -> Result<Rlp, ProtocolError> {
    Ok(rlp::decode_exact(payload)?)
}

// ============================================================================
// DevP2P base protocol
// ============================================================================

pub const HELLO: u64 = 0x00;
pub const DISCONNECT: u64 = 0x01;
pub const PING: u64 = 0x02;
pub const PONG: u64 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub p2p_version: u64,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub node_id: NodeId,
}

impl Hello {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(5)?;
        let capabilities = f[2]
            .as_list()?
            .iter()
            .map(Capability::decode)
            .collect::<rlp::Result<Vec<_>>>()?;
        Ok(Self {
            p2p_version: f[0].as_u64()?,
            client_id: f[1].as_text()?,
            capabilities,
            listen_port: f[3].as_u16()?,
            node_id: NodeId::from_slice(f[4].as_bytes()?)?,
        })
    }
}

impl Encodable for Hello {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.p2p_version.to_rlp(),
            self.client_id.to_rlp(),
            Rlp::list(self.capabilities.iter().map(Encodable::to_rlp).collect()),
            self.listen_port.to_rlp(),
            self.node_id.to_rlp(),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    TcpError,
    BreachOfProtocol,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleVersion,
    InvalidIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    ConnectedToSelf,
    Timeout,
    SubprotocolError,
    Unknown(u8),
}

impl DisconnectReason {
    pub fn code(&self) -> u8 {
        match self {
            DisconnectReason::Requested => 0x00,
            DisconnectReason::TcpError => 0x01,
            DisconnectReason::BreachOfProtocol => 0x02,
            DisconnectReason::UselessPeer => 0x03,
            DisconnectReason::TooManyPeers => 0x04,
            DisconnectReason::AlreadyConnected => 0x05,
            DisconnectReason::IncompatibleVersion => 0x06,
            DisconnectReason::InvalidIdentity => 0x07,
            DisconnectReason::ClientQuitting => 0x08,
            DisconnectReason::UnexpectedIdentity => 0x09,
            DisconnectReason::ConnectedToSelf => 0x0a,
            DisconnectReason::Timeout => 0x0b,
            DisconnectReason::SubprotocolError => 0x10,
            DisconnectReason::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => DisconnectReason::Requested,
            0x01 => DisconnectReason::TcpError,
            0x02 => DisconnectReason::BreachOfProtocol,
            0x03 => DisconnectReason::UselessPeer,
            0x04 => DisconnectReason::TooManyPeers,
            0x05 => DisconnectReason::AlreadyConnected,
            0x06 => DisconnectReason::IncompatibleVersion,
            0x07 => DisconnectReason::InvalidIdentity,
            0x08 => DisconnectReason::ClientQuitting,
            0x09 => DisconnectReason::UnexpectedIdentity,
            0x0a => DisconnectReason::ConnectedToSelf,
            0x0b => DisconnectReason::Timeout,
            0x10 => DisconnectReason::SubprotocolError,
            other => DisconnectReason::Unknown(other),
        }
    }

    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        // Some clients send the bare reason instead of a one-element list.
        let code = match item {
            Rlp::String(_) => item.as_u8()?,
            Rlp::List(items) => match items.first() {
                Some(reason) => reason.as_u8()?,
                None => 0,
            },
        };
        Ok(Self::from_code(code))
    }
}

/// DevP2P base protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2pMessage {
    Hello(Hello),
    Disconnect(DisconnectReason),
    Ping,
    Pong,
}

impl P2pMessage {
    pub fn code(&self) -> u64 {
        match self {
            P2pMessage::Hello(_) => HELLO,
            P2pMessage::Disconnect(_) => DISCONNECT,
            P2pMessage::Ping => PING,
            P2pMessage::Pong => PONG,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            P2pMessage::Hello(hello) => hello.rlp_bytes(),
            P2pMessage::Disconnect(reason) => {
                Rlp::list(vec![reason.code().to_rlp()]).encoded()
            }
            P2pMessage::Ping | P2pMessage::Pong => Rlp::list(vec![]).encoded(),
        }
    }

    pub fn decode(code: u64, payload: &[u8]) -> Result<Self, ProtocolError> {
        match code {
            HELLO => Ok(P2pMessage::Hello(Hello::decode(&decode_payload(payload)?)?)),
            DISCONNECT => Ok(P2pMessage::Disconnect(DisconnectReason::decode(
                &decode_payload(payload)?,
            )?)),
            PING => Ok(P2pMessage::Ping),
            PONG => Ok(P2pMessage::Pong),
            other => Err(ProtocolError::UnknownMessage(other)),
        }
    }
}

// ============================================================================
// LES v2
// ============================================================================

pub const LES_STATUS: u64 = 0x00;
pub const LES_ANNOUNCE: u64 = 0x01;
pub const LES_GET_BLOCK_HEADERS: u64 = 0x02;
pub const LES_BLOCK_HEADERS: u64 = 0x03;
pub const LES_GET_PROOFS: u64 = 0x0f;
pub const LES_PROOFS: u64 = 0x10;
pub const LES_SEND_TX: u64 = 0x13;
pub const LES_TX_STATUS: u64 = 0x15;

/// Announce type we request: simple (unsigned) head announcements.
const ANNOUNCE_SIMPLE: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxCost {
    pub code: u64,
    pub base_cost: u64,
    pub request_cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControl {
    pub buffer_limit: u64,
    pub min_recharge: u64,
    pub max_costs: Vec<MaxCost>,
}

/// Key/value list carried by Status. A key may appear without a value.
struct StatusPairs<'a> {
    entries: Vec<(String, Option<&'a Rlp>)>,
}

impl<'a> StatusPairs<'a> {
    fn decode(item: &'a Rlp) -> Result<Self, ProtocolError> {
        let mut entries = Vec::new();
        for pair in item.as_list()? {
            let kv = pair.fields(1)?;
            entries.push((kv[0].as_text()?, kv.get(1)));
        }
        Ok(Self { entries })
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(name, _)| name == key)
    }

    fn value(&self, key: &str) -> Option<&'a Rlp> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .and_then(|(_, value)| *value)
    }

    fn required(&self, key: &str) -> Result<&'a Rlp, ProtocolError> {
        self.value(key)
            .ok_or_else(|| ProtocolError::InvalidField(format!("status field {key} missing")))
    }

    fn optional_u64(&self, key: &str) -> Result<Option<u64>, ProtocolError> {
        match self.value(key) {
            Some(value) => Ok(Some(value.as_u64()?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub protocol_version: u64,
    pub network_id: u64,
    pub head_td: U256,
    pub head_hash: H256,
    pub head_number: u64,
    pub genesis_hash: H256,
    pub announce_type: Option<u64>,
    pub serve_headers: bool,
    pub serve_chain_since: Option<u64>,
    pub serve_state_since: Option<u64>,
    pub flow_control: Option<FlowControl>,
}

impl Status {
    /// Status as sent by a light client: no serving, simple announcements.
    pub fn light(
        protocol_version: u64,
        network_id: u64,
        genesis_hash: H256,
        head: &BlockHeader,
    ) -> Self {
        Self {
            protocol_version,
            network_id,
            head_td: head.total_difficulty,
            head_hash: head.hash,
            head_number: head.number,
            genesis_hash,
            announce_type: Some(ANNOUNCE_SIMPLE),
            serve_headers: false,
            serve_chain_since: None,
            serve_state_since: None,
            flow_control: None,
        }
    }

    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let pairs = StatusPairs::decode(item)?;
        let flow_control = match (
            pairs.value("flowControl/BL"),
            pairs.value("flowControl/MRR"),
            pairs.value("flowControl/MRC"),
        ) {
            (Some(bl), Some(mrr), Some(mrc)) => Some(FlowControl {
                buffer_limit: bl.as_u64()?,
                min_recharge: mrr.as_u64()?,
                max_costs: mrc
                    .as_list()?
                    .iter()
                    .map(|entry| {
                        let f = entry.fields(3)?;
                        Ok(MaxCost {
                            code: f[0].as_u64()?,
                            base_cost: f[1].as_u64()?,
                            request_cost: f[2].as_u64()?,
                        })
                    })
                    .collect::<rlp::Result<Vec<_>>>()?,
            }),
            _ => None,
        };

        Ok(Self {
            protocol_version: pairs.required("protocolVersion")?.as_u64()?,
            network_id: pairs.required("networkId")?.as_u64()?,
            head_td: pairs.required("headTd")?.as_u256()?,
            head_hash: pairs.required("headHash")?.as_h256()?,
            head_number: pairs.required("headNum")?.as_u64()?,
            genesis_hash: pairs.required("genesisHash")?.as_h256()?,
            announce_type: pairs.optional_u64("announceType")?,
            // presence alone switches serving on
            serve_headers: pairs.contains("serveHeaders"),
            serve_chain_since: pairs.optional_u64("serveChainSince")?,
            serve_state_since: pairs.optional_u64("serveStateSince")?,
            flow_control,
        })
    }
}

fn pair(key: &str, value: Rlp) -> Rlp {
    Rlp::list(vec![key.to_rlp(), value])
}

impl Encodable for Status {
    fn to_rlp(&self) -> Rlp {
        let mut pairs = vec![
            pair("protocolVersion", self.protocol_version.to_rlp()),
            pair("networkId", self.network_id.to_rlp()),
            pair("headTd", self.head_td.to_rlp()),
            pair("headHash", self.head_hash.to_rlp()),
            pair("headNum", self.head_number.to_rlp()),
            pair("genesisHash", self.genesis_hash.to_rlp()),
        ];
        if let Some(announce_type) = self.announce_type {
            pairs.push(pair("announceType", announce_type.to_rlp()));
        }
        if self.serve_headers {
            pairs.push(Rlp::list(vec!["serveHeaders".to_rlp()]));
        }
        if let Some(since) = self.serve_chain_since {
            pairs.push(pair("serveChainSince", since.to_rlp()));
        }
        if let Some(since) = self.serve_state_since {
            pairs.push(pair("serveStateSince", since.to_rlp()));
        }
        if let Some(fc) = &self.flow_control {
            pairs.push(pair("flowControl/BL", fc.buffer_limit.to_rlp()));
            pairs.push(pair("flowControl/MRR", fc.min_recharge.to_rlp()));
            let costs = fc
                .max_costs
                .iter()
                .map(|c| {
                    Rlp::list(vec![
                        c.code.to_rlp(),
                        c.base_cost.to_rlp(),
                        c.request_cost.to_rlp(),
                    ])
                })
                .collect();
            pairs.push(pair("flowControl/MRC", Rlp::list(costs)));
        }
        Rlp::list(pairs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub head_hash: H256,
    pub head_number: u64,
    pub head_td: U256,
    pub reorg_depth: u64,
}

impl Announce {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(4)?;
        Ok(Self {
            head_hash: f[0].as_h256()?,
            head_number: f[1].as_u64()?,
            head_td: f[2].as_u256()?,
            reorg_depth: f[3].as_u64()?,
        })
    }
}

impl Encodable for Announce {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.head_hash.to_rlp(),
            self.head_number.to_rlp(),
            self.head_td.to_rlp(),
            self.reorg_depth.to_rlp(),
            Rlp::list(vec![]),
        ])
    }
}

/// Where a header window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Number(u64),
    Hash(H256),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeaders {
    pub request_id: u64,
    pub origin: BlockOrigin,
    pub max_headers: u64,
    pub skip: u64,
    pub reverse: bool,
}

impl GetBlockHeaders {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(2)?;
        let query = f[1].fields(4)?;
        let origin_bytes = query[0].as_bytes()?;
        let origin = if origin_bytes.len() == 32 {
            BlockOrigin::Hash(H256::from_slice(origin_bytes))
        } else {
            BlockOrigin::Number(query[0].as_u64()?)
        };
        Ok(Self {
            request_id: f[0].as_u64()?,
            origin,
            max_headers: query[1].as_u64()?,
            skip: query[2].as_u64()?,
            reverse: query[3].as_u64()? != 0,
        })
    }
}

impl Encodable for GetBlockHeaders {
    fn to_rlp(&self) -> Rlp {
        let origin = match self.origin {
            BlockOrigin::Number(number) => number.to_rlp(),
            BlockOrigin::Hash(hash) => hash.to_rlp(),
        };
        Rlp::list(vec![
            self.request_id.to_rlp(),
            Rlp::list(vec![
                origin,
                self.max_headers.to_rlp(),
                self.skip.to_rlp(),
                self.reverse.to_rlp(),
            ]),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeaders {
    pub request_id: u64,
    pub buffer_value: u64,
    pub headers: Vec<BlockHeader>,
}

impl BlockHeaders {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(3)?;
        let headers = f[2]
            .as_list()?
            .iter()
            .map(BlockHeader::decode)
            .collect::<rlp::Result<Vec<_>>>()?;
        Ok(Self {
            request_id: f[0].as_u64()?,
            buffer_value: f[1].as_u64()?,
            headers,
        })
    }
}

impl Encodable for BlockHeaders {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.request_id.to_rlp(),
            self.buffer_value.to_rlp(),
            Rlp::list(self.headers.iter().map(Encodable::to_rlp).collect()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRequest {
    pub block_hash: H256,
    /// keccak of the storage key, or empty for an account proof.
    pub key2: Vec<u8>,
    /// keccak of the account address.
    pub key: H256,
    pub from_level: u64,
}

impl ProofRequest {
    /// Account proof request for `address` at `block_hash`.
    pub fn account(block_hash: H256, address: &[u8; 20]) -> Self {
        Self {
            block_hash,
            key2: Vec::new(),
            key: crate::keccak256(address),
            from_level: 0,
        }
    }
}

impl Encodable for ProofRequest {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.block_hash.to_rlp(),
            self.key2.to_rlp(),
            self.key.to_rlp(),
            self.from_level.to_rlp(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetProofs {
    pub request_id: u64,
    pub requests: Vec<ProofRequest>,
}

impl GetProofs {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(2)?;
        let requests = f[1]
            .as_list()?
            .iter()
            .map(|req| {
                let r = req.fields(4)?;
                Ok(ProofRequest {
                    block_hash: r[0].as_h256()?,
                    key2: r[1].as_bytes()?.to_vec(),
                    key: r[2].as_h256()?,
                    from_level: r[3].as_u64()?,
                })
            })
            .collect::<rlp::Result<Vec<_>>>()?;
        Ok(Self {
            request_id: f[0].as_u64()?,
            requests,
        })
    }
}

impl Encodable for GetProofs {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.request_id.to_rlp(),
            Rlp::list(self.requests.iter().map(Encodable::to_rlp).collect()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proofs {
    pub request_id: u64,
    pub buffer_value: u64,
    /// Trie nodes from the state root down to the account leaf.
    pub nodes: Vec<Rlp>,
}

impl Proofs {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(3)?;
        Ok(Self {
            request_id: f[0].as_u64()?,
            buffer_value: f[1].as_u64()?,
            nodes: f[2].as_list()?.to_vec(),
        })
    }
}

impl Encodable for Proofs {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.request_id.to_rlp(),
            self.buffer_value.to_rlp(),
            Rlp::list(self.nodes.clone()),
        ])
    }
}

/// Unsigned transaction fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    /// Empty for contract creation.
    pub to: Vec<u8>,
    pub value: U256,
    pub data: Vec<u8>,
}

/// Signature produced by the external signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSignature {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: RawTransaction,
    pub signature: TransactionSignature,
}

impl SignedTransaction {
    pub fn hash(&self) -> H256 {
        crate::keccak256(&self.rlp_bytes())
    }

    pub fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(9)?;
        Ok(Self {
            raw: RawTransaction {
                nonce: f[0].as_u64()?,
                gas_price: f[1].as_u256()?,
                gas_limit: f[2].as_u64()?,
                to: f[3].as_bytes()?.to_vec(),
                value: f[4].as_u256()?,
                data: f[5].as_bytes()?.to_vec(),
            },
            signature: TransactionSignature {
                v: f[6].as_u64()?,
                r: f[7].as_u256()?,
                s: f[8].as_u256()?,
            },
        })
    }
}

impl Encodable for SignedTransaction {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.raw.nonce.to_rlp(),
            self.raw.gas_price.to_rlp(),
            self.raw.gas_limit.to_rlp(),
            self.raw.to.to_rlp(),
            self.raw.value.to_rlp(),
            self.raw.data.to_rlp(),
            self.signature.v.to_rlp(),
            self.signature.r.to_rlp(),
            self.signature.s.to_rlp(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTx {
    pub request_id: u64,
    pub transactions: Vec<SignedTransaction>,
}

impl SendTx {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(2)?;
        let transactions = f[1]
            .as_list()?
            .iter()
            .map(SignedTransaction::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            request_id: f[0].as_u64()?,
            transactions,
        })
    }
}

impl Encodable for SendTx {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.request_id.to_rlp(),
            Rlp::list(self.transactions.iter().map(Encodable::to_rlp).collect()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatusKind {
    Unknown,
    Queued,
    Pending,
    Included {
        block_hash: H256,
        block_number: u64,
        tx_index: u64,
    },
    Error(String),
}

impl TxStatusKind {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(1)?;
        match f[0].as_u64()? {
            1 => Ok(TxStatusKind::Queued),
            2 => Ok(TxStatusKind::Pending),
            3 => {
                let data = item.field(1)?.fields(3)?;
                Ok(TxStatusKind::Included {
                    block_hash: data[0].as_h256()?,
                    block_number: data[1].as_u64()?,
                    tx_index: data[2].as_u64()?,
                })
            }
            4 => Ok(TxStatusKind::Error(item.field(1)?.as_text()?)),
            _ => Ok(TxStatusKind::Unknown),
        }
    }
}

impl Encodable for TxStatusKind {
    fn to_rlp(&self) -> Rlp {
        match self {
            TxStatusKind::Unknown => Rlp::list(vec![0u64.to_rlp()]),
            TxStatusKind::Queued => Rlp::list(vec![1u64.to_rlp()]),
            TxStatusKind::Pending => Rlp::list(vec![2u64.to_rlp()]),
            TxStatusKind::Included {
                block_hash,
                block_number,
                tx_index,
            } => Rlp::list(vec![
                3u64.to_rlp(),
                Rlp::list(vec![
                    block_hash.to_rlp(),
                    block_number.to_rlp(),
                    tx_index.to_rlp(),
                ]),
            ]),
            TxStatusKind::Error(message) => Rlp::list(vec![4u64.to_rlp(), message.to_rlp()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatus {
    pub request_id: u64,
    pub buffer_value: u64,
    pub statuses: Vec<TxStatusKind>,
}

impl TxStatus {
    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(3)?;
        let statuses = f[2]
            .as_list()?
            .iter()
            .map(TxStatusKind::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            request_id: f[0].as_u64()?,
            buffer_value: f[1].as_u64()?,
            statuses,
        })
    }
}

impl Encodable for TxStatus {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.request_id.to_rlp(),
            self.buffer_value.to_rlp(),
            Rlp::list(self.statuses.iter().map(Encodable::to_rlp).collect()),
        ])
    }
}

/// LES v2 messages. Codes are relative to the capability offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LesMessage {
    Status(Status),
    Announce(Announce),
    GetBlockHeaders(GetBlockHeaders),
    BlockHeaders(BlockHeaders),
    GetProofs(GetProofs),
    Proofs(Proofs),
    SendTx(SendTx),
    TxStatus(TxStatus),
}

impl LesMessage {
    pub fn code(&self) -> u64 {
        match self {
            LesMessage::Status(_) => LES_STATUS,
            LesMessage::Announce(_) => LES_ANNOUNCE,
            LesMessage::GetBlockHeaders(_) => LES_GET_BLOCK_HEADERS,
            LesMessage::BlockHeaders(_) => LES_BLOCK_HEADERS,
            LesMessage::GetProofs(_) => LES_GET_PROOFS,
            LesMessage::Proofs(_) => LES_PROOFS,
            LesMessage::SendTx(_) => LES_SEND_TX,
            LesMessage::TxStatus(_) => LES_TX_STATUS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LesMessage::Status(_) => "status",
            LesMessage::Announce(_) => "announce",
            LesMessage::GetBlockHeaders(_) => "get_block_headers",
            LesMessage::BlockHeaders(_) => "block_headers",
            LesMessage::GetProofs(_) => "get_proofs",
            LesMessage::Proofs(_) => "proofs",
            LesMessage::SendTx(_) => "send_tx",
            LesMessage::TxStatus(_) => "tx_status",
        }
    }

    /// Correlation id for request/response messages.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            LesMessage::Status(_) | LesMessage::Announce(_) => None,
            LesMessage::GetBlockHeaders(m) => Some(m.request_id),
            LesMessage::BlockHeaders(m) => Some(m.request_id),
            LesMessage::GetProofs(m) => Some(m.request_id),
            LesMessage::Proofs(m) => Some(m.request_id),
            LesMessage::SendTx(m) => Some(m.request_id),
            LesMessage::TxStatus(m) => Some(m.request_id),
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            LesMessage::Status(m) => m.rlp_bytes(),
            LesMessage::Announce(m) => m.rlp_bytes(),
            LesMessage::GetBlockHeaders(m) => m.rlp_bytes(),
            LesMessage::BlockHeaders(m) => m.rlp_bytes(),
            LesMessage::GetProofs(m) => m.rlp_bytes(),
            LesMessage::Proofs(m) => m.rlp_bytes(),
            LesMessage::SendTx(m) => m.rlp_bytes(),
            LesMessage::TxStatus(m) => m.rlp_bytes(),
        }
    }

    pub fn decode(code: u64, payload: &[u8]) -> Result<Self, ProtocolError> {
        let item = decode_payload(payload)?;
        match code {
            LES_STATUS => Ok(LesMessage::Status(Status::decode(&item)?)),
            LES_ANNOUNCE => Ok(LesMessage::Announce(Announce::decode(&item)?)),
            LES_GET_BLOCK_HEADERS => Ok(LesMessage::GetBlockHeaders(GetBlockHeaders::decode(
                &item,
            )?)),
            LES_BLOCK_HEADERS => Ok(LesMessage::BlockHeaders(BlockHeaders::decode(&item)?)),
            LES_GET_PROOFS => Ok(LesMessage::GetProofs(GetProofs::decode(&item)?)),
            LES_PROOFS => Ok(LesMessage::Proofs(Proofs::decode(&item)?)),
            LES_SEND_TX => Ok(LesMessage::SendTx(SendTx::decode(&item)?)),
            LES_TX_STATUS => Ok(LesMessage::TxStatus(TxStatus::decode(&item)?)),
            other => Err(ProtocolError::UnknownMessage(other)),
        }
    }
}
