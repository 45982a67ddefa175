//! Read-side access to a mixer deployment over Ethereum JSON-RPC.
//!
//! One client is bound to one contract address. Writes never go through here:
//! the relay owns signing and broadcast (see `relay.rs`).

use crate::contract::Mixer;
use crate::error::{MixerError, MixerResult};
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use std::collections::BTreeMap;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `LeafAdded(uint256 _leaf, uint256 _leafIndex)`
    LeafAdded,
    /// `DepositWithdrawn(uint256 _nullifier)`
    DepositWithdrawn,
}

impl EventKind {
    pub fn topic(self) -> B256 {
        match self {
            EventKind::LeafAdded => Mixer::LeafAdded::SIGNATURE_HASH,
            EventKind::DepositWithdrawn => Mixer::DepositWithdrawn::SIGNATURE_HASH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub kind: EventKind,
    pub block_number: u64,
    pub tx_hash: Option<String>,
    pub fields: BTreeMap<&'static str, U256>,
}

impl ChainEvent {
    pub fn field(&self, name: &str) -> Option<&U256> {
        self.fields.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub succeeded: bool,
    pub block_number: u64,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> MixerResult<u64>;

    async fn get_root(&self) -> MixerResult<U256>;

    async fn get_merkle_path(&self, leaf_index: &U256) -> MixerResult<Vec<U256>>;

    async fn make_nullifier_hash(&self, secret: &U256) -> MixerResult<U256>;

    async fn make_leaf_hash(&self, secret: &U256, destination: &Address) -> MixerResult<U256>;

    /// Logs of `kind` emitted by the bound contract in `[from_block, to_block]` (inclusive).
    async fn get_logs(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> MixerResult<Vec<ChainEvent>>;

    /// `None` while the transaction is not mined yet.
    async fn get_transaction_receipt(&self, tx_hash: &str) -> MixerResult<Option<TxReceipt>>;
}

/// Decode one log entry. `Ok(None)` for logs that should be ignored
/// (pending, removed by a reorg, or a different event).
pub(crate) fn decode_log(kind: EventKind, log: &Log) -> MixerResult<Option<ChainEvent>> {
    if log.removed {
        return Ok(None);
    }
    let Some(block_number) = log.block_number else {
        return Ok(None);
    };
    if log.topics().first() != Some(&kind.topic()) {
        return Ok(None);
    }
    let undecodable =
        |e: alloy::sol_types::Error| MixerError::UnexpectedData(format!("{kind:?} log: {e}"));
    let fields = match kind {
        EventKind::LeafAdded => {
            let ev = Mixer::LeafAdded::decode_log(&log.inner).map_err(undecodable)?;
            BTreeMap::from([("_leaf", ev.data._leaf), ("_leafIndex", ev.data._leafIndex)])
        }
        EventKind::DepositWithdrawn => {
            let ev = Mixer::DepositWithdrawn::decode_log(&log.inner).map_err(undecodable)?;
            BTreeMap::from([("_nullifier", ev.data._nullifier)])
        }
    };
    Ok(Some(ChainEvent {
        kind,
        block_number,
        tx_hash: log.transaction_hash.map(|h| h.to_string()),
        fields,
    }))
}

pub struct JsonRpcChainClient {
    provider: RootProvider,
    contract: Address,
}

impl JsonRpcChainClient {
    pub fn new(rpc_url: Url, contract: Address) -> Self {
        Self {
            provider: RootProvider::new_http(rpc_url),
            contract,
        }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    async fn view<C: SolCall>(&self, call: C) -> MixerResult<C::Return> {
        let tx = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(call.abi_encode());
        let out = self
            .provider
            .call(tx)
            .await
            .map_err(|e| MixerError::ChainQuery(format!("{}: {e}", C::SIGNATURE)))?;
        C::abi_decode_returns(&out)
            .map_err(|e| MixerError::UnexpectedData(format!("{}: {e}", C::SIGNATURE)))
    }
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn block_number(&self) -> MixerResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| MixerError::ChainQuery(format!("eth_blockNumber: {e}")))
    }

    async fn get_root(&self) -> MixerResult<U256> {
        self.view(Mixer::getRootCall {}).await
    }

    async fn get_merkle_path(&self, leaf_index: &U256) -> MixerResult<Vec<U256>> {
        let path = self
            .view(Mixer::getMerklePathCall {
                leafIndex: *leaf_index,
            })
            .await?;
        Ok(path.to_vec())
    }

    async fn make_nullifier_hash(&self, secret: &U256) -> MixerResult<U256> {
        self.view(Mixer::makeNullifierHashCall { secret: *secret })
            .await
    }

    async fn make_leaf_hash(&self, secret: &U256, destination: &Address) -> MixerResult<U256> {
        self.view(Mixer::makeLeafHashCall {
            secret: *secret,
            withdrawTo: *destination,
        })
        .await
    }

    async fn get_logs(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> MixerResult<Vec<ChainEvent>> {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(kind.topic())
            .from_block(from_block)
            .to_block(to_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| MixerError::ChainQuery(format!("eth_getLogs: {e}")))?;
        let mut out = Vec::with_capacity(logs.len());
        for log in &logs {
            if let Some(ev) = decode_log(kind, log)? {
                out.push(ev);
            }
        }
        Ok(out)
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> MixerResult<Option<TxReceipt>> {
        // A malformed hash can never resolve, so it is not worth retrying.
        let hash: B256 = tx_hash
            .trim()
            .parse()
            .map_err(|e| MixerError::InvalidState(format!("bad transaction hash {tx_hash}: {e}")))?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| MixerError::ChainQuery(format!("eth_getTransactionReceipt: {e}")))?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };
        Ok(Some(TxReceipt {
            succeeded: receipt.status(),
            block_number,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};

    fn rpc_log(data: LogData, block: Option<u64>) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0xcc),
                data,
            },
            block_number: block,
            transaction_hash: Some(B256::repeat_byte(0xab)),
            ..Default::default()
        }
    }

    fn leaf_added(leaf: u64, index: u64) -> LogData {
        Mixer::LeafAdded {
            _leaf: U256::from(leaf),
            _leafIndex: U256::from(index),
        }
        .encode_log_data()
    }

    #[test]
    fn decodes_leaf_added_fields_by_name() {
        let ev = decode_log(EventKind::LeafAdded, &rpc_log(leaf_added(42, 7), Some(100)))
            .unwrap()
            .unwrap();
        assert_eq!(ev.block_number, 100);
        assert_eq!(ev.field("_leaf"), Some(&U256::from(42u64)));
        assert_eq!(ev.field("_leafIndex"), Some(&U256::from(7u64)));
        assert_eq!(ev.tx_hash, Some(B256::repeat_byte(0xab).to_string()));
    }

    #[test]
    fn skips_pending_removed_and_foreign_logs() {
        let pending = rpc_log(leaf_added(1, 2), None);
        assert!(decode_log(EventKind::LeafAdded, &pending).unwrap().is_none());

        let mut removed = rpc_log(leaf_added(1, 2), Some(1));
        removed.removed = true;
        assert!(decode_log(EventKind::LeafAdded, &removed).unwrap().is_none());

        let withdrawn = Mixer::DepositWithdrawn {
            _nullifier: U256::from(9u64),
        }
        .encode_log_data();
        let other = rpc_log(withdrawn, Some(1));
        assert!(decode_log(EventKind::LeafAdded, &other).unwrap().is_none());
        let ev = decode_log(EventKind::DepositWithdrawn, &other).unwrap().unwrap();
        assert_eq!(ev.field("_nullifier"), Some(&U256::from(9u64)));
    }

    #[test]
    fn truncated_log_data_is_unexpected() {
        let short = LogData::new_unchecked(
            vec![EventKind::LeafAdded.topic()],
            Bytes::from(vec![0u8; 32]),
        );
        let err = decode_log(EventKind::LeafAdded, &rpc_log(short, Some(1))).unwrap_err();
        assert!(err.is_transient());
    }
}
