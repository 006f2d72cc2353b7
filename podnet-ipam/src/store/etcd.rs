//! etcd coordination store.

use super::{CoordinationStore, KeyValue};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, Txn, TxnOp, TxnOpResponse,
    TxnResponse,
};
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Versions are etcd `mod_revision`s; a missing key compares as 0.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(CONNECT_TIMEOUT)
            .with_timeout(REQUEST_TIMEOUT);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| StoreError::Unavailable(format!("etcd {:?}: {}", endpoints, e)))?;
        debug!(?endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    /// Run a transaction guarded by `compare`; on failure, read the key back
    /// so the error can report what was found.
    async fn guarded(&self, key: &str, compare: Compare, then: TxnOp) -> StoreResult<TxnResponse> {
        let txn = Txn::new()
            .when([compare])
            .and_then([then])
            .or_else([TxnOp::get(key, None)]);
        Ok(self.client.clone().txn(txn).await?)
    }
}

fn revision(resp: &TxnResponse) -> u64 {
    resp.header().map(|h| h.revision()).unwrap_or(0) as u64
}

/// mod_revision of the key read by the failure branch, 0 if absent.
fn observed_version(resp: &TxnResponse) -> u64 {
    resp.op_responses()
        .into_iter()
        .find_map(|op| match op {
            TxnOpResponse::Get(get) => get.kvs().first().map(|kv| kv.mod_revision() as u64),
            _ => None,
        })
        .unwrap_or(0)
}

fn to_key_value(kv: &etcd_client::KeyValue) -> StoreResult<KeyValue> {
    let key = kv.key_str().map_err(|e| StoreError::Corrupt {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        reason: e.to_string(),
    })?;
    Ok(KeyValue {
        key: key.to_string(),
        value: kv.value().to_vec(),
        version: kv.mod_revision() as u64,
    })
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let resp = self.client.clone().get(key, None).await?;
        resp.kvs().first().map(to_key_value).transpose()
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(etcd_client::SortTarget::Key, etcd_client::SortOrder::Ascend);
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        resp.kvs().iter().map(to_key_value).collect()
    }

    async fn create(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        let resp = self
            .guarded(
                key,
                Compare::version(key, CompareOp::Equal, 0),
                TxnOp::put(key, value, None),
            )
            .await?;
        if !resp.succeeded() {
            return Err(StoreError::Conflict(key.to_string()));
        }
        Ok(revision(&resp))
    }

    async fn compare_and_swap(&self, key: &str, version: u64, value: &[u8]) -> StoreResult<u64> {
        let resp = self
            .guarded(
                key,
                Compare::mod_revision(key, CompareOp::Equal, version as i64),
                TxnOp::put(key, value, None),
            )
            .await?;
        if !resp.succeeded() {
            return Err(StoreError::VersionMismatch {
                key: key.to_string(),
                expected: version,
                actual: observed_version(&resp),
            });
        }
        Ok(revision(&resp))
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<()> {
        let resp = self
            .guarded(
                key,
                Compare::mod_revision(key, CompareOp::Equal, version as i64),
                TxnOp::delete(key, None),
            )
            .await?;
        if !resp.succeeded() {
            return Err(StoreError::VersionMismatch {
                key: key.to_string(),
                expected: version,
                actual: observed_version(&resp),
            });
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        let resp = self.client.clone().put(key, value, None).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0) as u64)
    }
}
