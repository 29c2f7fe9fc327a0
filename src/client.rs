use crate::model::amount::{Address, AssetId};
use crate::model::events::{BalanceChange, TxHash};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::mpsc::Receiver;
use thiserror::Error;

pub mod data;

/// Account metadata from the Data API, shown as an audit line before a
/// reporting run starts.
#[derive(Clone, Debug, Deserialize)]
pub struct AccountData {
    pub account: Address,
    pub parent: Address,
    pub initial_balance: Decimal,
    pub ledger_index: u32,
    pub inception: DateTime<Utc>,
    pub tx_hash: TxHash,
}

/// A price normalization result. The rate is per unit of the queried
/// asset; `converted` is the absolute amount valued at that rate.
#[derive(Clone, Copy, Debug)]
pub struct Normalized {
    pub rate: Decimal,
    pub converted: Decimal,
}

/// Transaction detail not present in balance change events, used to
/// enrich rendered output with sender and receiver information.
#[derive(Clone, Debug, Deserialize)]
pub struct TransactionDetail {
    pub hash: TxHash,
    pub ledger_index: u32,
    pub date: DateTime<Utc>,
    pub tx: TxSummary,
    pub meta: TxMeta,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxSummary {
    #[serde(rename = "TransactionType")]
    pub kind: String,

    #[serde(rename = "Account")]
    pub account: Address,

    #[serde(rename = "Destination")]
    pub destination: Option<Address>,

    /// Transaction fee in drops, as the ledger encodes it.
    #[serde(rename = "Fee")]
    pub fee_drops: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxMeta {
    #[serde(rename = "TransactionResult")]
    pub result: String,
}

#[derive(Debug, Error)]
pub enum DataApiError {
    #[error("Invalid Data API URL `{0}`")]
    InvalidUrl(String),

    #[error("GET {url} failed")]
    Http {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },

    /// The rate limiter in front of the API answers with a JSON dialect
    /// unrelated to the rest of the API.
    #[error("Data API rate limiter: {0}")]
    RateLimited(String),

    #[error("Data API returned result {result:?}: {message}")]
    Api { result: String, message: String },

    #[error("Unexpected Data API payload")]
    Decode(#[from] serde_json::Error),

    #[error("GET {url} failed after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<DataApiError>,
    },
}

impl DataApiError {
    /// Transport failures and rate limiting are worth retrying. A
    /// non-success API result or an undecodable payload is not.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Self::Http { .. } | Self::RateLimited(_))
    }
}

/// The public interface for the Data API.
///
/// Exists as a trait so that unit tests can mock the upstream responses.
pub trait DataApi: Sync {
    /// Get creation metadata for an account.
    fn account_data(&self, account: &Address) -> Result<AccountData, DataApiError>;

    /// Open this account's balance change history in ascending ledger
    /// order. Transient failures are retried internally; the stream
    /// yields a final `Err` item only when retries are exhausted, which
    /// is distinct from the stream simply ending.
    fn balance_change_stream(
        &self,
        account: &Address,
    ) -> Receiver<Result<BalanceChange, DataApiError>>;

    /// Value `amount` of `asset` in `base` at a point in time.
    fn normalize(
        &self,
        amount: Decimal,
        asset: &AssetId,
        base: &AssetId,
        when: DateTime<Utc>,
    ) -> Result<Normalized, DataApiError>;

    /// Get full detail for one transaction by hash.
    fn transaction(&self, hash: &TxHash) -> Result<TransactionDetail, DataApiError>;
}
