use crate::model::amount::{Address, AssetId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, rc::Rc};

/// The Data API classifies every balance change with one of these types.
/// Anything else in a payload is a schema change upstream and fails
/// deserialization at the client boundary.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    PaymentSource,
    PaymentDestination,
    Exchange,
    Intermediary,
    TransactionCost,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PaymentSource => "payment_source",
            Self::PaymentDestination => "payment_destination",
            Self::Exchange => "exchange",
            Self::Intermediary => "intermediary",
            Self::TransactionCost => "transaction_cost",
        })
    }
}

/// Hex transaction hash, kept opaque.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxHash {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One asset balance change affecting one account, caused by one ledger
/// transaction. Mirrors the Data API balance change descriptor.
///
/// `tx_index` is the intra-ledger tie-breaker. Not every endpoint reports
/// it; when absent it deserializes to 0 and ordering falls back to the
/// stable arrival order of that account's own stream.
#[derive(Clone, Debug, Deserialize)]
pub struct BalanceChange {
    pub tx_hash: TxHash,
    pub ledger_index: u32,
    #[serde(default)]
    pub tx_index: u32,
    pub executed_time: DateTime<Utc>,
    pub currency: String,
    #[serde(default)]
    pub counterparty: Option<Address>,
    pub amount_change: Decimal,
    pub final_balance: Decimal,
    #[serde(rename = "change_type")]
    pub kind: ChangeKind,
}

impl BalanceChange {
    pub fn asset(&self) -> AssetId {
        AssetId {
            currency: self.currency.clone(),
            issuer: self.counterparty.clone(),
        }
    }
}

/// A balance change tagged with the observed account it belongs to.
/// The nickname is whatever the account was called on the command line.
#[derive(Clone, Debug)]
pub struct AccountEvent {
    pub nick: Rc<str>,
    pub account: Address,
    pub change: BalanceChange,
}

/// All events generated by a single ledger transaction, in merge order.
/// This is the atomic unit handed to the cost basis ledger.
#[derive(Clone, Debug)]
pub struct TxGroup {
    pub events: Vec<AccountEvent>,
}

impl TxGroup {
    pub fn hash(&self) -> &TxHash {
        &self.events[0].change.tx_hash
    }

    pub fn ledger_index(&self) -> u32 {
        self.events[0].change.ledger_index
    }

    pub fn executed_time(&self) -> DateTime<Utc> {
        self.events[0].change.executed_time
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AccountEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Captured from a live balance_changes response.
    const PAYMENT_DESTINATION: &str = r#"{
        "amount_change": "200",
        "final_balance": "200",
        "node_index": 0,
        "tx_index": 1,
        "change_type": "payment_destination",
        "currency": "XRP",
        "executed_time": "2018-04-03T17:52:20Z",
        "ledger_index": 37698948,
        "tx_hash": "410EFBD059677888DBF87C73253B9F97A4CD47C64A535249FA782D0CD6F603B6"
    }"#;

    const EXCHANGE_ISSUED: &str = r#"{
        "amount_change": "15.218875",
        "final_balance": "15.218875",
        "node_index": 13,
        "tx_index": 17,
        "change_type": "exchange",
        "counterparty": "rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B",
        "currency": "USD",
        "executed_time": "2018-04-03T18:37:40Z",
        "ledger_index": 37699705,
        "tx_hash": "6F347A4ABABFD2CA139131D1303C36D9415381ED629E479AADE3A91900B88C80"
    }"#;

    #[test]
    fn test_parse_native_change() {
        let change: BalanceChange = serde_json::from_str(PAYMENT_DESTINATION).unwrap();

        assert_eq!(change.kind, ChangeKind::PaymentDestination);
        assert_eq!(change.ledger_index, 37698948);
        assert_eq!(change.tx_index, 1);
        assert_eq!(change.amount_change, "200".parse().unwrap());
        assert!(change.asset().is_native());
    }

    #[test]
    fn test_parse_issued_change() {
        let change: BalanceChange = serde_json::from_str(EXCHANGE_ISSUED).unwrap();

        assert_eq!(change.kind, ChangeKind::Exchange);
        let asset = change.asset();
        assert_eq!(asset.currency, "USD");
        assert_eq!(asset.to_string(), "USD/rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B");
    }

    #[test]
    fn test_missing_tx_index_defaults_to_zero() {
        // Payment and exchange endpoints do not report tx_index.
        let json = r#"{
            "amount_change": "-1.5",
            "final_balance": "10",
            "change_type": "payment_source",
            "currency": "XRP",
            "executed_time": "2018-04-03T18:23:02Z",
            "ledger_index": 37699466,
            "tx_hash": "473BD6802D3488210522F59F79FFCBD1BA94EC1567C23F66519AF5A1225066E3"
        }"#;
        let change: BalanceChange = serde_json::from_str(json).unwrap();

        assert_eq!(change.tx_index, 0);
    }

    #[test]
    fn test_unknown_change_type_is_rejected() {
        let json = PAYMENT_DESTINATION.replace("payment_destination", "escrow_create");
        assert!(serde_json::from_str::<BalanceChange>(&json).is_err());
    }
}
