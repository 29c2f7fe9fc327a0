//! Ripple Data API v2 client.
//!
//! The API sits behind a rate limiter that is intermittently unavailable,
//! so every GET retries transient failures with a linear backoff before
//! giving up. Streams of balance changes are produced by a background
//! thread per account, following the pagination marker until the history
//! is exhausted.
use super::{AccountData, DataApi, DataApiError, Normalized, TransactionDetail};
use crate::model::amount::{Address, AssetId};
use crate::model::events::{BalanceChange, TxHash};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;
use tracing::{debug, info, warn};
use ureq::tls::{TlsConfig, TlsProvider};
use ureq::Agent;

const MAX_ATTEMPTS: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Bounded buffer between a page-fetching producer and the merge
/// iterator. One page deep, so producers stay one request ahead at most.
const STREAM_BUFFER: usize = 200;

/// Rates are cached per asset, base, and calendar day. The rate is cached
/// rather than the converted amount so one query covers every amount on
/// the same day.
type RateKey = (String, String, NaiveDate);

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account_data: AccountData,
}

#[derive(Debug, Deserialize)]
struct BalanceChangesResponse {
    #[serde(default)]
    marker: Option<String>,
    balance_changes: Vec<BalanceChange>,
}

#[derive(Debug, Deserialize)]
struct NormalizeResponse {
    rate: Decimal,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    transaction: TransactionDetail,
}

pub struct DataClient {
    agent: Agent,
    base: String,
    rate_cache: Mutex<HashMap<RateKey, Decimal>>,
}

impl DataClient {
    /// Create a client for the given API server, e.g.
    /// `https://data.ripple.com/v2/`.
    pub fn new(api_server: &str) -> Result<Self, DataApiError> {
        if !api_server.starts_with("http://") && !api_server.starts_with("https://") {
            return Err(DataApiError::InvalidUrl(api_server.to_string()));
        }

        let agent = Agent::from(
            Agent::config_builder()
                .tls_config(
                    TlsConfig::builder()
                        .provider(TlsProvider::NativeTls)
                        .build(),
                )
                .build(),
        );

        let mut base = api_server.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }

        Ok(Self {
            agent,
            base,
            rate_cache: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> String {
        format!("{base}{path}", base = self.base, path = segments.join("/"))
    }
}

impl DataApi for DataClient {
    fn account_data(&self, account: &Address) -> Result<AccountData, DataApiError> {
        let url = self.endpoint(&["accounts", account.as_str()]);
        let response: AccountResponse = fetch_with_retry(&self.agent, &url, &[])?;

        Ok(response.account_data)
    }

    fn balance_change_stream(
        &self,
        account: &Address,
    ) -> Receiver<Result<BalanceChange, DataApiError>> {
        let agent = self.agent.clone();
        let url = self.endpoint(&["accounts", account.as_str(), "balance_changes"]);
        let account = account.clone();
        let (tx, rx) = mpsc::sync_channel(STREAM_BUFFER);

        std::thread::spawn(move || {
            let mut marker: Option<String> = None;

            loop {
                let mut query = Vec::with_capacity(1);
                if let Some(marker) = &marker {
                    query.push(("marker", marker.clone()));
                }

                let page: BalanceChangesResponse =
                    match fetch_with_retry(&agent, &url, &query) {
                        Ok(page) => page,
                        Err(err) => {
                            // Retries are already exhausted. Surface the
                            // failure as a stream item so the consumer can
                            // tell it apart from exhaustion.
                            let _ = tx.send(Err(err));
                            return;
                        }
                    };

                for change in page.balance_changes {
                    if tx.send(Ok(change)).is_err() {
                        // Consumer cancelled the run; abandon the fetch.
                        debug!("Balance change stream for {account} abandoned");
                        return;
                    }
                }

                match page.marker {
                    Some(next) if !next.is_empty() => marker = Some(next),
                    _ => {
                        debug!("No more balance changes for {account}");
                        return;
                    }
                }
            }
        });

        rx
    }

    fn normalize(
        &self,
        amount: Decimal,
        asset: &AssetId,
        base: &AssetId,
        when: DateTime<Utc>,
    ) -> Result<Normalized, DataApiError> {
        // One unit of the base is always worth one unit of the base.
        if asset == base {
            return Ok(Normalized {
                rate: Decimal::ONE,
                converted: amount.abs(),
            });
        }

        let key = (asset.to_string(), base.to_string(), when.date_naive());
        if let Some(rate) = self.rate_cache.lock().get(&key) {
            debug!(
                "Using cached {base} rate for {asset} on {day}",
                day = key.2
            );
            return Ok(Normalized {
                rate: *rate,
                converted: amount.abs() * rate,
            });
        }

        let url = self.endpoint(&["normalize"]);
        let mut query = vec![
            ("amount", amount.abs().to_string()),
            ("currency", asset.currency.clone()),
            ("exchange_currency", base.currency.clone()),
            (
                "date",
                when.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ];
        if let Some(issuer) = &asset.issuer {
            query.push(("issuer", issuer.to_string()));
        }
        if let Some(issuer) = &base.issuer {
            query.push(("exchange_issuer", issuer.to_string()));
        }

        let response: NormalizeResponse = fetch_with_retry(&self.agent, &url, &query)?;
        let rate = response.rate;
        self.rate_cache.lock().insert(key, rate);

        Ok(Normalized {
            rate,
            converted: amount.abs() * rate,
        })
    }

    fn transaction(&self, hash: &TxHash) -> Result<TransactionDetail, DataApiError> {
        let url = self.endpoint(&["transactions", hash.as_str()]);
        let response: TransactionResponse = fetch_with_retry(&self.agent, &url, &[])?;

        Ok(response.transaction)
    }
}

/// GET an endpoint, retrying transient failures with a linear backoff.
fn fetch_with_retry<T>(
    agent: &Agent,
    url: &str,
    query: &[(&str, String)],
) -> Result<T, DataApiError>
where
    T: DeserializeOwned,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match fetch_once(agent, url, query) {
            Ok(value) => {
                if attempt > 1 {
                    info!("GET {url} succeeded after {attempt} attempts");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!("Failed attempt {attempt} to GET {url}: {err}");
                std::thread::sleep(RETRY_DELAY * attempt);
            }
            Err(err) if err.is_transient() => {
                return Err(DataApiError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

fn fetch_once<T>(agent: &Agent, url: &str, query: &[(&str, String)]) -> Result<T, DataApiError>
where
    T: DeserializeOwned,
{
    let mut request = agent.get(url);
    for (key, value) in query {
        request = request.query(*key, value);
    }

    let mut response = request.call().map_err(|err| DataApiError::Http {
        url: url.to_string(),
        source: Box::new(err),
    })?;
    let raw: serde_json::Value =
        response
            .body_mut()
            .read_json()
            .map_err(|err| DataApiError::Http {
                url: url.to_string(),
                source: Box::new(err),
            })?;

    triage(&raw)?;

    Ok(serde_json::from_value(raw)?)
}

/// The rate limiter in front of the API returns `{"error": ...}` with no
/// relation to the rest of the API. Regular endpoints report failures as
/// `{"result": "error", "message": ...}`.
fn triage(raw: &serde_json::Value) -> Result<(), DataApiError> {
    if let Some(error) = raw.get("error").and_then(serde_json::Value::as_str) {
        return Err(DataApiError::RateLimited(error.to_string()));
    }

    let result = raw
        .get("result")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    if result != "success" {
        return Err(DataApiError::Api {
            result: result.to_string(),
            message: raw
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    Ok(())
}
