use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// The ledger's native unit is subdivided into one million drops. RPC-side
/// structures (transaction `Fee` fields) carry drops; the Data API carries
/// decimal XRP. Everything past the client boundary is decimal XRP.
pub(crate) const DROPS_PER_XRP: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

pub(crate) const NATIVE_CURRENCY: &str = "XRP";

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Account addresses start with `r`")]
    Prefix,

    #[error("Account address has invalid length {0}")]
    Length(usize),
}

#[derive(Debug, Error)]
pub enum AssetIdError {
    #[error("Empty currency code")]
    EmptyCurrency,

    #[error("Issued currency {0} requires an issuer, e.g. `{0}/r...`")]
    MissingIssuer(String),

    #[error("Invalid issuer address")]
    Issuer(#[from] AddressError),
}

#[derive(Debug, Error)]
pub enum DropsError {
    #[error("Unable to parse drops amount")]
    Parse(#[from] rust_decimal::Error),
}

/// An XRP Ledger account address in its base58 form.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with('r') {
            return Err(AddressError::Prefix);
        }
        if !(25..=35).contains(&s.len()) {
            return Err(AddressError::Length(s.len()));
        }

        Ok(Self(s.to_string()))
    }
}

/// Identifies an asset on the ledger. The native asset has no issuer; every
/// issued currency is qualified by the issuing account.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AssetId {
    pub currency: String,
    pub issuer: Option<Address>,
}

impl AssetId {
    pub fn native() -> Self {
        Self {
            currency: NATIVE_CURRENCY.to_string(),
            issuer: None,
        }
    }

    pub fn is_native(&self) -> bool {
        self.issuer.is_none()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issuer {
            Some(issuer) => write!(f, "{}/{issuer}", self.currency),
            None => f.write_str(&self.currency),
        }
    }
}

impl FromStr for AssetId {
    type Err = AssetIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (currency, issuer) = match s.split_once('/') {
            Some((currency, issuer)) => (currency, Some(issuer)),
            None => (s, None),
        };
        if currency.is_empty() {
            return Err(AssetIdError::EmptyCurrency);
        }

        match issuer {
            None if currency == NATIVE_CURRENCY => Ok(Self::native()),
            None => Err(AssetIdError::MissingIssuer(currency.to_string())),
            Some(issuer) => Ok(Self {
                currency: currency.to_string(),
                issuer: Some(issuer.parse()?),
            }),
        }
    }
}

/// Convert a drops string (e.g. a transaction `Fee`) to decimal XRP.
pub fn xrp_from_drops(drops: &str) -> Result<Decimal, DropsError> {
    let drops = Decimal::from_str(drops)?;

    Ok(drops / DROPS_PER_XRP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_asset() {
        let asset: AssetId = "XRP".parse().unwrap();
        assert!(asset.is_native());
        assert_eq!(asset.to_string(), "XRP");
    }

    #[test]
    fn test_issued_asset_round_trip() {
        let asset: AssetId = "USD/rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B".parse().unwrap();
        assert_eq!(asset.currency, "USD");
        assert_eq!(asset.to_string(), "USD/rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B");
    }

    #[test]
    fn test_issued_asset_requires_issuer() {
        let err = "USD".parse::<AssetId>().unwrap_err();
        assert!(matches!(err, AssetIdError::MissingIssuer(_)));
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("xDCh8v8g2g7eGEkXWLMz2gRPe2TLbwoocB".parse::<Address>().is_err());
        assert!("r".parse::<Address>().is_err());
        assert!("rDCh8v8g2g7eGEkXWLMz2gRPe2TLbwoocB".parse::<Address>().is_ok());
    }

    #[test]
    fn test_drops_conversion() {
        assert_eq!(xrp_from_drops("12").unwrap(), "0.000012".parse().unwrap());
        assert_eq!(xrp_from_drops("1000000").unwrap(), Decimal::ONE);
    }
}
