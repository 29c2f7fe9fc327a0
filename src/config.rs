//! Optional per-transaction and per-asset annotations.
//!
//! The file is RON with two maps: `transactions` keyed by transaction
//! hash, `assets` keyed by asset identifier (`XRP` or `CUR/r...`). A
//! malformed file fails the run at startup, never mid-run.
//!
//! ```ron
//! (
//!     transactions: {
//!         "410EFBD0...": (note: Some("initial funding"), ignore: false),
//!     },
//!     assets: {
//!         "CNY/rKiCet8SdvWxPXnAgYarFUXMh1zCPz432Y": (ignore: true),
//!     },
//! )
//! ```
use crate::model::amount::AssetId;
use crate::model::events::TxHash;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnnotationsError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("RON parsing error")]
    Parse(#[from] ron::de::SpannedError),
}

/// Directives attached to one transaction or one asset.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Directive {
    /// Free text carried onto the rendered line.
    pub note: Option<String>,

    /// Skip this transaction or asset entirely.
    pub ignore: bool,

    /// Override the run-level strict flag for this transaction. Useful to
    /// let a known tiny remainder pass while keeping the rest strict.
    pub strict: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Annotations {
    transactions: HashMap<String, Directive>,
    assets: HashMap<String, Directive>,
}

impl Annotations {
    pub fn load<P>(path: P) -> Result<Self, AnnotationsError>
    where
        P: AsRef<Path>,
    {
        let data = std::fs::read_to_string(path.as_ref())?;

        Ok(ron::from_str(&data)?)
    }

    pub fn transaction(&self, hash: &TxHash) -> Option<&Directive> {
        self.transactions.get(hash.as_str())
    }

    pub fn asset(&self, asset: &AssetId) -> Option<&Directive> {
        self.assets.get(&asset.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_annotations() {
        let annotations: Annotations = ron::from_str(
            r#"(
                transactions: {
                    "410EFBD0": (note: Some("initial funding")),
                    "473BD680": (ignore: true, strict: Some(false)),
                },
                assets: {
                    "CNY/rKiCet8SdvWxPXnAgYarFUXMh1zCPz432Y": (ignore: true),
                },
            )"#,
        )
        .unwrap();

        let directive = annotations.transaction(&TxHash::from("410EFBD0")).unwrap();
        assert_eq!(directive.note.as_deref(), Some("initial funding"));
        assert!(!directive.ignore);

        let directive = annotations.transaction(&TxHash::from("473BD680")).unwrap();
        assert!(directive.ignore);
        assert_eq!(directive.strict, Some(false));

        let asset: AssetId = "CNY/rKiCet8SdvWxPXnAgYarFUXMh1zCPz432Y".parse().unwrap();
        assert!(annotations.asset(&asset).unwrap().ignore);
        assert!(annotations.asset(&AssetId::native()).is_none());
    }

    #[test]
    fn test_malformed_annotations_fail() {
        assert!(ron::from_str::<Annotations>("(transactions: wat)").is_err());
    }
}
