//! # Market Data
//!
//! The item a voting round validates. A provider publishes a `MarketData`
//! record, validators judge it, and the node stores it with its final
//! validation score once the round accepts it.

use crate::error::{Result, TallyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of market data carried by a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    /// End-of-day price bar
    Eod,
    /// Dividend announcement
    Dividend,
    /// Insider trade filing
    InsiderTrade,
    /// Stock split
    Split,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eod => "EOD",
            Self::Dividend => "DIVIDEND",
            Self::InsiderTrade => "INSIDER_TRADE",
            Self::Split => "SPLIT",
        };
        f.write_str(s)
    }
}

/// A single market data record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Ticker symbol
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// Name of the provider that produced the record
    pub source: String,
    pub data_type: DataType,
    /// Validator id → signature over the record hash
    #[serde(default)]
    pub signatures: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Weighted score from the last completed voting round
    #[serde(default)]
    pub validation_score: f64,
    /// Hex-encoded BLAKE3 hash over the identifying fields
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MarketData {
    /// Create a new record with a fresh id and computed hash
    pub fn new(
        symbol: impl Into<String>,
        price: f64,
        volume: f64,
        source: impl Into<String>,
        data_type: DataType,
    ) -> Self {
        let now = Utc::now();
        let mut data = Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            price,
            volume,
            timestamp: now,
            source: source.into(),
            data_type,
            signatures: BTreeMap::new(),
            metadata: BTreeMap::new(),
            validation_score: 0.0,
            hash: String::new(),
            created_at: now,
            updated_at: now,
        };
        data.update_hash();
        data
    }

    /// Builder-style metadata insertion
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the record is well formed
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TallyError::Validation("market data id is empty".into()));
        }
        if self.symbol.is_empty() {
            return Err(TallyError::Validation("symbol is empty".into()));
        }
        if !(self.price > 0.0) {
            return Err(TallyError::Validation(format!(
                "price must be positive, got {}",
                self.price
            )));
        }
        if !(self.volume >= 0.0) {
            return Err(TallyError::Validation(format!(
                "volume must be non-negative, got {}",
                self.volume
            )));
        }
        if self.source.is_empty() {
            return Err(TallyError::Validation("source is empty".into()));
        }
        Ok(())
    }

    /// Hash over symbol, price, volume, timestamp and source
    pub fn compute_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.symbol.as_bytes());
        hasher.update(&self.price.to_le_bytes());
        hasher.update(&self.volume.to_le_bytes());
        hasher.update(&self.timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(self.source.as_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Recompute and store the content hash
    pub fn update_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    /// Whether the stored hash matches the content
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Attach a validator signature
    pub fn add_signature(&mut self, validator_id: impl Into<String>, signature: Vec<u8>) {
        self.signatures.insert(validator_id.into(), signature);
        self.updated_at = Utc::now();
    }

    /// Record the score of a completed voting round
    pub fn set_validation_score(&mut self, score: f64) {
        self.validation_score = score;
        self.updated_at = Utc::now();
    }
}
