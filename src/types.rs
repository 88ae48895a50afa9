//! Core data types shared by the evaluator, fan-out and optimizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// OHLCV bar representing a single time period of market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Create a new bar.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Bar carrying a single price, as produced by close-only series.
    pub fn from_close(timestamp: DateTime<Utc>, close: f64) -> Self {
        Self::new(timestamp, close, close, close, close, 0.0)
    }

    /// Validate that bar data is consistent.
    pub fn validate(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
    }
}

/// Price histories for a basket of assets, keyed by ticker.
///
/// Tickers are kept in sorted order; the position of a ticker in that order is
/// the index of its weight in an [`AllocationVector`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceHistorySet {
    histories: BTreeMap<String, Vec<Bar>>,
}

impl PriceHistorySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the history for a ticker. Bars are sorted and
    /// deduplicated by timestamp.
    pub fn insert(&mut self, symbol: impl Into<String>, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        self.histories.insert(symbol.into(), bars);
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with(mut self, symbol: impl Into<String>, bars: Vec<Bar>) -> Self {
        self.insert(symbol, bars);
        self
    }

    pub fn get(&self, symbol: &str) -> Option<&Vec<Bar>> {
        self.histories.get(symbol)
    }

    /// Tickers in allocation order.
    pub fn symbols(&self) -> Vec<&str> {
        self.histories.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Bar>)> {
        self.histories.iter()
    }

    /// Number of assets.
    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    /// Overlapping window of all histories: latest first timestamp and
    /// earliest last timestamp. `None` if any history is empty or the set
    /// has no assets.
    pub fn overlap(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let mut start: Option<DateTime<Utc>> = None;
        let mut end: Option<DateTime<Utc>> = None;

        for bars in self.histories.values() {
            let first = bars.first()?.timestamp;
            let last = bars.last()?.timestamp;
            start = Some(start.map_or(first, |s| s.max(first)));
            end = Some(end.map_or(last, |e| e.min(last)));
        }

        match (start, end) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => None,
        }
    }

    /// Copy of this set restricted to bars within `[start, end]`.
    pub fn truncated(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let histories = self
            .histories
            .iter()
            .map(|(symbol, bars)| {
                let kept: Vec<Bar> = bars
                    .iter()
                    .filter(|b| b.timestamp >= start && b.timestamp <= end)
                    .cloned()
                    .collect();
                (symbol.clone(), kept)
            })
            .collect();
        Self { histories }
    }

    /// Comma-joined tickers, used as the `Stocks` result column.
    pub fn label(&self) -> String {
        self.symbols().join(",")
    }
}

/// Normalized allocation weights, one per asset, summing to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationVector(Vec<f64>);

impl AllocationVector {
    /// Normalize integer weight units into proportions.
    ///
    /// Returns `None` when `units` is empty or sums to zero.
    pub fn from_units(units: &[u64]) -> Option<Self> {
        let total: u64 = units.iter().sum();
        if units.is_empty() || total == 0 {
            return None;
        }
        let total = total as f64;
        Some(Self(units.iter().map(|&u| u as f64 / total).collect()))
    }

    /// Equal weighting over `n` assets.
    pub fn equal(n: usize) -> Option<Self> {
        Self::from_units(&vec![1; n])
    }

    /// Normalize arbitrary non-negative weights.
    pub fn from_weights(weights: Vec<f64>) -> Option<Self> {
        if weights.is_empty() || weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return None;
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return None;
        }
        Some(Self(weights.into_iter().map(|w| w / total).collect()))
    }

    pub fn weights(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }
}

impl fmt::Display for AllocationVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, w) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", w)?;
        }
        write!(f, "]")
    }
}

/// Backtest strategy applied to an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Rebalance back to the target proportions every `rebal_interval` bars.
    Rebalance,
    /// Buy the target proportions once and hold.
    BuyAndHold,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Rebalance => write!(f, "rebalance"),
            StrategyKind::BuyAndHold => write!(f, "buy-and-hold"),
        }
    }
}

/// A sweep parameter given either as a single value or a list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Normalize to a sequence; a scalar becomes a one-element vector.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(vs) => vs,
        }
    }
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.clone().into_vec()
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(values: Vec<T>) -> Self {
        OneOrMany::Many(values)
    }
}
