use crate::error::{AnalyticsError, Result};
use crate::observer::DegenerateInput;
use crate::stats;
use chrono::{Duration, NaiveDate};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single dated closing price.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub price: f64,
}

/// Historical prices for one asset, ordered by date ascending.
///
/// Deserialization goes through [`AssetSeries::new`], so JSON input may list
/// prices in any order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "SeriesRecord")]
pub struct AssetSeries {
    pub symbol: String,
    #[serde(default)]
    pub sector: Option<String>,
    pub prices: Vec<PricePoint>,
}

/// The benchmark index. Same shape as an asset; exactly one per analysis.
pub type MarketSeries = AssetSeries;

#[derive(Deserialize)]
struct SeriesRecord {
    symbol: String,
    #[serde(default)]
    sector: Option<String>,
    prices: Vec<PricePoint>,
}

impl From<SeriesRecord> for AssetSeries {
    fn from(record: SeriesRecord) -> Self {
        AssetSeries::new(record.symbol, record.sector, record.prices)
    }
}

impl AssetSeries {
    /// Builds a series, sorting the points by date.
    pub fn new(symbol: impl Into<String>, sector: Option<String>, mut prices: Vec<PricePoint>) -> Self {
        prices.sort_by_key(|p| p.date);
        Self {
            symbol: symbol.into(),
            sector,
            prices,
        }
    }

    /// Consecutive calendar days starting at `start`.
    pub fn from_closes(
        symbol: impl Into<String>,
        sector: Option<String>,
        start: NaiveDate,
        closes: &[f64],
    ) -> Self {
        let prices = closes
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint {
                date: start + Duration::days(i as i64),
                price,
            })
            .collect();
        Self::new(symbol, sector, prices)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.prices.iter().map(|p| p.price).collect()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.prices.last().map(|p| p.price)
    }

    pub fn dates(&self) -> BTreeSet<NaiveDate> {
        self.prices.iter().map(|p| p.date).collect()
    }

    /// Drops non-positive and non-finite prices and puts the rest in date
    /// order. A repeated date keeps its last listed price.
    pub fn cleaned(&self) -> (AssetSeries, Vec<DegenerateInput>) {
        let mut findings = Vec::new();
        let mut valid: Vec<PricePoint> = self
            .prices
            .iter()
            .enumerate()
            .filter_map(|(index, p)| {
                if p.price.is_finite() && p.price > 0.0 {
                    Some(*p)
                } else {
                    findings.push(DegenerateInput::DroppedPrice {
                        symbol: self.symbol.clone(),
                        index,
                        price: p.price,
                    });
                    None
                }
            })
            .collect();
        valid.sort_by_key(|p| p.date);

        let mut prices: Vec<PricePoint> = Vec::with_capacity(valid.len());
        for p in valid {
            match prices.last_mut() {
                Some(last) if last.date == p.date => {
                    findings.push(DegenerateInput::DuplicateDate {
                        symbol: self.symbol.clone(),
                        date: p.date,
                    });
                    *last = p;
                }
                _ => prices.push(p),
            }
        }
        (
            AssetSeries {
                symbol: self.symbol.clone(),
                sector: self.sector.clone(),
                prices,
            },
            findings,
        )
    }

    /// Keeps only the points whose date is in `dates`.
    pub fn restricted_to(&self, dates: &BTreeSet<NaiveDate>) -> AssetSeries {
        AssetSeries {
            symbol: self.symbol.clone(),
            sector: self.sector.clone(),
            prices: self
                .prices
                .iter()
                .filter(|p| dates.contains(&p.date))
                .copied()
                .collect(),
        }
    }

    /// Simple period returns of the closing prices.
    pub fn returns(&self) -> Result<Vec<f64>> {
        stats::returns(&self.closes()).map_err(|e| match e {
            AnalyticsError::InsufficientData { required, available, .. } => {
                AnalyticsError::insufficient_data(format!("{} returns", self.symbol), required, available)
            }
            other => other,
        })
    }

    /// Geometric Brownian motion with the given annual drift and volatility.
    pub fn mock(
        symbol: &str,
        sector: Option<&str>,
        start: NaiveDate,
        days: usize,
        annual_drift: f64,
        annual_vol: f64,
        rng: &mut impl Rng,
    ) -> Self {
        let dt = 1.0 / 252.0;
        let mut price: f64 = 100.0;
        let mut closes = Vec::with_capacity(days);
        for _ in 0..days {
            closes.push(price);
            let z: f64 = StandardNormal.sample(rng);
            price *= ((annual_drift - 0.5 * annual_vol.powi(2)) * dt + annual_vol * dt.sqrt() * z).exp();
        }
        Self::from_closes(symbol, sector.map(str::to_string), start, &closes)
    }

    /// A series that loads on `market` with the given beta plus independent
    /// noise of `idio_daily_vol` per day. Shares the market's dates.
    pub fn mock_from_market(
        symbol: &str,
        sector: Option<&str>,
        market: &MarketSeries,
        beta: f64,
        idio_daily_vol: f64,
        rng: &mut impl Rng,
    ) -> Self {
        let idio_daily_vol = idio_daily_vol.max(0.0);
        let mut price: f64 = 50.0 + rng.gen_range(0.0..100.0);
        let mut points = Vec::with_capacity(market.prices.len());
        for (i, p) in market.prices.iter().enumerate() {
            if i > 0 {
                let prev = market.prices[i - 1].price;
                let market_ret = (p.price - prev) / prev;
                let z: f64 = StandardNormal.sample(rng);
                let r = beta * market_ret + idio_daily_vol * z;
                price *= (1.0 + r).max(0.01);
            }
            points.push(PricePoint { date: p.date, price });
        }
        Self::new(symbol, sector.map(str::to_string), points)
    }
}

/// Dates present in every series.
pub fn common_dates<'a>(series: impl IntoIterator<Item = &'a AssetSeries>) -> BTreeSet<NaiveDate> {
    let mut iter = series.into_iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first.dates(), |acc, s| {
        let dates = s.dates();
        acc.intersection(&dates).copied().collect()
    })
}

/// One asset held at a fractional weight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    #[serde(flatten)]
    pub asset: AssetSeries,
    pub weight: f64,
}

/// Ordered set of holdings. Weights are fractions (0–1), long-only, and
/// should sum to 1.0; the sum is recorded rather than enforced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioComposition {
    #[serde(default)]
    pub name: String,
    pub holdings: Vec<Holding>,
}

impl PortfolioComposition {
    pub fn new(name: impl Into<String>, holdings: Vec<Holding>) -> Self {
        Self {
            name: name.into(),
            holdings,
        }
    }

    pub fn len(&self) -> usize {
        self.holdings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holdings.is_empty()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.holdings.iter().map(|h| h.weight).collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.holdings.iter().map(|h| h.asset.symbol.clone()).collect()
    }

    pub fn weight_sum(&self) -> f64 {
        self.holdings.iter().map(|h| h.weight).sum()
    }

    /// Rejects weights outside [0, 1]; short positions are not supported.
    pub fn validate_long_only(&self) -> Result<()> {
        for h in &self.holdings {
            if !h.weight.is_finite() || !(0.0..=1.0).contains(&h.weight) {
                return Err(AnalyticsError::configuration(format!(
                    "{}: weight {} outside [0, 1] (short selling is not supported)",
                    h.asset.symbol, h.weight
                )));
            }
        }
        Ok(())
    }

    /// Summed weight per sector. Holdings without a sector are left out.
    pub fn sector_weights(&self) -> BTreeMap<String, f64> {
        let mut sectors = BTreeMap::new();
        for h in &self.holdings {
            if let Some(sector) = &h.asset.sector {
                *sectors.entry(sector.clone()).or_insert(0.0) += h.weight;
            }
        }
        sectors
    }
}

/// Everything one analysis call needs from the data layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub portfolio: PortfolioComposition,
    pub market: MarketSeries,
}

impl AnalysisInput {
    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// A reproducible sample portfolio over `days` trading days.
    pub fn mock(days: usize, rng: &mut impl Rng) -> Self {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap_or_default();
        let market = AssetSeries::mock("SPX", None, start, days, 0.08, 0.18, rng);
        let specs = [
            ("AAPL", "Technology", 1.2, 0.012, 0.25),
            ("MSFT", "Technology", 1.1, 0.010, 0.20),
            ("JPM", "Financials", 1.0, 0.011, 0.15),
            ("XOM", "Energy", 0.7, 0.015, 0.15),
            ("JNJ", "Health Care", 0.5, 0.008, 0.25),
        ];
        let holdings = specs
            .iter()
            .map(|&(symbol, sector, beta, idio, weight)| Holding {
                asset: AssetSeries::mock_from_market(symbol, Some(sector), &market, beta, idio, rng),
                weight,
            })
            .collect();
        Self {
            portfolio: PortfolioComposition::new("Sample portfolio", holdings),
            market,
        }
    }
}
