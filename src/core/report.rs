use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::types::{PercentileBand, SimulationResult};

const YEAR_KEY_PREFIX: &str = "year_";

/// The rounded, serializable form of a [`SimulationResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub summary: SummaryReport,
    pub wealth_percentiles: YearlyBands,
    pub metadata: MetadataReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub median: f64,
    pub percentile_10: f64,
    pub percentile_90: f64,
    pub var_5: f64,
    pub cvar_5: f64,
    pub volatility: f64,
    pub goal_probability: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandReport {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataReport {
    pub num_simulations: u32,
    pub years: u32,
}

/// Per-year bands serialized as `{"year_0": {...}, "year_1": {...}, ...}` in year order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct YearlyBands(pub Vec<BandReport>);

impl SimulationReport {
    pub fn from_result(result: &SimulationResult) -> Self {
        let s = &result.summary;
        Self {
            summary: SummaryReport {
                median: round_to(s.median, 2),
                percentile_10: round_to(s.percentile_10, 2),
                percentile_90: round_to(s.percentile_90, 2),
                var_5: round_to(s.var_5, 2),
                cvar_5: round_to(s.cvar_5, 2),
                volatility: round_to(s.volatility, 4),
                goal_probability: round_to(s.goal_probability, 4),
                max_drawdown: round_to(s.max_drawdown, 4),
            },
            wealth_percentiles: YearlyBands(
                result
                    .wealth_percentiles
                    .iter()
                    .map(BandReport::from_band)
                    .collect(),
            ),
            metadata: MetadataReport {
                num_simulations: result.metadata.num_simulations,
                years: result.metadata.years,
            },
        }
    }
}

impl BandReport {
    fn from_band(band: &PercentileBand) -> Self {
        Self {
            p10: round_to(band.p10, 2),
            p50: round_to(band.p50, 2),
            p90: round_to(band.p90, 2),
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10_f64.powi(decimals);
    let rounded = (value * scale).round() / scale;
    // Values too large to scale are already coarser than the requested precision.
    if rounded.is_finite() { rounded } else { value }
}

impl Serialize for YearlyBands {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (year, band) in self.0.iter().enumerate() {
            map.serialize_entry(&format!("{YEAR_KEY_PREFIX}{year}"), band)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for YearlyBands {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(YearlyBandsVisitor)
    }
}

struct YearlyBandsVisitor;

impl<'de> Visitor<'de> for YearlyBandsVisitor {
    type Value = YearlyBands;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of year_N keys to percentile bands")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut slots: Vec<Option<BandReport>> = Vec::new();
        while let Some((key, band)) = access.next_entry::<String, BandReport>()? {
            let year = key
                .strip_prefix(YEAR_KEY_PREFIX)
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| de::Error::custom(format!("unexpected key `{key}`")))?;
            if year >= slots.len() {
                slots.resize(year + 1, None);
            }
            if slots[year].replace(band).is_some() {
                return Err(de::Error::custom(format!("duplicate key `{key}`")));
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(year, band)| {
                band.ok_or_else(|| de::Error::custom(format!("missing {YEAR_KEY_PREFIX}{year}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(YearlyBands)
    }
}
