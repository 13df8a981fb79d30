use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub const MULTIPLIER_MIN: u32 = 1_000;
pub const MULTIPLIER_MAX: u32 = 2_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    Countries,
    ExchangeRates,
}

impl SourceName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Countries => "countries",
            Self::ExchangeRates => "exchange_rates",
        }
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Countries => "Countries API",
            Self::ExchangeRates => "Exchange API",
        }
    }
}

impl Display for SourceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStage {
    Idle,
    Fetching,
    Reconciling,
    Upserting,
    Committed,
    Snapshotting,
    ArtifactGenerating,
    Done,
    Aborted,
}

impl RefreshStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Reconciling => "reconciling",
            Self::Upserting => "upserting",
            Self::Committed => "committed",
            Self::Snapshotting => "snapshotting",
            Self::ArtifactGenerating => "artifact_generating",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl Display for RefreshStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RefreshError {
    #[error("external data source unavailable: {source_name} ({detail})")]
    SourceUnavailable {
        source_name: SourceName,
        detail: String,
    },
    #[error("persistence failure during {stage}: {detail}")]
    Persistence { stage: RefreshStage, detail: String },
    #[error("refresh cancelled during {stage}")]
    Cancelled { stage: RefreshStage },
}

impl RefreshError {
    #[must_use]
    pub fn source_unavailable(source_name: SourceName, detail: impl Display) -> Self {
        Self::SourceUnavailable {
            source_name,
            detail: detail.to_string(),
        }
    }

    #[must_use]
    pub fn persistence(stage: RefreshStage, err: &anyhow::Error) -> Self {
        Self::Persistence {
            stage,
            detail: format!("{err:#}"),
        }
    }

    /// The upstream source responsible for the failure, if any.
    #[must_use]
    pub fn source_name(&self) -> Option<SourceName> {
        match self {
            Self::SourceUnavailable { source_name, .. } => Some(*source_name),
            Self::Persistence { .. } | Self::Cancelled { .. } => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("timestamp error: {0}")]
pub struct TimestampError(String);

/// One record of the reference dataset as delivered by the countries source.
///
/// `currencies` is kept as raw JSON so that a malformed entry degrades to an
/// absent currency code instead of failing the whole payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferenceEntity {
    pub name: String,
    pub capital: Option<String>,
    pub region: Option<String>,
    pub population: u64,
    #[serde(alias = "flagUrl")]
    pub flag: Option<String>,
    pub currencies: Option<Value>,
}

/// Currency code → units of that currency per one unit of the base currency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateTable {
    base_code: Option<String>,
    rates: BTreeMap<String, f64>,
}

impl RateTable {
    /// Builds a table, keeping only positive normal rates. Zero, subnormal,
    /// infinite and NaN entries are dropped.
    #[must_use]
    pub fn new(base_code: Option<String>, rates: impl IntoIterator<Item = (String, f64)>) -> Self {
        let rates = rates
            .into_iter()
            .filter(|(_, rate)| rate.is_normal() && *rate > 0.0)
            .collect();
        Self { base_code, rates }
    }

    #[must_use]
    pub fn base_code(&self) -> Option<&str> {
        self.base_code.as_deref()
    }

    #[must_use]
    pub fn rate(&self, code: &str) -> Option<f64> {
        self.rates.get(code).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// Transient output of reconciliation; the input of the upsert step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciledRecord {
    pub name: String,
    pub capital: Option<String>,
    pub region: Option<String>,
    pub population: u64,
    pub currency_code: Option<String>,
    pub exchange_rate: Option<f64>,
    pub estimated_gdp: Option<f64>,
    pub flag_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountryRecord {
    pub id: i64,
    pub name: String,
    pub capital: Option<String>,
    pub region: Option<String>,
    pub population: u64,
    pub currency_code: Option<String>,
    pub exchange_rate: Option<f64>,
    pub estimated_gdp: Option<f64>,
    pub flag_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_refreshed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GdpSort {
    GdpDesc,
    GdpAsc,
}

impl GdpSort {
    /// Unknown sort keys are ignored rather than rejected.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("gdp_desc") {
            Some(Self::GdpDesc)
        } else if value.eq_ignore_ascii_case("gdp_asc") {
            Some(Self::GdpAsc)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountryFilter {
    pub region: Option<String>,
    pub currency: Option<String>,
    pub sort: Option<GdpSort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub total_countries: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_refreshed_at: Option<OffsetDateTime>,
}

/// Source of the per-entity estimate multiplier.
pub trait MultiplierSource {
    /// Returns an integer in `[min, max]` inclusive.
    fn draw(&mut self, min: u32, max: u32) -> u32;
}

/// Adapts any [`rand::Rng`] into a [`MultiplierSource`].
#[derive(Debug, Clone)]
pub struct RngMultiplier<R>(pub R);

impl RngMultiplier<rand::rngs::ThreadRng> {
    #[must_use]
    pub fn thread() -> Self {
        Self(rand::thread_rng())
    }
}

impl<R: Rng> MultiplierSource for RngMultiplier<R> {
    fn draw(&mut self, min: u32, max: u32) -> u32 {
        self.0.gen_range(min..=max)
    }
}

/// Cooperative cancellation shared between a caller and a running refresh.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Transaction scope handed to the upsert step.
///
/// Dropping a transaction without calling [`CountryTransaction::commit`]
/// must discard its writes.
pub trait CountryTransaction {
    #[allow(clippy::missing_errors_doc)]
    fn find_by_name(&self, name: &str) -> anyhow::Result<Option<CountryRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert(
        &mut self,
        record: &ReconciledRecord,
        refreshed_at: OffsetDateTime,
    ) -> anyhow::Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn update(
        &mut self,
        id: i64,
        record: &ReconciledRecord,
        refreshed_at: OffsetDateTime,
    ) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn commit(self: Box<Self>) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

pub trait CountryStore {
    #[allow(clippy::missing_errors_doc)]
    fn begin(&mut self) -> anyhow::Result<Box<dyn CountryTransaction + '_>>;

    #[allow(clippy::missing_errors_doc)]
    fn snapshot_all(&self) -> anyhow::Result<Vec<CountryRecord>>;
}

/// Case-folded form of a country name used as the uniqueness key.
#[must_use]
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}

/// Currency code of the first listed currency.
///
/// An empty or missing list, a non-array value, or a first entry whose `code`
/// is missing or not a string all yield `None`; this is policy, not a fault.
#[must_use]
pub fn first_currency_code(currencies: Option<&Value>) -> Option<String> {
    currencies?
        .as_array()?
        .first()?
        .get("code")?
        .as_str()
        .map(str::to_string)
}

/// Computes derived fields for every reference entity.
#[must_use]
pub fn reconcile(
    entities: &[ReferenceEntity],
    rates: &RateTable,
    multipliers: &mut dyn MultiplierSource,
) -> Vec<ReconciledRecord> {
    entities
        .iter()
        .map(|entity| reconcile_entity(entity, rates, multipliers))
        .collect()
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn reconcile_entity(
    entity: &ReferenceEntity,
    rates: &RateTable,
    multipliers: &mut dyn MultiplierSource,
) -> ReconciledRecord {
    let currency_code = first_currency_code(entity.currencies.as_ref());

    let (exchange_rate, estimated_gdp) = match currency_code.as_deref() {
        None => (None, Some(0.0)),
        Some(code) => match rates.rate(code) {
            None => (None, None),
            Some(rate) => {
                let multiplier = multipliers.draw(MULTIPLIER_MIN, MULTIPLIER_MAX);
                let estimate = entity.population as f64 * f64::from(multiplier) / rate;
                // An estimate that overflows is treated like an unknown rate.
                if estimate.is_finite() {
                    (Some(rate), Some(estimate))
                } else {
                    (None, None)
                }
            }
        },
    };

    ReconciledRecord {
        name: entity.name.clone(),
        capital: entity.capital.clone(),
        region: entity.region.clone(),
        population: entity.population,
        currency_code,
        exchange_rate,
        estimated_gdp,
        flag_url: entity.flag.clone(),
    }
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`TimestampError`] when the value is not RFC3339 or not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TimestampError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TimestampError(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 in UTC.
///
/// # Errors
/// Returns [`TimestampError`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TimestampError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
