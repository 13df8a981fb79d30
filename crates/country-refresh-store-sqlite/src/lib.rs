#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use country_refresh_core::{
    format_rfc3339, name_key, now_utc, parse_rfc3339_utc, CountryFilter, CountryRecord,
    CountryStore, CountryTransaction, GdpSort, ReconciledRecord, StoreStatus,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::debug;

const COUNTRY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_COUNTRIES_V1: &str = r"
CREATE TABLE IF NOT EXISTS countries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  name_key TEXT NOT NULL UNIQUE,
  capital TEXT,
  region TEXT,
  population INTEGER NOT NULL CHECK (population >= 0),
  currency_code TEXT,
  exchange_rate REAL CHECK (
    exchange_rate IS NULL OR (exchange_rate > 0.0 AND exchange_rate < 9e999)
  ),
  estimated_gdp REAL CHECK (
    estimated_gdp IS NULL OR (estimated_gdp >= 0.0 AND estimated_gdp < 9e999)
  ),
  flag_url TEXT,
  last_refreshed_at TEXT NOT NULL,
  CHECK (
    currency_code IS NOT NULL
    OR (exchange_rate IS NULL AND estimated_gdp IS NOT NULL AND estimated_gdp = 0.0)
  )
);

CREATE INDEX IF NOT EXISTS idx_countries_region ON countries(region COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_countries_currency ON countries(currency_code COLLATE NOCASE);
";

const COUNTRY_COLUMNS: &str = "id, name, capital, region, population, currency_code, \
     exchange_rate, estimated_gdp, flag_url, last_refreshed_at";

pub struct SqliteCountryStore {
    conn: Connection,
}

impl SqliteCountryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_COUNTRIES_V1)
            .context("failed to apply countries schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![COUNTRY_MIGRATION_VERSION, now],
            )
            .context("failed to register countries schema migration")?;

        Ok(())
    }

    /// Lists stored countries; filters match case-insensitively.
    ///
    /// Without a sort key rows come back in insertion order. GDP sorts place
    /// rows with no estimate last.
    pub fn list_countries(&self, filter: &CountryFilter) -> Result<Vec<CountryRecord>> {
        let order_by = match filter.sort {
            None => "id ASC",
            Some(GdpSort::GdpDesc) => "estimated_gdp IS NULL, estimated_gdp DESC, id ASC",
            Some(GdpSort::GdpAsc) => "estimated_gdp IS NULL, estimated_gdp ASC, id ASC",
        };
        let sql = format!(
            "SELECT {COUNTRY_COLUMNS}
             FROM countries
             WHERE (?1 IS NULL OR region = ?1 COLLATE NOCASE)
               AND (?2 IS NULL OR currency_code = ?2 COLLATE NOCASE)
             ORDER BY {order_by}"
        );

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare country listing query")?;
        let rows = stmt
            .query_map(
                params![filter.region.as_deref(), filter.currency.as_deref()],
                parse_country_row,
            )
            .context("failed to query countries")?;
        collect_rows(rows)
    }

    pub fn get_country(&self, name: &str) -> Result<Option<CountryRecord>> {
        find_country(&self.conn, name)
    }

    /// Removes a country by case-insensitive name; returns whether a row existed.
    pub fn delete_country(&self, name: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM countries WHERE name_key = ?1",
                params![name_key(name)],
            )
            .with_context(|| format!("failed to delete country {name}"))?;
        Ok(removed > 0)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM countries", [], |row| row.get(0))
            .context("failed to count countries")?;
        let total_countries =
            usize::try_from(total).context("country count does not fit in usize")?;

        // RFC3339 text does not order lexicographically once fractional
        // seconds vary, so compare parsed instants.
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT last_refreshed_at FROM countries")
            .context("failed to prepare refresh timestamp query")?;
        let rows = stmt
            .query_map([], |row| {
                let raw: String = row.get(0)?;
                parse_timestamp(&raw)
            })
            .context("failed to query refresh timestamps")?;
        let last_refreshed_at = collect_rows(rows)?.into_iter().max();

        Ok(StoreStatus {
            total_countries,
            last_refreshed_at,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl CountryStore for SqliteCountryStore {
    fn begin(&mut self) -> Result<Box<dyn CountryTransaction + '_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin country transaction")?;
        debug!("opened country transaction");
        Ok(Box::new(SqliteCountryTransaction { tx }))
    }

    fn snapshot_all(&self) -> Result<Vec<CountryRecord>> {
        self.list_countries(&CountryFilter::default())
    }
}

/// Write scope over one `IMMEDIATE` sqlite transaction; dropping it without
/// commit rolls back.
struct SqliteCountryTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl CountryTransaction for SqliteCountryTransaction<'_> {
    fn find_by_name(&self, name: &str) -> Result<Option<CountryRecord>> {
        find_country(&self.tx, name)
    }

    fn insert(&mut self, record: &ReconciledRecord, refreshed_at: OffsetDateTime) -> Result<i64> {
        let population = population_to_sql(record)?;
        let refreshed_at = format_rfc3339(refreshed_at).map_err(|err| anyhow!(err.to_string()))?;

        self.tx
            .execute(
                "INSERT INTO countries(
                    name, name_key, capital, region, population, currency_code,
                    exchange_rate, estimated_gdp, flag_url, last_refreshed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.name,
                    name_key(&record.name),
                    record.capital,
                    record.region,
                    population,
                    record.currency_code,
                    record.exchange_rate,
                    record.estimated_gdp,
                    record.flag_url,
                    refreshed_at,
                ],
            )
            .with_context(|| format!("failed to insert country {}", record.name))?;

        Ok(self.tx.last_insert_rowid())
    }

    fn update(
        &mut self,
        id: i64,
        record: &ReconciledRecord,
        refreshed_at: OffsetDateTime,
    ) -> Result<()> {
        let population = population_to_sql(record)?;
        let refreshed_at = format_rfc3339(refreshed_at).map_err(|err| anyhow!(err.to_string()))?;

        let changed = self
            .tx
            .execute(
                "UPDATE countries
                 SET capital = ?2,
                     region = ?3,
                     population = ?4,
                     currency_code = ?5,
                     exchange_rate = ?6,
                     estimated_gdp = ?7,
                     flag_url = ?8,
                     last_refreshed_at = ?9
                 WHERE id = ?1",
                params![
                    id,
                    record.capital,
                    record.region,
                    population,
                    record.currency_code,
                    record.exchange_rate,
                    record.estimated_gdp,
                    record.flag_url,
                    refreshed_at,
                ],
            )
            .with_context(|| format!("failed to update country {}", record.name))?;

        if changed != 1 {
            return Err(anyhow!(
                "update of country {} touched {changed} rows (id {id})",
                record.name
            ));
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .context("failed to commit country transaction")
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .context("failed to roll back country transaction")
    }
}

fn find_country(conn: &Connection, name: &str) -> Result<Option<CountryRecord>> {
    conn.query_row(
        &format!("SELECT {COUNTRY_COLUMNS} FROM countries WHERE name_key = ?1"),
        params![name_key(name)],
        parse_country_row,
    )
    .optional()
    .with_context(|| format!("failed to look up country {name}"))
}

fn population_to_sql(record: &ReconciledRecord) -> Result<i64> {
    i64::try_from(record.population).with_context(|| {
        format!(
            "population {} of {} exceeds sqlite integer range",
            record.population, record.name
        )
    })
}

fn parse_country_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CountryRecord> {
    let population_i64: i64 = row.get(4)?;
    let population = u64::try_from(population_i64).map_err(|_| {
        conversion_error(
            4,
            rusqlite::types::Type::Integer,
            format!("negative population: {population_i64}"),
        )
    })?;
    let refreshed_raw: String = row.get(9)?;

    Ok(CountryRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        capital: row.get(2)?,
        region: row.get(3)?,
        population,
        currency_code: row.get(5)?,
        exchange_rate: row.get(6)?,
        estimated_gdp: row.get(7)?,
        flag_url: row.get(8)?,
        last_refreshed_at: parse_timestamp(&refreshed_raw)?,
    })
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| conversion_error(0, rusqlite::types::Type::Text, err.to_string()))
}

fn conversion_error(column: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
