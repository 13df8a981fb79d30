#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use country_refresh_core::{
    CancellationToken, RateTable, ReferenceEntity, RefreshError, RefreshStage, SourceName,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

pub const DEFAULT_COUNTRIES_URL: &str =
    "https://restcountries.com/v2/all?fields=name,capital,region,population,flag,currencies";
pub const DEFAULT_RATES_URL: &str = "https://open.er-api.com/v6/latest/USD";
pub const DEFAULT_FETCH_BUDGET: Duration = Duration::from_secs(30);

/// Joint time budget for both upstream fetches, linked to caller cancellation.
#[derive(Debug, Clone)]
pub struct FetchBudget {
    deadline: Instant,
    cancel: CancellationToken,
}

impl FetchBudget {
    #[must_use]
    pub fn new(total: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + total,
            cancel,
        }
    }

    /// Time left for a request against `source`.
    ///
    /// # Errors
    /// Returns [`RefreshError::Cancelled`] when the caller cancelled, and
    /// [`RefreshError::SourceUnavailable`] when the budget is spent.
    pub fn remaining(&self, source: SourceName) -> Result<Duration, RefreshError> {
        self.ensure_not_cancelled()?;
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RefreshError::source_unavailable(
                source,
                "fetch budget exhausted",
            ));
        }
        Ok(remaining)
    }

    /// # Errors
    /// Returns [`RefreshError::Cancelled`] when the caller cancelled.
    pub fn ensure_not_cancelled(&self) -> Result<(), RefreshError> {
        if self.cancel.is_cancelled() {
            return Err(RefreshError::Cancelled {
                stage: RefreshStage::Fetching,
            });
        }
        Ok(())
    }
}

pub trait ExternalSources: Sync {
    #[allow(clippy::missing_errors_doc)]
    fn fetch_reference_entities(
        &self,
        budget: &FetchBudget,
    ) -> Result<Vec<ReferenceEntity>, RefreshError>;

    #[allow(clippy::missing_errors_doc)]
    fn fetch_rate_table(&self, budget: &FetchBudget) -> Result<RateTable, RefreshError>;
}

/// Issues both fetches concurrently under one budget.
///
/// When both fail, the countries failure is reported.
///
/// # Errors
/// Returns the first failing source's [`RefreshError::SourceUnavailable`], or
/// [`RefreshError::Cancelled`] when cancellation is observed.
pub fn fetch_both(
    sources: &dyn ExternalSources,
    budget: &FetchBudget,
) -> Result<(Vec<ReferenceEntity>, RateTable), RefreshError> {
    budget.ensure_not_cancelled()?;

    let (entities, rates) = std::thread::scope(|scope| {
        let rates_handle = scope.spawn(|| sources.fetch_rate_table(budget));
        let entities = sources.fetch_reference_entities(budget);
        let rates = rates_handle.join().unwrap_or_else(|_| {
            Err(RefreshError::source_unavailable(
                SourceName::ExchangeRates,
                "fetch worker panicked",
            ))
        });
        (entities, rates)
    });

    let entities = entities?;
    let rates = rates?;
    budget.ensure_not_cancelled()?;
    Ok((entities, rates))
}

#[derive(Debug, Deserialize)]
struct RatesPayload {
    result: String,
    base_code: Option<String>,
    rates: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone)]
pub struct HttpSources {
    countries_url: String,
    rates_url: String,
}

impl Default for HttpSources {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTRIES_URL, DEFAULT_RATES_URL)
    }
}

impl HttpSources {
    #[must_use]
    pub fn new(countries_url: impl Into<String>, rates_url: impl Into<String>) -> Self {
        Self {
            countries_url: countries_url.into(),
            rates_url: rates_url.into(),
        }
    }

    fn get_json<T: DeserializeOwned>(
        source: SourceName,
        url: &str,
        budget: &FetchBudget,
    ) -> Result<T, RefreshError> {
        let timeout = budget.remaining(source)?;
        debug!(
            source = source.as_str(),
            url,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "fetching upstream dataset"
        );

        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let response = match agent.get(url).set("accept", "application/json").call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                error!(source = source.as_str(), code, "upstream returned error status");
                return Err(RefreshError::source_unavailable(
                    source,
                    format!("http status {code}"),
                ));
            }
            Err(ureq::Error::Transport(err)) => {
                error!(source = source.as_str(), error = %err, "upstream transport failure");
                return Err(RefreshError::source_unavailable(
                    source,
                    format!("http transport failure: {err}"),
                ));
            }
        };

        response.into_json::<T>().map_err(|err| {
            error!(
                source = source.as_str(),
                error = %err,
                "upstream payload did not match expected shape"
            );
            RefreshError::source_unavailable(source, format!("invalid payload: {err}"))
        })
    }
}

impl ExternalSources for HttpSources {
    fn fetch_reference_entities(
        &self,
        budget: &FetchBudget,
    ) -> Result<Vec<ReferenceEntity>, RefreshError> {
        let entities: Vec<ReferenceEntity> =
            Self::get_json(SourceName::Countries, &self.countries_url, budget)?;
        debug!(count = entities.len(), "fetched reference entities");
        Ok(entities)
    }

    fn fetch_rate_table(&self, budget: &FetchBudget) -> Result<RateTable, RefreshError> {
        let payload: RatesPayload =
            Self::get_json(SourceName::ExchangeRates, &self.rates_url, budget)?;
        if payload.result != "success" {
            error!(result = %payload.result, "exchange rate source reported failure");
            return Err(RefreshError::source_unavailable(
                SourceName::ExchangeRates,
                format!("upstream result was '{}'", payload.result),
            ));
        }

        let table = RateTable::new(payload.base_code, payload.rates.unwrap_or_default());
        debug!(count = table.len(), base = table.base_code(), "fetched rate table");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    /// Serves exactly one canned HTTP response on an ephemeral port.
    fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<()>) {
        let listener = must(TcpListener::bind("127.0.0.1:0"));
        let addr = must(listener.local_addr());
        let handle = std::thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) if line == "\r\n" => break,
                    Ok(_) => {}
                }
            }
            let mut stream = reader.into_inner();
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        });
        (format!("http://{addr}/"), handle)
    }

    /// Accepts one connection, reads the request, then never answers.
    fn serve_stalled() -> String {
        let listener = must(TcpListener::bind("127.0.0.1:0"));
        let addr = must(listener.local_addr());
        std::thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            while matches!(reader.read_line(&mut line), Ok(n) if n > 0) && line != "\r\n" {
                line.clear();
            }
            std::thread::sleep(Duration::from_secs(3));
        });
        format!("http://{addr}/")
    }

    fn budget() -> FetchBudget {
        FetchBudget::new(Duration::from_secs(5), CancellationToken::new())
    }

    struct StaticSources {
        entities: Result<Vec<ReferenceEntity>, RefreshError>,
        rates: Result<RateTable, RefreshError>,
    }

    impl ExternalSources for StaticSources {
        fn fetch_reference_entities(
            &self,
            _budget: &FetchBudget,
        ) -> Result<Vec<ReferenceEntity>, RefreshError> {
            self.entities.clone()
        }

        fn fetch_rate_table(&self, _budget: &FetchBudget) -> Result<RateTable, RefreshError> {
            self.rates.clone()
        }
    }

    #[test]
    fn countries_payload_is_parsed() {
        let (url, server) = serve_once(
            "200 OK",
            r#"[{"name":"Wonderland","capital":"Heart","region":"Fiction","population":1000,"flag":"https://flags.example/won.svg","currencies":[{"code":"WON","name":"Won"}]},{"name":"Atlantis","population":0}]"#,
        );
        let sources = HttpSources::new(url, "http://127.0.0.1:9/unused");
        let entities = must(sources.fetch_reference_entities(&budget()));
        let _ = server.join();

        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].name, "Wonderland");
        assert_eq!(entities[0].population, 1000);
        assert_eq!(entities[1].currencies, None);
    }

    #[test]
    fn empty_countries_payload_is_valid() {
        let (url, server) = serve_once("200 OK", "[]");
        let sources = HttpSources::new(url, "http://127.0.0.1:9/unused");
        let entities = must(sources.fetch_reference_entities(&budget()));
        let _ = server.join();
        assert!(entities.is_empty());
    }

    #[test]
    fn rate_payload_is_parsed_and_sanitized() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"result":"success","base_code":"USD","rates":{"USD":1,"WON":10.5,"BAD":0}}"#,
        );
        let sources = HttpSources::new("http://127.0.0.1:9/unused", url);
        let table = must(sources.fetch_rate_table(&budget()));
        let _ = server.join();

        assert_eq!(table.base_code(), Some("USD"));
        assert_eq!(table.rate("WON"), Some(10.5));
        assert_eq!(table.rate("BAD"), None);
    }

    #[test]
    fn missing_rates_map_yields_empty_table() {
        let (url, server) = serve_once("200 OK", r#"{"result":"success","base_code":"USD"}"#);
        let sources = HttpSources::new("http://127.0.0.1:9/unused", url);
        let table = must(sources.fetch_rate_table(&budget()));
        let _ = server.join();
        assert!(table.is_empty());
    }

    #[test]
    fn non_success_status_is_source_unavailable() {
        let (url, server) = serve_once("503 Service Unavailable", r#"{"error":"down"}"#);
        let sources = HttpSources::new(url, "http://127.0.0.1:9/unused");
        let result = sources.fetch_reference_entities(&budget());
        let _ = server.join();

        match result {
            Err(err) => assert_eq!(err.source_name(), Some(SourceName::Countries)),
            Ok(_) => panic!("expected source failure"),
        }
    }

    #[test]
    fn shape_mismatch_is_source_unavailable() {
        let (url, server) = serve_once("200 OK", r#"{"not":"a list"}"#);
        let sources = HttpSources::new(url, "http://127.0.0.1:9/unused");
        let result = sources.fetch_reference_entities(&budget());
        let _ = server.join();
        assert!(matches!(
            result,
            Err(RefreshError::SourceUnavailable {
                source_name: SourceName::Countries,
                ..
            })
        ));
    }

    #[test]
    fn rate_source_error_result_is_source_unavailable() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"result":"error","base_code":"USD","error-type":"quota-reached"}"#,
        );
        let sources = HttpSources::new("http://127.0.0.1:9/unused", url);
        let result = sources.fetch_rate_table(&budget());
        let _ = server.join();
        assert!(matches!(
            result,
            Err(RefreshError::SourceUnavailable {
                source_name: SourceName::ExchangeRates,
                ..
            })
        ));
    }

    #[test]
    fn transport_failure_is_source_unavailable() {
        let listener = must(TcpListener::bind("127.0.0.1:0"));
        let addr = must(listener.local_addr());
        drop(listener);

        let sources = HttpSources::new("http://127.0.0.1:9/unused", format!("http://{addr}/"));
        let result = sources.fetch_rate_table(&budget());
        assert_eq!(
            result.err().and_then(|err| err.source_name()),
            Some(SourceName::ExchangeRates)
        );
    }

    #[test]
    fn cancelled_budget_stops_before_any_request() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let budget = FetchBudget::new(Duration::from_secs(5), cancel);
        let sources = HttpSources::new("http://127.0.0.1:9/a", "http://127.0.0.1:9/b");
        assert_eq!(
            sources.fetch_rate_table(&budget).err(),
            Some(RefreshError::Cancelled {
                stage: RefreshStage::Fetching
            })
        );
    }

    #[test]
    fn exhausted_budget_is_source_unavailable() {
        let budget = FetchBudget::new(Duration::ZERO, CancellationToken::new());
        assert!(matches!(
            budget.remaining(SourceName::Countries),
            Err(RefreshError::SourceUnavailable {
                source_name: SourceName::Countries,
                ..
            })
        ));
    }

    #[test]
    fn stalled_countries_source_fails_when_budget_expires() {
        let sources = HttpSources::new(serve_stalled(), "http://127.0.0.1:9/unused");
        let budget = FetchBudget::new(Duration::from_millis(300), CancellationToken::new());
        let started = Instant::now();
        let result = sources.fetch_reference_entities(&budget);
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(RefreshError::SourceUnavailable {
                source_name: SourceName::Countries,
                ..
            })
        ));
        assert!(elapsed >= Duration::from_millis(250), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    }

    /// Starts the countries request late; rates answer immediately.
    struct LateCountries {
        delay: Duration,
        http: HttpSources,
    }

    impl ExternalSources for LateCountries {
        fn fetch_reference_entities(
            &self,
            budget: &FetchBudget,
        ) -> Result<Vec<ReferenceEntity>, RefreshError> {
            std::thread::sleep(self.delay);
            self.http.fetch_reference_entities(budget)
        }

        fn fetch_rate_table(&self, _budget: &FetchBudget) -> Result<RateTable, RefreshError> {
            Ok(RateTable::default())
        }
    }

    #[test]
    fn late_fetch_only_gets_what_is_left_of_the_joint_budget() {
        let sources = LateCountries {
            delay: Duration::from_millis(400),
            http: HttpSources::new(serve_stalled(), "http://127.0.0.1:9/unused"),
        };
        let budget = FetchBudget::new(Duration::from_millis(500), CancellationToken::new());
        let started = Instant::now();
        let result = fetch_both(&sources, &budget);
        let elapsed = started.elapsed();

        assert_eq!(
            result.err().and_then(|err| err.source_name()),
            Some(SourceName::Countries)
        );
        // A fresh budget for the late request would run past 900ms.
        assert!(elapsed >= Duration::from_millis(450), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "returned after {elapsed:?}");
    }

    #[test]
    fn fetch_both_reports_countries_failure_first() {
        let sources = StaticSources {
            entities: Err(RefreshError::source_unavailable(SourceName::Countries, "down")),
            rates: Err(RefreshError::source_unavailable(
                SourceName::ExchangeRates,
                "down",
            )),
        };
        let result = fetch_both(&sources, &budget());
        assert_eq!(
            result.err().and_then(|err| err.source_name()),
            Some(SourceName::Countries)
        );
    }

    #[test]
    fn fetch_both_surfaces_rate_failure() {
        let sources = StaticSources {
            entities: Ok(Vec::new()),
            rates: Err(RefreshError::source_unavailable(
                SourceName::ExchangeRates,
                "down",
            )),
        };
        let result = fetch_both(&sources, &budget());
        assert_eq!(
            result.err().and_then(|err| err.source_name()),
            Some(SourceName::ExchangeRates)
        );
    }

    #[test]
    fn fetch_both_returns_both_datasets() {
        let sources = StaticSources {
            entities: Ok(Vec::new()),
            rates: Ok(RateTable::new(None, [("WON".to_string(), 10.0)])),
        };
        let (entities, rates) = must(fetch_both(&sources, &budget()));
        assert!(entities.is_empty());
        assert_eq!(rates.rate("WON"), Some(10.0));
    }
}
