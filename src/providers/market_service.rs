use super::util::with_retry;
use crate::core::{
    asset::{MarketKind, Ticker, normalize_currency},
    config::ProviderConfig,
    currency::CurrencyRateProvider,
    metadata::{DirectoryProvider, ReturnTable, ReturnsProvider},
    price::{HistoryProvider, QuoteProvider},
    resolver::{DirectoryEntry, IdRemap, TickerDirectory},
    series::{HistoricalPoint, HistoricalSeries},
    snapshot::{Quote, QuoteBatch},
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{RequestBuilder, Url};
use serde::{Deserialize, de::DeserializeOwned};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, instrument};

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    cryptos: Vec<DirectoryEntry>,
    #[serde(default)]
    stocks: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct MarketDataResponse {
    #[serde(default)]
    data: MarketData,
}

#[derive(Debug, Default, Deserialize)]
struct MarketData {
    #[serde(default)]
    cryptos: HashMap<String, QuoteDto>,
    #[serde(default)]
    stocks: HashMap<String, QuoteDto>,
    #[serde(default, rename = "_meta")]
    meta: Vec<ResolvedIdDto>,
}

#[derive(Debug, Deserialize)]
struct QuoteDto {
    eur: Option<f64>,
    price: Option<f64>,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvedIdDto {
    id: String,
    resolved_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    currency: Option<String>,
    #[serde(default)]
    history: Vec<HistoryPointDto>,
}

#[derive(Debug, Deserialize)]
struct HistoryPointDto {
    date: String,
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FxResponse {
    #[serde(default)]
    rates: HashMap<String, Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct IrrResponse {
    #[serde(default)]
    irr: HashMap<String, Option<f64>>,
}

/// HTTP client for the portfolio backend's market data endpoints.
pub struct MarketDataService {
    base_url: String,
    client: reqwest::Client,
    retries: usize,
    retry_delay_ms: u64,
}

impl MarketDataService {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::from_config(&ProviderConfig {
            base_url: base_url.to_string(),
            ..ProviderConfig::default()
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("foliosync/0.1")
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            retries: config.retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    pub fn with_retry_policy(mut self, retries: usize, retry_delay_ms: u64) -> Self {
        self.retries = retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn url_with_params(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Url> {
        let url = if params.is_empty() {
            Url::parse(&self.url(endpoint))
        } else {
            Url::parse_with_params(&self.url(endpoint), params)
        };
        url.with_context(|| format!("Invalid URL for {endpoint}"))
    }

    /// GET with retries; the body is parsed once the transfer succeeded.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!("Requesting {}", url);
        let text = with_retry(
            || {
                let request = self.client.get(url.clone());
                async move { read_text(request).await }
            },
            self.retries,
            self.retry_delay_ms,
        )
        .await
        .with_context(|| format!("Request to {} failed", url.path()))?;
        parse_body(&text, url.path())
    }
}

async fn read_text(request: RequestBuilder) -> Result<String> {
    let response = request.send().await.context("Request error")?;
    if !response.status().is_success() {
        return Err(anyhow!("HTTP error: {}", response.status()));
    }
    response
        .text()
        .await
        .context("Failed to get response text")
}

fn parse_body<T: DeserializeOwned>(text: &str, endpoint: &str) -> Result<T> {
    match serde_json::from_str(text) {
        Ok(data) => Ok(data),
        Err(e) => {
            error!(
                error = ?e,
                response = %text,
                "Failed to parse {} response", endpoint
            );
            Err(e).with_context(|| format!("Failed to parse {endpoint} response"))
        }
    }
}

fn parse_day(date: &str) -> Option<NaiveDate> {
    let day = date.get(..10).unwrap_or(date);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn collect_quotes(kind: MarketKind, quotes: HashMap<String, QuoteDto>, into: &mut QuoteBatch) {
    for (id, dto) in quotes {
        let Some(price_eur) = usable(dto.eur) else {
            debug!("Skipping {} quote without a EUR price: {}", kind, id);
            continue;
        };
        let quote = Quote {
            price_eur,
            raw_price: usable(dto.price).unwrap_or(price_eur),
            currency: dto
                .currency
                .as_deref()
                .map(normalize_currency)
                .unwrap_or_else(|| normalize_currency("")),
        };
        into.quotes.insert(Ticker::new(id, kind), quote);
    }
}

#[async_trait]
impl DirectoryProvider for MarketDataService {
    #[instrument(name = "MarketDataDirectory", skip(self))]
    async fn fetch_directory(&self) -> Result<TickerDirectory> {
        let url = self.url_with_params("/tickers", &[])?;
        let response: DirectoryResponse = self.get_json(url).await?;
        debug!(
            cryptos = response.cryptos.len(),
            stocks = response.stocks.len(),
            "Loaded ticker directory"
        );
        Ok(TickerDirectory::new(&response.cryptos, &response.stocks))
    }
}

#[async_trait]
impl QuoteProvider for MarketDataService {
    #[instrument(
        name = "MarketDataQuotes",
        skip(self, tickers),
        fields(count = tickers.len())
    )]
    async fn fetch_quotes(&self, tickers: &BTreeSet<Ticker>) -> Result<QuoteBatch> {
        let url = self.url("/market-data");
        debug!("Posting {} tickers to {}", tickers.len(), url);

        // Not retried: the next sync cycle is the retry.
        let text = read_text(self.client.post(&url).json(tickers))
            .await
            .context("Market data request failed")?;
        let response: MarketDataResponse = parse_body(&text, "/market-data")?;

        let mut batch = QuoteBatch::default();
        collect_quotes(MarketKind::Crypto, response.data.cryptos, &mut batch);
        collect_quotes(MarketKind::Stock, response.data.stocks, &mut batch);

        let mut remap = IdRemap::new();
        for meta in response.data.meta {
            remap.record(&meta.id, &meta.resolved_id);
        }
        batch.remap = remap;
        Ok(batch)
    }
}

#[async_trait]
impl HistoryProvider for MarketDataService {
    #[instrument(
        name = "MarketDataHistory",
        skip(self, ticker),
        fields(id = %ticker.id)
    )]
    async fn fetch_history(
        &self,
        ticker: &Ticker,
        days: u32,
        fallback_currency: &str,
    ) -> Result<HistoricalSeries> {
        let url = self.url_with_params(
            "/history",
            &[
                ("id", ticker.id.clone()),
                ("type", ticker.kind.to_string()),
                ("days", days.to_string()),
            ],
        )?;
        let response: HistoryResponse = self.get_json(url).await?;

        let currency = normalize_currency(
            response
                .currency
                .as_deref()
                .unwrap_or(fallback_currency),
        );
        let points = response
            .history
            .into_iter()
            .filter_map(|point| match (parse_day(&point.date), usable(point.price)) {
                (Some(date), Some(price)) => Some(HistoricalPoint {
                    date,
                    price,
                    currency: currency.clone(),
                }),
                _ => {
                    debug!("Skipping unreadable history point for {}: {}", ticker.id, point.date);
                    None
                }
            })
            .collect();
        Ok(HistoricalSeries::from_points(points))
    }
}

#[async_trait]
impl CurrencyRateProvider for MarketDataService {
    #[instrument(name = "MarketDataFx", skip(self, currencies), fields(count = currencies.len()))]
    async fn fetch_rates(&self, currencies: &BTreeSet<String>) -> Result<HashMap<String, f64>> {
        if currencies.is_empty() {
            return Ok(HashMap::new());
        }
        let csv = currencies
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.url_with_params("/fx", &[("currencies", csv)])?;
        let response: FxResponse = self.get_json(url).await?;

        Ok(response
            .rates
            .into_iter()
            .filter_map(|(currency, rate)| usable(rate).map(|r| (normalize_currency(&currency), r)))
            .collect())
    }
}

#[async_trait]
impl ReturnsProvider for MarketDataService {
    #[instrument(name = "MarketDataReturns", skip(self))]
    async fn fetch_returns(&self) -> Result<ReturnTable> {
        let url = self.url_with_params("/investments/irr", &[])?;
        let response: IrrResponse = self.get_json(url).await?;
        Ok(response
            .irr
            .into_iter()
            .filter_map(|(id, irr)| usable(irr).map(|r| (id, r)))
            .collect())
    }
}
