use chrono::{Duration, NaiveDate};
use foliosync::core::asset::{AssetKind, AssetRecord};
use foliosync::core::cache::{MARKET_COLLECTION, Store};
use foliosync::core::config::SyncConfig;
use foliosync::providers::MarketDataService;
use foliosync::store::KeyValueStore;
use foliosync::sync::SyncOutcome;
use foliosync::{MarketSession, Providers};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

mod test_utils {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + Duration::days(offset)
    }

    fn history(currency: &str, start_price: f64) -> serde_json::Value {
        let points: Vec<_> = (0..30)
            .map(|i| {
                json!({
                    "date": day(i).format("%Y-%m-%d").to_string(),
                    "price": start_price + i as f64,
                })
            })
            .collect();
        json!({ "currency": currency, "history": points })
    }

    /// Backend where the second and later quote requests no longer carry BTC.
    pub async fn create_market_server() -> MockServer {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/tickers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cryptos": [{"id": "bitcoin", "symbol": "BTC", "name": "Bitcoin"}],
                "stocks": [{"id": "AAPL", "symbol": "AAPL", "name": "Apple Inc."}]
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/fx"))
            .and(query_param("currencies", "USD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rates": {"USD": 1.25}
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/market-data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "cryptos": {"bitcoin": {"eur": 50000.0}},
                    "stocks": {"AAPL": {"eur": 150.0, "price": 187.5, "currency": "USD"}},
                    "_meta": []
                }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/market-data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "cryptos": {},
                    "stocks": {"AAPL": {"eur": 150.0, "price": 187.5, "currency": "USD"}}
                }
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/history"))
            .and(query_param("id", "bitcoin"))
            .and(query_param("days", "30"))
            .respond_with(ResponseTemplate::new(200).set_body_json(history("EUR", 40000.0)))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/history"))
            .and(query_param("id", "AAPL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(history("USD", 170.0)))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/investments/irr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "irr": {"aapl-1": 0.5}
            })))
            .mount(&mock_server)
            .await;

        mock_server
    }

    pub async fn create_failing_server() -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/market-data"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;
        mock_server
    }
}

fn session(base_url: &str, store: Arc<KeyValueStore>) -> MarketSession {
    let mut config = SyncConfig::default();
    config.provider.base_url = base_url.to_string();
    config.provider.retries = 0;
    let service = MarketDataService::from_config(&config.provider).unwrap();
    MarketSession::new(&config, store, Providers::from_service(Arc::new(service)))
}

fn portfolio() -> Vec<AssetRecord> {
    let acquired_on = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    vec![
        AssetRecord {
            id: "btc-1".to_string(),
            canonical_id: None,
            name: "Bitcoin (BTC)".to_string(),
            symbol: None,
            kind: AssetKind::Crypto,
            quantity: 0.5,
            unit_cost: 30000.0,
            currency: "EUR".to_string(),
            acquired_on,
            group: Some("Crypto".to_string()),
        },
        AssetRecord {
            id: "aapl-1".to_string(),
            canonical_id: None,
            name: "Apple".to_string(),
            symbol: Some("aapl".to_string()),
            kind: AssetKind::Stock,
            quantity: 10.0,
            unit_cost: 100.0,
            currency: "USD".to_string(),
            acquired_on,
            group: Some("Stocks".to_string()),
        },
        AssetRecord {
            id: "flat".to_string(),
            canonical_id: None,
            name: "Flat".to_string(),
            symbol: None,
            kind: AssetKind::RealEstate,
            quantity: 1.0,
            unit_cost: 200000.0,
            currency: "EUR".to_string(),
            acquired_on,
            group: None,
        },
    ]
}

#[test_log::test(tokio::test)]
async fn test_full_session_scenario() {
    let mock_server = test_utils::create_market_server().await;
    let store = Arc::new(KeyValueStore::in_memory());
    let session = session(&mock_server.uri(), Arc::clone(&store));

    assert_eq!(session.load_directory().await, 2);

    let first = session.set_assets(portfolio()).await;
    assert!(matches!(first, Some(SyncOutcome::Applied(_))));
    assert_eq!(session.rates().rate("USD"), Some(0.8));

    // BTC drops out of the next response
    let outcome = session.sync_prices().await;
    info!(?outcome, "Second sync");
    match &outcome {
        SyncOutcome::Applied(report) => assert_eq!(report.stale, vec!["bitcoin".to_string()]),
        other => panic!("expected an applied snapshot, got {other:?}"),
    }
    assert!(outcome.warning().unwrap().contains("bitcoin"));

    let snapshot = session.snapshot();
    let btc = snapshot.get("bitcoin").unwrap();
    assert!(btc.stale);
    assert_eq!(btc.price_eur, 50000.0);
    let aapl = snapshot.get("AAPL").unwrap();
    assert!(!aapl.stale);
    assert_eq!(aapl.price_eur, 150.0);

    let valuation = session.valuation();
    assert!(valuation.complete);
    assert_eq!(valuation.holding("aapl-1").unwrap().value_eur, Some(1500.0));
    assert!(valuation.holding("btc-1").unwrap().stale);
    assert_eq!(valuation.holding("flat").unwrap().value_eur, Some(200000.0));

    let reconciled = session.reconcile().await.unwrap();
    assert_eq!(reconciled.len(), 30);
    assert_eq!(reconciled.dates[0], test_utils::day(0));
    assert_eq!(reconciled.dates[29], test_utils::day(29));
    // 0.5 BTC at 40000 EUR plus 10 AAPL at 170 USD (0.8 EUR per USD)
    assert_eq!(reconciled.all()[0].value, 21360.0);

    let groups = session.reconcile_by_group().await.unwrap();
    assert_eq!(groups["Stocks"][0].value, 1360.0);

    assert_eq!(session.annualized_return("aapl-1").await, Some(0.5));
    assert_eq!(session.annualized_return("missing").await, None);

    session.logout().await;
    assert!(session.snapshot().is_empty());
    assert!(
        store
            .collection(MARKET_COLLECTION)
            .get("snapshot")
            .await
            .is_none()
    );
}

#[test_log::test(tokio::test)]
async fn test_new_session_falls_back_to_persisted_snapshot() {
    let store = Arc::new(KeyValueStore::in_memory());

    let mock_server = test_utils::create_market_server().await;
    let online = session(&mock_server.uri(), Arc::clone(&store));
    online.load_directory().await;
    online.set_assets(portfolio()).await;
    online.end();

    let failing_server = test_utils::create_failing_server().await;
    let offline = session(&failing_server.uri(), Arc::clone(&store));
    let outcome = offline.set_assets(portfolio()).await.unwrap();

    assert!(matches!(outcome, SyncOutcome::Fallback { .. }));
    let snapshot = offline.snapshot();
    assert!(snapshot.get("bitcoin").unwrap().stale);
    assert_eq!(snapshot.get("bitcoin").unwrap().price_eur, 50000.0);
}

#[test_log::test(tokio::test)]
async fn test_unreachable_backend_reports_no_data() {
    let failing_server = test_utils::create_failing_server().await;
    let session = session(&failing_server.uri(), Arc::new(KeyValueStore::in_memory()));

    // No directory: assets are priced under their raw ids
    assert_eq!(session.load_directory().await, 0);
    let outcome = session.set_assets(portfolio()).await.unwrap();

    assert!(matches!(outcome, SyncOutcome::NoData { .. }));
    let valuation = session.valuation();
    assert!(!valuation.complete);
    assert!(valuation.holding("aapl-1").unwrap().error.is_some());
}
