//! Aggregation, overrides and alert lifecycle against scripted providers.

use async_trait::async_trait;
use asaas_core::config::DiscrepancyThreshold;
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::types::{CurrencyPair, CurrencyStatus, RateSource};
use asaas_rates::{ExchangeRateAggregator, RateProvider};
use asaas_state::SettingsStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Provider answering from a table it can be reprogrammed with; a missing
/// entry is an outage.
struct ScriptedProvider {
    id: String,
    rates: Mutex<HashMap<CurrencyPair, f64>>,
}

impl ScriptedProvider {
    fn new(id: &str, rates: &[(&CurrencyPair, f64)]) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            rates: Mutex::new(rates.iter().map(|(p, r)| ((*p).clone(), *r)).collect()),
        })
    }

    fn set(&self, pair: &CurrencyPair, rate: Option<f64>) {
        let mut rates = self.rates.lock().unwrap();
        match rate {
            Some(r) => rates.insert(pair.clone(), r),
            None => rates.remove(pair),
        };
    }
}

#[async_trait]
impl RateProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, _pair: &CurrencyPair) -> bool {
        true
    }

    async fn fetch(&self, pair: &CurrencyPair) -> AsaasResult<f64> {
        self.rates
            .lock()
            .unwrap()
            .get(pair)
            .copied()
            .ok_or_else(|| AsaasError::ProviderUnavailable {
                provider: self.id.clone(),
                pair: pair.to_string(),
                reason: "connection refused".into(),
            })
    }
}

fn usd() -> CurrencyPair {
    CurrencyPair::new("USD", "IQD")
}

fn eur() -> CurrencyPair {
    CurrencyPair::new("EUR", "IQD")
}

struct Fixture {
    rates: Arc<ExchangeRateAggregator>,
    first: Arc<ScriptedProvider>,
    second: Arc<ScriptedProvider>,
    tmp: TempDir,
}

fn aggregator_at(tmp: &TempDir, providers: Vec<Arc<dyn RateProvider>>) -> Arc<ExchangeRateAggregator> {
    let settings = SettingsStore::open(&tmp.path().join("settings.json"))
        .unwrap()
        .into_shared();
    ExchangeRateAggregator::new(
        vec![usd(), eur()],
        providers,
        DiscrepancyThreshold::Percent(10.0),
        settings,
    )
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let first = ScriptedProvider::new("xeiqd", &[(&usd(), 120_000.0), (&eur(), 140_000.0)]);
    let second = ScriptedProvider::new("forexfy", &[(&usd(), 140_000.0), (&eur(), 142_000.0)]);
    let rates = aggregator_at(
        &tmp,
        vec![first.clone() as Arc<dyn RateProvider>, second.clone() as Arc<dyn RateProvider>],
    );
    Fixture {
        rates,
        first,
        second,
        tmp,
    }
}

#[tokio::test]
async fn test_active_rate_is_first_provider_not_average() {
    let f = fixture();
    let report = f.rates.refresh(None).await.unwrap();

    let usd_refresh = report.pairs.iter().find(|p| p.pair == usd()).unwrap();
    assert_eq!(usd_refresh.average, Some(130_000.0));
    assert_eq!(usd_refresh.responded(), 2);

    let snap = f.rates.snapshot(&usd()).unwrap();
    assert_eq!(snap.rate, 120_000.0);
    assert_eq!(snap.source, RateSource::Provider("xeiqd".into()));
    assert_eq!(snap.average, Some(130_000.0));
    assert!(!snap.is_manual);
    assert_eq!(f.rates.status(&usd()), Some(CurrencyStatus::Ok));
}

#[tokio::test]
async fn test_manual_override_raises_discrepancy() {
    let f = fixture();
    f.rates.set_manual_rate(&usd(), 150_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();

    let snap = f.rates.snapshot(&usd()).unwrap();
    assert_eq!(snap.rate, 150_000.0);
    assert_eq!(snap.source, RateSource::Manual);
    assert!(snap.is_manual);

    let alerts = f.rates.alerts();
    assert!(alerts.has_discrepancy);
    let alert = alerts.discrepancy.unwrap();
    assert_eq!(alert.pair, usd());
    assert_eq!(alert.manual_value, 150_000.0);
    assert_eq!(alert.average_value, 130_000.0);
    assert_eq!(alert.diff, 20_000.0);
    assert!(alert.threshold_exceeded);
    assert_eq!(alerts.all_discrepancies.len(), 1);
}

#[tokio::test]
async fn test_manual_within_threshold_is_quiet() {
    let f = fixture();
    f.rates.set_manual_rate(&usd(), 135_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();

    let cmp = f.rates.detect_discrepancy(&usd()).await.unwrap().unwrap();
    assert_eq!(cmp.diff, 5_000.0);
    assert!(!cmp.threshold_exceeded);
    assert!(!f.rates.alerts().has_discrepancy);
}

#[tokio::test]
async fn test_indefinite_snooze_until_unsnooze() {
    let f = fixture();
    f.rates.set_manual_rate(&usd(), 150_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();

    let state = f.rates.snooze(&usd(), -1).await.unwrap();
    assert_eq!(state.count, 1);
    f.rates.refresh(None).await.unwrap();
    let alerts = f.rates.alerts();
    assert!(!alerts.has_discrepancy);
    assert_eq!(alerts.snoozed_pairs, vec![usd()]);
    assert_eq!(alerts.all_discrepancies.len(), 1);

    f.rates.unsnooze(&usd()).await.unwrap();
    f.rates.refresh(None).await.unwrap();
    let alerts = f.rates.alerts();
    assert!(alerts.has_discrepancy);
    assert!(alerts.snoozed_pairs.is_empty());
}

#[tokio::test]
async fn test_timed_snooze_counts() {
    let f = fixture();
    f.rates.set_manual_rate(&usd(), 150_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();

    f.rates.snooze(&usd(), 15).await.unwrap();
    let state = f.rates.snooze(&usd(), 30).await.unwrap();
    assert_eq!(state.count, 2);
    assert!(!f.rates.alerts().has_discrepancy);

    assert!(f.rates.snooze(&usd(), -5).await.is_err());
}

#[tokio::test]
async fn test_very_long_snooze_holds() {
    let f = fixture();
    f.rates.set_manual_rate(&usd(), 150_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();

    let state = f.rates.snooze(&usd(), i64::MAX).await.unwrap();
    assert_eq!(state.count, 1);
    f.rates.refresh(None).await.unwrap();
    assert!(!f.rates.alerts().has_discrepancy);
}

#[tokio::test]
async fn test_dismiss_reraises_on_next_refresh() {
    let f = fixture();
    f.rates.set_manual_rate(&usd(), 150_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();

    f.rates.dismiss().await;
    assert!(!f.rates.alerts().has_discrepancy);

    f.rates.refresh(None).await.unwrap();
    assert!(f.rates.alerts().has_discrepancy);

    // zero minutes is the menu's "immediate": dismiss without snoozing
    let state = f.rates.snooze(&usd(), 0).await.unwrap();
    assert_eq!(state.count, 0);
    assert!(!f.rates.alerts().has_discrepancy);
    f.rates.refresh(None).await.unwrap();
    assert!(f.rates.alerts().has_discrepancy);
}

#[tokio::test]
async fn test_force_alert_ignores_snooze() {
    let f = fixture();
    f.rates.set_manual_rate(&usd(), 150_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();
    f.rates.snooze(&usd(), -1).await.unwrap();
    assert!(!f.rates.alerts().has_discrepancy);

    f.rates.force_alert(Some(&eur())).await;
    assert!(!f.rates.alerts().has_discrepancy);

    f.rates.force_alert(Some(&usd())).await;
    let alerts = f.rates.alerts();
    assert!(alerts.has_discrepancy);
    assert_eq!(alerts.discrepancy.unwrap().pair, usd());

    f.rates.force_alert(None).await;
    assert!(!f.rates.alerts().has_discrepancy);
}

#[tokio::test]
async fn test_clearing_manual_reverts_to_live() {
    let f = fixture();
    f.rates.set_manual_rate(&eur(), 200_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();
    assert!(f.rates.alerts().has_discrepancy);

    f.rates.set_manual_rate(&eur(), 0.0).await.unwrap();
    assert_eq!(f.rates.manual_rate(&eur()).await, None);
    let snap = f.rates.snapshot(&eur()).unwrap();
    assert_eq!(snap.source, RateSource::Provider("xeiqd".into()));
    assert_eq!(snap.rate, 140_000.0);
    assert!(!f.rates.alerts().has_discrepancy);
    assert!(f.rates.alerts().all_discrepancies.is_empty());
}

#[tokio::test]
async fn test_one_failing_provider_is_isolated() {
    let f = fixture();
    f.first.set(&usd(), None);
    let report = f.rates.refresh(Some(&usd())).await.unwrap();

    let usd_refresh = &report.pairs[0];
    assert_eq!(usd_refresh.status, CurrencyStatus::Ok);
    assert_eq!(usd_refresh.average, Some(140_000.0));
    assert_eq!(usd_refresh.responded(), 1);
    assert!(usd_refresh.quotes[0].result.is_err());

    let snap = f.rates.snapshot(&usd()).unwrap();
    assert_eq!(snap.source, RateSource::Provider("forexfy".into()));
    assert_eq!(snap.rate, 140_000.0);
}

#[tokio::test]
async fn test_zero_responders_keeps_last_value() {
    let f = fixture();
    f.rates.refresh(None).await.unwrap();

    f.first.set(&usd(), None);
    f.second.set(&usd(), None);
    f.rates.refresh(None).await.unwrap();

    assert_eq!(f.rates.status(&usd()), Some(CurrencyStatus::Error));
    assert_eq!(f.rates.status(&eur()), Some(CurrencyStatus::Ok));
    let snap = f.rates.snapshot(&usd()).unwrap();
    assert_eq!(snap.rate, 120_000.0);
    assert_eq!(snap.average, Some(130_000.0));
}

#[tokio::test]
async fn test_unknown_pair_rejected() {
    let f = fixture();
    let try_iqd = CurrencyPair::new("TRY", "IQD");
    assert!(matches!(
        f.rates.refresh(Some(&try_iqd)).await,
        Err(AsaasError::Validation(_))
    ));
    assert!(f.rates.set_manual_rate(&try_iqd, 1.0).await.is_err());
}

#[tokio::test]
async fn test_manual_rate_and_snooze_persist() {
    let f = fixture();
    f.rates.set_manual_rate(&usd(), 150_000.0).await.unwrap();
    f.rates.refresh(None).await.unwrap();
    f.rates.snooze(&usd(), -1).await.unwrap();

    let reopened = aggregator_at(
        &f.tmp,
        vec![f.first.clone() as Arc<dyn RateProvider>, f.second.clone() as Arc<dyn RateProvider>],
    );
    assert_eq!(reopened.manual_rate(&usd()).await, Some(150_000.0));
    reopened.refresh(None).await.unwrap();
    let alerts = reopened.alerts();
    assert!(!alerts.has_discrepancy);
    assert_eq!(alerts.snoozed_pairs, vec![usd()]);
}

#[tokio::test]
async fn test_refresh_report_published() {
    let f = fixture();
    let mut reports = f.rates.subscribe_reports();
    f.rates.refresh(None).await.unwrap();
    let report = reports.try_recv().unwrap();
    assert_eq!(report.pairs.len(), 2);
}
