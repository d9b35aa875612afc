//! Market-data tools backed by the Yahoo Finance chart API

use super::{parse_args, Tool, ToolError, ToolOutcome};
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const DEFAULT_INDICES: &[&str] = &["^GSPC", "^DJI", "^IXIC", "^VIX"];
const VALID_PERIODS: &[&str] = &[
    "1d", "5d", "1mo", "3mo", "6mo", "1y", "2y", "5y", "10y", "ytd", "max",
];
const TRADING_DAYS: f64 = 252.0;

//
// ================= Chart API =================
//

#[derive(Debug, Deserialize)]
pub struct ChartEnvelope {
    pub chart: ChartBody,
}

#[derive(Debug, Deserialize)]
pub struct ChartBody {
    #[serde(default)]
    pub result: Option<Vec<ChartResult>>,
    #[serde(default)]
    pub error: Option<ChartApiError>,
}

#[derive(Debug, Deserialize)]
pub struct ChartApiError {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct ChartResult {
    pub meta: ChartMeta,
    #[serde(default)]
    pub indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMeta {
    pub symbol: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub instrument_type: Option<String>,
    pub currency: Option<String>,
    pub regular_market_price: Option<f64>,
    pub chart_previous_close: Option<f64>,
    pub previous_close: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
    pub fifty_two_week_low: Option<f64>,
    pub regular_market_day_high: Option<f64>,
    pub regular_market_day_low: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Indicators {
    #[serde(default)]
    pub quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Quote {
    #[serde(default)]
    pub close: Vec<Option<f64>>,
    #[serde(default)]
    pub high: Vec<Option<f64>>,
    #[serde(default)]
    pub low: Vec<Option<f64>>,
}

impl ChartResult {
    fn quote(&self) -> Option<&Quote> {
        self.indicators.quote.first()
    }

    fn closes(&self) -> Vec<f64> {
        self.quote()
            .map(|q| q.close.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    fn display_name(&self) -> String {
        self.meta
            .long_name
            .clone()
            .or_else(|| self.meta.short_name.clone())
            .unwrap_or_else(|| self.meta.symbol.clone())
    }

    fn previous_close(&self) -> Option<f64> {
        self.meta.previous_close.or(self.meta.chart_previous_close)
    }
}

/// Unwrap a decoded envelope into its single result.
pub fn into_result(envelope: ChartEnvelope, symbol: &str) -> Result<ChartResult, ToolError> {
    if let Some(error) = envelope.chart.error {
        return Err(if error.code.eq_ignore_ascii_case("not found") {
            ToolError::NotFound(format!("no market data for symbol '{}'", symbol))
        } else {
            ToolError::Upstream(format!("{}: {}", error.code, error.description))
        });
    }

    envelope
        .chart
        .result
        .and_then(|mut results| results.pop())
        .ok_or_else(|| ToolError::NotFound(format!("no market data for symbol '{}'", symbol)))
}

#[derive(Clone)]
pub struct YahooFinanceClient {
    client: Client,
    base_url: String,
}

impl YahooFinanceClient {
    pub fn new() -> crate::Result<Self> {
        Self::with_base_url(YAHOO_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(20))
            .user_agent("Mozilla/5.0 (compatible; wealth-steward)")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn chart(&self, symbol: &str, range: &str) -> Result<ChartResult, ToolError> {
        let url = format!("{}/{}", self.base_url, symbol);

        let response = self
            .client
            .get(url)
            .query(&[("range", range), ("interval", "1d")])
            .send()
            .await
            .map_err(|e| ToolError::Upstream(format!("chart request for {} failed: {}", symbol, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Upstream(format!("chart body for {} unreadable: {}", symbol, e)))?;

        match serde_json::from_str::<ChartEnvelope>(&body) {
            Ok(envelope) => into_result(envelope, symbol),
            Err(_) if status == StatusCode::NOT_FOUND => Err(ToolError::NotFound(format!(
                "no market data for symbol '{}'",
                symbol
            ))),
            Err(e) => Err(ToolError::Upstream(format!(
                "chart API returned {} for {}: {}",
                status, symbol, e
            ))),
        }
    }
}

//
// ================= Analytics =================
//

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Start/end/high/low over the fetched period.
pub fn history_summary(period: &str, chart: &ChartResult) -> Option<Value> {
    let closes = chart.closes();
    let (first, last) = (*closes.first()?, *closes.last()?);
    let quote = chart.quote()?;

    let high = quote.high.iter().flatten().copied().fold(f64::MIN, f64::max);
    let low = quote.low.iter().flatten().copied().fold(f64::MAX, f64::min);
    let percent_change = if first != 0.0 {
        Some(round2((last - first) / first * 100.0))
    } else {
        None
    };

    Some(json!({
        "period": period,
        "start_price": round2(first),
        "end_price": round2(last),
        "high": (high > f64::MIN).then(|| round2(high)),
        "low": (low < f64::MAX).then(|| round2(low)),
        "percent_change": percent_change,
    }))
}

/// Annualized volatility of daily returns, in percent. Needs > 20 closes.
pub fn annualized_volatility(closes: &[f64]) -> Option<f64> {
    if closes.len() <= 20 {
        return None;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt() * TRADING_DAYS.sqrt() * 100.0)
}

pub fn risk_level(volatility: Option<f64>) -> &'static str {
    match volatility {
        Some(v) if v < 12.0 => "Low",
        Some(v) if v < 18.0 => "Moderate",
        Some(v) if v < 25.0 => "Moderately High",
        Some(_) => "High",
        None => "Unable to assess",
    }
}

/// Diversification and concentration hints for a weight breakdown.
pub fn risk_recommendations(breakdown: &BTreeMap<String, f64>, volatility: Option<f64>) -> Vec<String> {
    let mut recommendations = Vec::new();

    if breakdown.len() < 3 {
        recommendations.push(
            "Low diversification: consider adding assets of different types to reduce risk".to_string(),
        );
    } else if breakdown.len() >= 5 {
        recommendations.push("Good diversification across the portfolio".to_string());
    }

    for (group, weight) in breakdown {
        if *weight > 40.0 {
            recommendations.push(format!(
                "High concentration in {} ({:.1}%): consider reducing to below 30%",
                group, weight
            ));
        } else if *weight > 30.0 {
            recommendations.push(format!(
                "Moderate concentration in {} ({:.1}%): monitor this allocation",
                group, weight
            ));
        }
    }

    match volatility {
        Some(v) if v > 25.0 => recommendations.push(
            "High portfolio volatility: consider adding bonds or low-volatility dividend stocks".to_string(),
        ),
        Some(v) if v > 20.0 => recommendations.push(
            "Moderately high volatility: may be suitable for long time horizons only".to_string(),
        ),
        Some(v) if v < 10.0 => recommendations.push(
            "Low volatility portfolio: good for capital preservation, may underperform in bull markets"
                .to_string(),
        ),
        _ => {}
    }

    if recommendations.is_empty() {
        recommendations.push("Portfolio appears well-balanced for moderate risk tolerance".to_string());
    }
    recommendations
}

//
// ================= Tools =================
//

#[derive(Debug, Deserialize)]
struct ProductDataArgs {
    symbol: String,
    #[serde(default = "default_period")]
    period: String,
}

fn default_period() -> String {
    "1mo".to_string()
}

pub struct ProductDataTool {
    client: YahooFinanceClient,
}

impl ProductDataTool {
    pub fn new(client: YahooFinanceClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for ProductDataTool {
    fn name(&self) -> &'static str {
        "get_financial_product_data"
    }

    fn description(&self) -> &'static str {
        "Get price data for stocks, ETFs, crypto, futures and other financial products \
         supported by Yahoo Finance."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Ticker symbol, e.g. AAPL, VOO, BTC-USD, GC=F"
                },
                "period": {
                    "type": "string",
                    "description": "History window: 1d, 5d, 1mo, 3mo, 6mo, 1y, 2y, 5y, 10y, ytd, max"
                }
            },
            "required": ["symbol"]
        })
    }

    async fn execute(&self, arguments: &Value) -> ToolOutcome {
        let args: ProductDataArgs = parse_args(arguments)?;
        let symbol = args.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(ToolError::InvalidArguments("symbol must not be empty".to_string()));
        }
        if !VALID_PERIODS.contains(&args.period.as_str()) {
            return Err(ToolError::InvalidArguments(format!("unsupported period '{}'", args.period)));
        }

        let chart = self.client.chart(&symbol, &args.period).await?;
        Ok(product_snapshot(&symbol, &args.period, &chart))
    }
}

pub fn product_snapshot(symbol: &str, period: &str, chart: &ChartResult) -> Value {
    let mut data = Map::new();
    data.insert("symbol".into(), json!(symbol));
    data.insert("name".into(), json!(chart.display_name()));

    let optional = [
        ("type", chart.meta.instrument_type.clone().map(Value::from)),
        ("currency", chart.meta.currency.clone().map(Value::from)),
        ("current_price", chart.meta.regular_market_price.map(Value::from)),
        ("previous_close", chart.previous_close().map(Value::from)),
        ("52_week_high", chart.meta.fifty_two_week_high.map(Value::from)),
        ("52_week_low", chart.meta.fifty_two_week_low.map(Value::from)),
        ("history_summary", history_summary(period, chart)),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            data.insert(key.into(), value);
        }
    }

    Value::Object(data)
}

#[derive(Debug, Default, Deserialize)]
struct MarketOverviewArgs {
    #[serde(default)]
    indices: Option<Vec<String>>,
}

pub struct MarketOverviewTool {
    client: YahooFinanceClient,
}

impl MarketOverviewTool {
    pub fn new(client: YahooFinanceClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for MarketOverviewTool {
    fn name(&self) -> &'static str {
        "get_market_overview"
    }

    fn description(&self) -> &'static str {
        "Get an overview of major market indices. Defaults to S&P 500, Dow Jones, NASDAQ and VIX."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "indices": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Index symbols to check, e.g. ^GSPC"
                }
            }
        })
    }

    async fn execute(&self, arguments: &Value) -> ToolOutcome {
        let args: MarketOverviewArgs = parse_args(arguments)?;
        let indices = args
            .indices
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| DEFAULT_INDICES.iter().map(|s| s.to_string()).collect());

        let charts = join_all(indices.iter().map(|symbol| self.client.chart(symbol, "1d"))).await;

        let mut results = Map::new();
        for (symbol, chart) in indices.iter().zip(charts) {
            let entry = match chart {
                Ok(chart) => index_snapshot(&chart),
                Err(e) => json!({ "error": e.to_string() }),
            };
            results.insert(symbol.clone(), entry);
        }

        Ok(json!({
            "indices": results,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "note": "Market data may be delayed 15-20 minutes",
        }))
    }
}

pub fn index_snapshot(chart: &ChartResult) -> Value {
    let price = chart.meta.regular_market_price;
    let previous = chart.previous_close();
    let change = price.zip(previous).map(|(p, c)| round2(p - c));
    let change_percent = price
        .zip(previous)
        .filter(|(_, c)| *c != 0.0)
        .map(|(p, c)| round2((p - c) / c * 100.0));

    json!({
        "name": chart.meta.short_name.clone().unwrap_or_else(|| chart.meta.symbol.clone()),
        "price": price,
        "change": change,
        "change_percent": change_percent,
        "day_high": chart.meta.regular_market_day_high,
        "day_low": chart.meta.regular_market_day_low,
    })
}

#[derive(Debug, Deserialize)]
pub struct Holding {
    pub symbol: String,
    /// Percentage of the portfolio, 0-100
    pub weight: f64,
}

#[derive(Debug, Deserialize)]
struct PortfolioRiskArgs {
    holdings: Vec<Holding>,
}

pub struct PortfolioRiskTool {
    client: YahooFinanceClient,
}

impl PortfolioRiskTool {
    pub fn new(client: YahooFinanceClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for PortfolioRiskTool {
    fn name(&self) -> &'static str {
        "assess_portfolio_risk"
    }

    fn description(&self) -> &'static str {
        "Assess the risk of a portfolio from its holdings: weighted volatility, risk level, \
         diversification and concentration recommendations."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "holdings": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "symbol": {"type": "string"},
                            "weight": {"type": "number", "description": "Percentage, 0-100"}
                        },
                        "required": ["symbol", "weight"]
                    }
                }
            },
            "required": ["holdings"]
        })
    }

    async fn execute(&self, arguments: &Value) -> ToolOutcome {
        let args: PortfolioRiskArgs = parse_args(arguments)?;
        if let Some(warning) = validate_weights(&args.holdings)? {
            return Ok(warning);
        }

        let symbols: Vec<String> = args.holdings.iter().map(|h| h.symbol.to_uppercase()).collect();
        let charts = join_all(symbols.iter().map(|symbol| self.client.chart(symbol, "1y"))).await;

        let analysed = args
            .holdings
            .iter()
            .zip(charts)
            .map(|(holding, chart)| (holding, chart.ok()))
            .collect::<Vec<_>>();

        Ok(assess(&analysed))
    }
}

/// `Ok(Some(_))` is a warning returned to the model instead of an analysis.
fn validate_weights(holdings: &[Holding]) -> Result<Option<Value>, ToolError> {
    if holdings.is_empty() {
        return Err(ToolError::InvalidArguments("no holdings provided".to_string()));
    }
    if let Some(bad) = holdings.iter().find(|h| !(0.0..=100.0).contains(&h.weight)) {
        return Err(ToolError::InvalidArguments(format!(
            "weight of {} must be between 0 and 100",
            bad.symbol
        )));
    }

    let total: f64 = holdings.iter().map(|h| h.weight).sum();
    if (total - 100.0).abs() > 5.0 {
        return Ok(Some(json!({
            "warning": format!("Portfolio weights sum to {}%, not 100%", round2(total)),
            "suggestion": "Adjust weights to sum to approximately 100%",
        })));
    }
    Ok(None)
}

fn assess(holdings: &[(&Holding, Option<ChartResult>)]) -> Value {
    let mut weighted_volatility = 0.0;
    let mut volatility_seen = false;
    let mut breakdown: BTreeMap<String, f64> = BTreeMap::new();
    let mut details = Vec::with_capacity(holdings.len());

    for (holding, chart) in holdings {
        let symbol = holding.symbol.to_uppercase();
        let Some(chart) = chart else {
            details.push(json!({
                "symbol": symbol,
                "weight": holding.weight,
                "error": "market data unavailable",
            }));
            continue;
        };

        let volatility = annualized_volatility(&chart.closes());
        if let Some(v) = volatility {
            weighted_volatility += v * holding.weight / 100.0;
            volatility_seen = true;
        }

        let group = chart
            .meta
            .instrument_type
            .clone()
            .unwrap_or_else(|| "Unknown".to_string());
        *breakdown.entry(group.clone()).or_insert(0.0) += holding.weight;

        details.push(json!({
            "symbol": symbol,
            "weight": holding.weight,
            "name": chart.display_name(),
            "asset_type": group,
            "volatility": volatility.map(round2),
        }));
    }

    let volatility = volatility_seen.then_some(weighted_volatility);
    let rounded_breakdown: BTreeMap<&String, f64> = breakdown
        .iter()
        .map(|(k, v)| (k, (v * 10.0).round() / 10.0))
        .collect();

    json!({
        "portfolio_volatility": volatility.map(round2),
        "risk_level": risk_level(volatility),
        "asset_type_breakdown": rounded_breakdown,
        "holding_count": holdings.len(),
        "holdings_analysis": details,
        "recommendations": risk_recommendations(&breakdown, volatility),
    })
}
