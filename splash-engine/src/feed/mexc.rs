use super::FeedSource;
use crate::{error::SplashError, model::Snapshot};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use smol_str::SmolStr;
use std::time::Duration;

pub const MEXC_CONTRACT_TICKER_URL: &str = "https://contract.mexc.com/api/v1/contract/ticker";

/// Per-request timeout, shorter than any sensible polling backlog.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// ### Raw Payload Examples
/// See docs: <https://mexcdevelop.github.io/apidocs/contract_v1_en/#get-contract-trend-data>
/// ```json
/// {
///     "success": true,
///     "code": 0,
///     "data": [
///         {
///             "symbol": "BTC_USDT",
///             "lastPrice": 67123.5,
///             "fairPrice": 67120.1,
///             "volume24": 251234567
///         }
///     ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MexcTickerResponse {
    pub success: bool,
    pub code: i64,
    #[serde(default)]
    pub data: Vec<MexcTicker>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcTicker {
    pub symbol: SmolStr,
    pub last_price: f64,
    pub fair_price: f64,
    #[serde(rename = "volume24", default)]
    pub volume_24h: f64,
}

impl From<MexcTicker> for Snapshot {
    fn from(ticker: MexcTicker) -> Self {
        Snapshot::new(
            ticker.symbol,
            ticker.last_price,
            ticker.fair_price,
            ticker.volume_24h,
        )
    }
}

impl TryFrom<MexcTickerResponse> for Vec<Snapshot> {
    type Error = SplashError;

    fn try_from(response: MexcTickerResponse) -> Result<Self, Self::Error> {
        if !response.success || response.code != 0 {
            return Err(SplashError::Feed(format!(
                "MEXC ticker request rejected with code {}",
                response.code
            )));
        }
        Ok(response.data.into_iter().map(Snapshot::from).collect())
    }
}

/// Polls every MEXC perpetual contract ticker in one request.
#[derive(Debug, Clone)]
pub struct MexcFeed {
    client: Client,
    url: String,
}

impl MexcFeed {
    pub fn new(url: impl Into<String>) -> Result<Self, SplashError> {
        let client = Client::builder().timeout(DEFAULT_REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn with_default_url() -> Result<Self, SplashError> {
        Self::new(MEXC_CONTRACT_TICKER_URL)
    }
}

#[async_trait]
impl FeedSource for MexcFeed {
    async fn poll_tickers(&self) -> Result<Vec<Snapshot>, SplashError> {
        let response = self.client.get(&self.url).send().await?;

        if let Err(status_err) = response.error_for_status_ref() {
            return Err(SplashError::Feed(format!(
                "MEXC ticker poll failed: {status_err}"
            )));
        }

        let body = response.bytes().await?;
        let response = serde_json::from_slice::<MexcTickerResponse>(&body)?;
        Vec::<Snapshot>::try_from(response)
    }
}
