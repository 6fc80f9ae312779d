//! Backend contract and its HTTP implementation.
//!
//! Trackers only see the [`Backend`] trait; [`HttpBackend`] speaks either of
//! the two observed route families (see [`Dialect`]) over `reqwest`.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{
    self, PartialStatus, PlantForecastMsg, PumpCommandBody, SoilPumpBody, StatusReading,
};
use crate::config::{BackendSection, Dialect};
use crate::error::TrackerError;
use crate::live::SseDecoder;

pub trait Backend: Send + Sync + 'static {
    /// Current `{pump_on, water_level_percent}` for one plant.
    fn fetch_status(
        &self,
        plant_id: &str,
    ) -> impl Future<Output = Result<StatusReading, TrackerError>> + Send;

    /// Command the pump. `Ok(Some(state))` when the server echoed a state.
    fn command_pump(
        &self,
        plant_id: &str,
        on: bool,
    ) -> impl Future<Output = Result<Option<bool>, TrackerError>> + Send;

    /// Weekly forecast for every plant the backend knows.
    fn fetch_forecast(
        &self,
    ) -> impl Future<Output = Result<Vec<PlantForecastMsg>, TrackerError>> + Send;

    /// Generic soil record, passed through untouched.
    fn soil_reading(&self) -> impl Future<Output = Result<Value, TrackerError>> + Send {
        async {
            Err(TrackerError::Server {
                status: 501,
                body: "soil records not supported".into(),
            })
        }
    }

    /// Store a soil record; returns whatever the backend echoes.
    fn store_soil_reading(
        &self,
        record: &Value,
    ) -> impl Future<Output = Result<Value, TrackerError>> + Send {
        let _ = record;
        async {
            Err(TrackerError::Server {
                status: 501,
                body: "soil records not supported".into(),
            })
        }
    }
}

/// Bound `fut` by `limit`, turning an elapsed deadline into a network error.
pub async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T, TrackerError>
where
    F: Future<Output = Result<T, TrackerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TrackerError::Network(format!(
            "request timed out after {} ms",
            limit.as_millis()
        ))),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    /// No overall timeout: the live stream stays open indefinitely.
    stream_client: reqwest::Client,
    /// Longest silence tolerated between two stream chunks.
    stream_idle: Duration,
    base_url: String,
    forecast_base_url: String,
    dialect: Dialect,
}

impl HttpBackend {
    pub fn new(cfg: &BackendSection) -> Result<Self> {
        let timeout = Duration::from_millis(cfg.request_timeout_ms);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("failed to build streaming http client")?;

        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        let forecast_base_url = cfg
            .forecast_base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| base_url.clone());

        Ok(Self {
            client,
            stream_client,
            stream_idle: Duration::from_millis(cfg.stream_idle_ms),
            base_url,
            forecast_base_url,
            dialect: cfg.dialect,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Follow `GET /soil/stream` until the server closes it, handing every
    /// decodable event to `on_update`. Undecodable events are skipped. A
    /// silent connection (no chunk within `stream_idle`) or an oversized
    /// event ends the stream with an error.
    pub async fn follow_soil_stream<F>(&self, mut on_update: F) -> Result<(), TrackerError>
    where
        F: FnMut(PartialStatus) + Send,
    {
        let mut resp = self
            .stream_client
            .get(self.url("soil/stream"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.bytes().await.unwrap_or_default();
            return Err(TrackerError::Server {
                status,
                body: api::error_message(&body),
            });
        }

        let mut decoder = SseDecoder::default();
        loop {
            let next = async { resp.chunk().await.map_err(TrackerError::from) };
            let Some(chunk) = with_deadline(self.stream_idle, next).await? else {
                break;
            };
            for data in decoder.push(&chunk)? {
                let parsed = serde_json::from_str::<Value>(&data)
                    .map_err(TrackerError::from)
                    .and_then(|v| api::partial_status(&v));
                match parsed {
                    Ok(update) => on_update(update),
                    Err(e) => warn!(kind = e.kind(), "skipping stream event: {e}"),
                }
            }
        }
        debug!("soil stream closed by server");
        Ok(())
    }

    async fn get_json_value(&self, path: &str) -> Result<Value, TrackerError> {
        let body = read_body(self.client.get(self.url(path)).send().await?).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Read a response body, mapping non-2xx statuses to `Server`.
async fn read_body(resp: reqwest::Response) -> Result<Vec<u8>, TrackerError> {
    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        return Err(TrackerError::Server {
            status: status.as_u16(),
            body: api::error_message(&body),
        });
    }
    Ok(body.to_vec())
}

impl Backend for HttpBackend {
    async fn fetch_status(&self, plant_id: &str) -> Result<StatusReading, TrackerError> {
        match self.dialect {
            Dialect::Plants => {
                let resp = self
                    .client
                    .get(self.url(&format!("plants/{plant_id}/status")))
                    .send()
                    .await?;
                api::parse_status(&read_body(resp).await?)
            }
            Dialect::Soil => {
                let (level, pump) = tokio::join!(
                    self.get_json_value("soil/water-level"),
                    self.get_json_value("soil/pump"),
                );
                Ok(StatusReading {
                    water_level_percent: api::water_level_from_value(&level?)?,
                    pump_on: api::pump_from_value(&pump?)?,
                })
            }
        }
    }

    async fn command_pump(&self, plant_id: &str, on: bool) -> Result<Option<bool>, TrackerError> {
        let req = match self.dialect {
            Dialect::Plants => self
                .client
                .put(self.url(&format!("plants/{plant_id}/pump")))
                .json(&PumpCommandBody { state: on }),
            Dialect::Soil => self
                .client
                .post(self.url("soil/pump"))
                .json(&SoilPumpBody { on }),
        };
        let body = read_body(req.send().await?).await?;
        Ok(api::pump_echo(&body))
    }

    async fn fetch_forecast(&self) -> Result<Vec<PlantForecastMsg>, TrackerError> {
        let url = format!("{}/weekly-forecast", self.forecast_base_url);
        let body = read_body(self.client.get(url).send().await?).await?;
        api::parse_forecast(&body)
    }

    async fn soil_reading(&self) -> Result<Value, TrackerError> {
        self.get_json_value("soil").await
    }

    async fn store_soil_reading(&self, record: &Value) -> Result<Value, TrackerError> {
        let resp = self
            .client
            .post(self.url("soil"))
            .json(record)
            .send()
            .await?;
        let body = read_body(resp).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
