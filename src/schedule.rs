//! Ad-schedule data model and the fetch seam.
//!
//! Schedule documents arrive pre-parsed: the engine consumes descriptors, not
//! VMAP/VAST XML. [`HttpScheduleSource`] fetches the raw document over HTTP
//! and hands it to an injected parser.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::net;
use crate::timecode::timecode_from_string;

pub use crate::net::FetchError;

/// Break positions arrive either as plain seconds or as an `HH:MM:SS.mmm`
/// timecode string.
fn position_from_any<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Timecode(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Seconds(seconds) => Ok(seconds),
        Raw::Timecode(value) => timecode_from_string(&value).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid position timecode: {value:?}"))
        }),
    }
}

/// One advert inside a break, as described by the schedule document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertDescriptor {
    /// Stream-level identifier matched against live `YMID` cues.
    pub media_id: String,
    pub advert_id: String,
    pub creative_id: String,
    /// Declared duration in seconds.
    pub duration: f64,
    /// Offset in seconds after which the advert may be skipped, if any.
    pub skip_offset: Option<f64>,
    /// Interactive units manage their own impression/start reporting.
    pub interactive: bool,
    pub asset_uri: String,
    pub clickthrough: Option<String>,
    pub impressions: Vec<String>,
    /// Tracking-event name → beacon URLs.
    pub tracking: HashMap<String, Vec<String>>,
}

/// One ad break, positioned on the content timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdBreakDescriptor {
    pub id: String,
    /// e.g. `"linear"` / `"nonlinear"`.
    pub break_type: String,
    /// Start position in content seconds. Accepts an `HH:MM:SS.mmm` string
    /// on deserialization.
    #[serde(deserialize_with = "position_from_any")]
    pub position: f64,
    pub adverts: Vec<AdvertDescriptor>,
    /// Break-level tracking (breakStart / breakEnd).
    pub tracking: HashMap<String, Vec<String>>,
}

impl AdBreakDescriptor {
    pub fn duration(&self) -> f64 {
        self.adverts.iter().map(|a| a.duration).sum()
    }
}

/// Stream-level fields carried alongside the breaks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub playback_url: Option<String>,
    /// Total stream duration in seconds, when the document declares one.
    pub total_duration: Option<f64>,
    /// DVR window bounds, present on live-pause schedule responses.
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

/// A parsed schedule response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDocument {
    pub breaks: Vec<AdBreakDescriptor>,
    pub stream: StreamInfo,
}

/// Seam between the engine and schedule retrieval. The session polls this;
/// tests substitute canned documents.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ScheduleDocument, FetchError>;
}

/// Parser injected into [`HttpScheduleSource`]: raw response body →
/// structured document.
pub type ScheduleParser =
    Arc<dyn Fn(&str) -> Result<ScheduleDocument, FetchError> + Send + Sync>;

/// Fetches schedule documents over HTTP with the configured retry policy and
/// runs them through an injected parser.
pub struct HttpScheduleSource {
    client: reqwest::Client,
    config: SessionConfig,
    parser: ScheduleParser,
}

impl HttpScheduleSource {
    pub fn new(config: SessionConfig, parser: ScheduleParser) -> Self {
        let client = net::build_client(&config);
        Self {
            client,
            config,
            parser,
        }
    }

    /// JSON-document parser for sources that serve [`ScheduleDocument`]
    /// directly.
    pub fn json(config: SessionConfig) -> Self {
        Self::new(
            config,
            Arc::new(|body: &str| {
                serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))
            }),
        )
    }
}

#[async_trait]
impl ScheduleSource for HttpScheduleSource {
    async fn fetch(&self, url: &str) -> Result<ScheduleDocument, FetchError> {
        let body = net::fetch_text(&self.client, url, &self.config).await?;
        (self.parser)(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn one_break_doc() -> ScheduleDocument {
        ScheduleDocument {
            breaks: vec![AdBreakDescriptor {
                id: "break-1".to_string(),
                break_type: "linear".to_string(),
                position: 30.0,
                adverts: vec![AdvertDescriptor {
                    media_id: "media-1".to_string(),
                    advert_id: "ad-1".to_string(),
                    creative_id: "creative-1".to_string(),
                    duration: 15.0,
                    skip_offset: Some(5.0),
                    interactive: false,
                    asset_uri: "https://cdn.example.com/ad-1.ts".to_string(),
                    clickthrough: None,
                    impressions: vec!["https://track.example.com/imp".to_string()],
                    tracking: HashMap::new(),
                }],
                tracking: HashMap::new(),
            }],
            stream: StreamInfo::default(),
        }
    }

    #[test]
    fn break_duration_sums_adverts() {
        let mut doc = one_break_doc();
        let template = doc.breaks[0].adverts[0].clone();
        doc.breaks[0].adverts.push(AdvertDescriptor {
            duration: 10.0,
            ..template
        });
        assert_eq!(doc.breaks[0].duration(), 25.0);
    }

    #[test]
    fn break_position_accepts_timecode_strings() {
        let body = r#"{
            "id": "break-1",
            "break_type": "linear",
            "position": "00:01:30.500",
            "adverts": [],
            "tracking": {}
        }"#;
        let parsed: AdBreakDescriptor = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.position, 90.5);

        let plain: AdBreakDescriptor =
            serde_json::from_str(&body.replace("\"00:01:30.500\"", "90.5")).unwrap();
        assert_eq!(plain.position, 90.5);

        assert!(serde_json::from_str::<AdBreakDescriptor>(
            &body.replace("00:01:30.500", "one minute in")
        )
        .is_err());
    }

    #[tokio::test]
    async fn json_source_round_trips_document() {
        let doc = one_break_doc();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schedule"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(serde_json::to_string(&doc).unwrap()),
            )
            .mount(&server)
            .await;

        let source = HttpScheduleSource::json(SessionConfig::default());
        let fetched = source
            .fetch(&format!("{}/schedule", server.uri()))
            .await
            .unwrap();
        assert_eq!(fetched, doc);
    }

    #[tokio::test]
    async fn malformed_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schedule"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not json>"))
            .mount(&server)
            .await;

        let source = HttpScheduleSource::json(SessionConfig {
            fetch_attempts: 1,
            ..SessionConfig::default()
        });
        let err = source
            .fetch(&format!("{}/schedule", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }
}
