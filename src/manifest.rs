//! Extraction of the two ad-management endpoints embedded in a master
//! manifest. Nothing else of HLS or DASH is interpreted here.

const ANALYTICS_TOKEN: &str = "#EXT-X-YOSPACE-ANALYTICS-URL";
const PAUSE_TOKEN: &str = "#EXT-X-YOSPACE-PAUSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Hls,
    Dash,
}

/// Endpoints found in a fetched master manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestUrls {
    pub analytics_url: Option<String>,
    pub live_pause_url: Option<String>,
    pub stream_type: Option<StreamType>,
}

impl ManifestUrls {
    pub fn is_managed(&self) -> bool {
        self.analytics_url.is_some()
    }
}

/// Scan a manifest body for the analytics and live-pause endpoints.
///
/// HLS carries them as dedicated tags; DASH as `analytics` / `livepause`
/// attributes on the root `<MPD>` element. Bodies that are neither yield an
/// empty result rather than an error — an unmanaged stream is a valid state.
pub fn extract_endpoints(body: &str) -> ManifestUrls {
    let trimmed = body.trim_start();
    if trimmed.starts_with("#EXTM3U") || trimmed.starts_with(ANALYTICS_TOKEN) {
        extract_hls(body)
    } else if trimmed.starts_with('<') {
        extract_dash(body)
    } else {
        ManifestUrls::default()
    }
}

fn extract_hls(body: &str) -> ManifestUrls {
    let mut urls = ManifestUrls {
        stream_type: Some(StreamType::Hls),
        ..ManifestUrls::default()
    };
    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(ANALYTICS_TOKEN) {
            urls.analytics_url = tag_value(rest);
        } else if let Some(rest) = line.strip_prefix(PAUSE_TOKEN) {
            urls.live_pause_url = tag_value(rest);
        }
    }
    urls
}

/// Strip the `:` separator and any surrounding quotes from a tag value.
fn tag_value(rest: &str) -> Option<String> {
    let value = rest.strip_prefix(':')?.trim().trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn extract_dash(body: &str) -> ManifestUrls {
    let mut urls = ManifestUrls {
        stream_type: Some(StreamType::Dash),
        ..ManifestUrls::default()
    };
    // Only the root <MPD ...> element is inspected.
    let Some(start) = body.find("<MPD") else {
        return urls;
    };
    let Some(end) = body[start..].find('>') else {
        return urls;
    };
    let element = &body[start..start + end];
    urls.analytics_url = attr_value(element, "analytics");
    urls.live_pause_url = attr_value(element, "livepause");
    urls
}

fn attr_value(element: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let at = element.find(&needle)? + needle.len();
    let rest = &element[at..];
    let end = rest.find('"')?;
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hls_with_both_endpoints() {
        let body = "#EXTM3U\n\
                    #EXT-X-YOSPACE-ANALYTICS-URL:\"https://analytics.example.com/session\"\n\
                    #EXT-X-YOSPACE-PAUSE:https://pause.example.com/ping\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=800000\n\
                    level1.m3u8\n";
        let urls = extract_endpoints(body);
        assert_eq!(urls.stream_type, Some(StreamType::Hls));
        assert_eq!(
            urls.analytics_url.as_deref(),
            Some("https://analytics.example.com/session")
        );
        assert_eq!(
            urls.live_pause_url.as_deref(),
            Some("https://pause.example.com/ping")
        );
        assert!(urls.is_managed());
    }

    #[test]
    fn hls_without_tags_is_unmanaged() {
        let body = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlevel1.m3u8\n";
        let urls = extract_endpoints(body);
        assert_eq!(urls.stream_type, Some(StreamType::Hls));
        assert!(!urls.is_managed());
    }

    #[test]
    fn dash_attributes_on_mpd_root() {
        let body = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" analytics="https://analytics.example.com/s" livepause="https://pause.example.com/p" type="dynamic">
  <Period/>
</MPD>"#;
        let urls = extract_endpoints(body);
        assert_eq!(urls.stream_type, Some(StreamType::Dash));
        assert_eq!(
            urls.analytics_url.as_deref(),
            Some("https://analytics.example.com/s")
        );
        assert_eq!(
            urls.live_pause_url.as_deref(),
            Some("https://pause.example.com/p")
        );
    }

    #[test]
    fn unrecognised_body_yields_empty() {
        let urls = extract_endpoints("just some text");
        assert_eq!(urls, ManifestUrls::default());
    }

    #[test]
    fn empty_tag_value_is_none() {
        let body = "#EXTM3U\n#EXT-X-YOSPACE-ANALYTICS-URL:\"\"\n";
        let urls = extract_endpoints(body);
        assert!(urls.analytics_url.is_none());
    }
}
