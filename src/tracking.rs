//! Tracking-beacon preparation and dispatch.
//!
//! The session layer calls [`TrackingDispatch::track`] with an event name, the
//! candidate URLs and a macro context; prepared beacons accumulate in an
//! outbox the manager drains and fires. While suppressed, beacons are
//! buffered instead and replayed in order on un-suppress.

use rand::Rng;
use tracing::debug;
use url::Url;

use crate::timecode::timecode_to_string;

/// Values substituted into beacon-URL macros.
#[derive(Debug, Clone, Default)]
pub struct MacroContext {
    /// Content-relative playhead in seconds.
    pub content_playhead: f64,
    pub asset_uri: String,
    /// Observed advert duration in seconds.
    pub actual_duration: f64,
}

/// A beacon with all macros resolved, ready to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBeacon {
    pub event: String,
    pub url: String,
}

/// Seam between the session state machine and beacon transport. The session
/// only prepares beacons; firing them is the manager's concern.
pub trait TrackingDispatch: Send {
    /// Prepare beacons for `event` against each of `urls`.
    fn track(&mut self, event: &str, urls: &[String], ctx: &MacroContext);

    /// Toggle suppression. Turning it off returns the buffered beacons in
    /// arrival order; the caller decides whether to fire them.
    fn set_suppressed(&mut self, suppressed: bool) -> Vec<PreparedBeacon>;

    fn is_suppressed(&self) -> bool;

    /// Queue beacons that were already prepared, e.g. a suppression replay.
    fn enqueue(&mut self, beacons: Vec<PreparedBeacon>);

    /// Drain beacons prepared since the last call.
    fn take_outbox(&mut self) -> Vec<PreparedBeacon>;
}

/// Standard dispatcher: macro substitution, optional https rewrite,
/// suppression buffering.
pub struct BeaconQueue {
    force_https: bool,
    suppressed: bool,
    buffered: Vec<PreparedBeacon>,
    outbox: Vec<PreparedBeacon>,
}

impl Default for BeaconQueue {
    fn default() -> Self {
        Self::new(false)
    }
}

impl BeaconQueue {
    pub fn new(force_https: bool) -> Self {
        Self {
            force_https,
            suppressed: false,
            buffered: Vec::new(),
            outbox: Vec::new(),
        }
    }

    fn prepare(&self, event: &str, url: &str, ctx: &MacroContext) -> PreparedBeacon {
        let mut resolved = url
            .replace("[CONTENTPLAYHEAD]", &timecode_to_string(ctx.content_playhead))
            .replace("[ASSETURI]", &ctx.asset_uri)
            .replace("[ACTUAL_DURATION]", &timecode_to_string(ctx.actual_duration));
        if resolved.contains("[CACHEBUSTING]") {
            let token = format!("{:08}", rand::thread_rng().gen_range(0..100_000_000));
            resolved = resolved.replace("[CACHEBUSTING]", &token);
        }
        if self.force_https {
            resolved = upgrade_scheme(&resolved);
        }
        PreparedBeacon {
            event: event.to_string(),
            url: resolved,
        }
    }
}

fn upgrade_scheme(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.scheme() == "http" => {
            if parsed.set_scheme("https").is_ok() {
                parsed.to_string()
            } else {
                url.to_string()
            }
        }
        _ => url.to_string(),
    }
}

impl TrackingDispatch for BeaconQueue {
    fn track(&mut self, event: &str, urls: &[String], ctx: &MacroContext) {
        for url in urls {
            let beacon = self.prepare(event, url, ctx);
            if self.suppressed {
                debug!(event, url = %beacon.url, "beacon buffered while suppressed");
                self.buffered.push(beacon);
            } else {
                self.outbox.push(beacon);
            }
        }
    }

    fn set_suppressed(&mut self, suppressed: bool) -> Vec<PreparedBeacon> {
        let was = self.suppressed;
        self.suppressed = suppressed;
        if was && !suppressed {
            std::mem::take(&mut self.buffered)
        } else {
            Vec::new()
        }
    }

    fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    fn enqueue(&mut self, beacons: Vec<PreparedBeacon>) {
        if self.suppressed {
            self.buffered.extend(beacons);
        } else {
            self.outbox.extend(beacons);
        }
    }

    fn take_outbox(&mut self) -> Vec<PreparedBeacon> {
        std::mem::take(&mut self.outbox)
    }
}
