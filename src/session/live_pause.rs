//! Live session with DVR pause support: the schedule carries the DVR
//! window's programme-date-time bounds, and the timeline is trimmed as the
//! window slides. While paused, a beacon is due on the stream's live-pause
//! endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::SessionConfig;
use crate::schedule::ScheduleDocument;
use crate::session::core::TimelineStyle;
use crate::session::{Session, SessionCore, SessionKind};
use crate::tracking::TrackingDispatch;

pub struct LivePauseSession {
    core: SessionCore,
    /// Programme date of the stream origin; fixed at the first poll.
    stream_start: Option<DateTime<Utc>>,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
}

impl LivePauseSession {
    pub fn new(
        config: SessionConfig,
        source_url: String,
        tracking: Box<dyn TrackingDispatch>,
    ) -> Self {
        Self {
            core: SessionCore::new(SessionKind::LivePause, config, source_url, tracking),
            stream_start: None,
            window_start: None,
            window_end: None,
        }
    }

    /// Seconds between the stream origin and the current window start; the
    /// amount the timeline origin has slid.
    fn window_offset(&self) -> f64 {
        match (self.stream_start, self.window_start) {
            (Some(origin), Some(start)) => {
                ((start - origin).num_milliseconds() as f64 / 1000.0).max(0.0)
            }
            _ => 0.0,
        }
    }

    /// Window span in stream seconds, measured from the stream origin.
    fn window_extent(&self) -> Option<f64> {
        let origin = self.stream_start?;
        let end = self.window_end?;
        Some((end - origin).num_milliseconds() as f64 / 1000.0)
    }

    pub fn dvr_window(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.window_start, self.window_end)
    }
}

impl Session for LivePauseSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn update_position(&mut self, position: f64, now: Instant) {
        self.core
            .update_position_on_timeline(position, now, TimelineStyle::LivePause);
    }

    fn apply_schedule(&mut self, document: &ScheduleDocument, _now: Instant) {
        if let Some(start) = document.stream.window_start {
            if self.stream_start.is_none() {
                self.stream_start = Some(start);
            }
            self.window_start = Some(start);
        }
        if let Some(end) = document.stream.window_end {
            self.window_end = Some(end);
        }

        // Break positions are relative to the stream origin; rebuild there,
        // then slide the origin to the current window start.
        let total = self.window_extent().or(document.stream.total_duration);
        let mut changed = self.core.rebuild_from_breaks(&document.breaks, total);
        let offset = self.window_offset();
        if offset > 0.0 {
            self.core.timeline.update_offset(offset, &mut self.core.pool);
            if self.core.timeline.take_modified() {
                changed = true;
            }
            // A handle into a trimmed-out break is stale.
            if let Some(key) = self.core.current_advert {
                if self.core.pool.advert(key).is_none() {
                    self.core.current_advert = None;
                }
            }
            if let Some(key) = self.core.current_break {
                if self.core.pool.get(key).is_none() {
                    self.core.current_break = None;
                    self.core.stop_break_end_timer();
                }
            }
        }
        if changed {
            debug!(offset, "live window slid; timeline updated");
            self.core.emit_timeline();
        }
        if self.core.is_paused {
            self.core.live_pause_ping_requested = true;
        }
    }
}
