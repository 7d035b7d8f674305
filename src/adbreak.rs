//! Ad breaks, adverts and their tracking lifecycle.
//!
//! Breaks live in a [`BreakPool`] arena owned by the session; the timeline
//! and the current-advert handle refer to them by [`BreakKey`] /
//! [`AdvertKey`], which sidesteps any shared ownership between the timeline
//! and the session state machine.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::schedule::{AdBreakDescriptor, AdvertDescriptor};
use crate::tracking::{MacroContext, TrackingDispatch};

/// Stable handle to a break slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakKey(usize);

/// Handle to one advert inside a pooled break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertKey {
    pub break_key: BreakKey,
    pub index: usize,
}

/// Arena of ad breaks. Slots are reused after release; keys are only valid
/// until their slot is released.
#[derive(Default)]
pub struct BreakPool {
    slots: Vec<Option<AdBreak>>,
}

impl BreakPool {
    pub fn insert(&mut self, ad_break: AdBreak) -> BreakKey {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            self.slots[free] = Some(ad_break);
            BreakKey(free)
        } else {
            self.slots.push(Some(ad_break));
            BreakKey(self.slots.len() - 1)
        }
    }

    pub fn get(&self, key: BreakKey) -> Option<&AdBreak> {
        self.slots.get(key.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, key: BreakKey) -> Option<&mut AdBreak> {
        self.slots.get_mut(key.0).and_then(Option::as_mut)
    }

    pub fn release(&mut self, key: BreakKey) -> Option<AdBreak> {
        self.slots.get_mut(key.0).and_then(Option::take)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn advert(&self, key: AdvertKey) -> Option<&Advert> {
        self.get(key.break_key).and_then(|b| b.adverts.get(key.index))
    }

    pub fn advert_mut(&mut self, key: AdvertKey) -> Option<&mut Advert> {
        self.get_mut(key.break_key)
            .and_then(|b| b.adverts.get_mut(key.index))
    }
}

/// A quartile threshold crossed during a watchdog ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuartileEvent {
    pub name: &'static str,
    /// 25, 50 or 75.
    pub progress: u8,
    pub asset: String,
}

pub struct AdBreak {
    pub id: String,
    /// Break type from the schedule (`"linear"` / `"nonlinear"`).
    pub description: String,
    /// Start position in content seconds. Mutable: live-window trimming may
    /// slide a partially-consumed break to the new window origin.
    pub start_position: f64,
    pub adverts: Vec<Advert>,
    /// Break-level tracking (breakStart / breakEnd).
    pub tracking: HashMap<String, Vec<String>>,
}

impl AdBreak {
    pub fn from_descriptor(descriptor: &AdBreakDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            description: descriptor.break_type.clone(),
            start_position: descriptor.position,
            adverts: descriptor.adverts.iter().map(Advert::new).collect(),
            tracking: descriptor.tracking.clone(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.adverts.iter().map(|a| a.duration).sum()
    }

    /// A break with at least one active advert still participates in seek
    /// snapping and skip policy.
    pub fn is_active(&self) -> bool {
        self.adverts.iter().any(|a| a.active)
    }

    /// Index of the advert covering `position` (content seconds), walking
    /// the adverts from the break start.
    pub fn advert_index_for_position(&self, position: f64) -> Option<usize> {
        let mut offset = self.start_position;
        for (index, advert) in self.adverts.iter().enumerate() {
            if position >= offset && position < offset + advert.duration {
                return Some(index);
            }
            offset += advert.duration;
        }
        None
    }

    /// Content offset at which advert `index` begins.
    pub fn advert_offset(&self, index: usize) -> f64 {
        self.start_position
            + self.adverts[..index.min(self.adverts.len())]
                .iter()
                .map(|a| a.duration)
                .sum::<f64>()
    }
}

pub struct Advert {
    pub descriptor: AdvertDescriptor,
    /// Observed duration; starts at the declared value, may be truncated by
    /// live reconciliation.
    pub duration: f64,
    /// Adverts are born active and deactivate exactly once.
    pub active: bool,
    paused: bool,
    started_at: Option<Instant>,
    already_elapsed: f64,
    /// Highest tracking point fired: 0 none, 2 firstQuartile, 3 midpoint,
    /// 4 thirdQuartile.
    quartile: u8,
    impression_sent: bool,
    /// Armed for the advert's duration on playout start and each ping.
    /// Diagnostic only; expiry never mutates advert state.
    watchdog_deadline: Option<Instant>,
}

impl Advert {
    pub fn new(descriptor: &AdvertDescriptor) -> Self {
        Self {
            descriptor: descriptor.clone(),
            duration: descriptor.duration,
            active: true,
            paused: false,
            started_at: None,
            already_elapsed: 0.0,
            quartile: 0,
            impression_sent: false,
            watchdog_deadline: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Seconds of this advert actually played out.
    pub fn time_elapsed(&self, now: Instant) -> f64 {
        let running = match self.started_at {
            Some(at) if !self.paused => now.duration_since(at).as_secs_f64(),
            _ => 0.0,
        };
        self.already_elapsed + running
    }

    /// True once the diagnostic watchdog deadline has passed without a ping.
    pub fn watchdog_expired(&self, now: Instant) -> bool {
        matches!(self.watchdog_deadline, Some(deadline) if now >= deadline)
    }

    pub fn clear_watchdog(&mut self) {
        self.watchdog_deadline = None;
    }

    /// Prepare beacons for `event`. Impressions are prepended exactly once,
    /// ahead of the first `creativeView`.
    pub fn invoke_tracking(
        &mut self,
        event: &str,
        content_playhead: f64,
        dispatch: &mut dyn TrackingDispatch,
    ) {
        let ctx = MacroContext {
            content_playhead,
            asset_uri: self.descriptor.asset_uri.clone(),
            actual_duration: self.duration,
        };
        if event == "creativeView" && !self.impression_sent {
            self.impression_sent = true;
            let impressions = self.descriptor.impressions.clone();
            dispatch.track("impression", &impressions, &ctx);
        }
        if let Some(urls) = self.descriptor.tracking.get(event) {
            let urls = urls.clone();
            dispatch.track(event, &urls, &ctx);
        }
    }

    /// Start the playout clock: resets progress counters, arms the watchdog
    /// for the advert's duration and, while the advert is still active and
    /// not interactive, fires `creativeView` + `start` (interactive units
    /// report their own start). A second call while the clock already runs
    /// is a no-op.
    pub fn begin_playout(
        &mut self,
        now: Instant,
        content_playhead: f64,
        dispatch: &mut dyn TrackingDispatch,
    ) {
        if self.started_at.is_some() {
            return;
        }
        self.paused = false;
        self.quartile = 0;
        self.already_elapsed = 0.0;
        self.started_at = Some(now);
        self.watchdog_deadline = Some(now + Duration::from_secs_f64(self.duration));
        if self.active && !self.descriptor.interactive {
            self.invoke_tracking("creativeView", content_playhead, dispatch);
            self.invoke_tracking("start", content_playhead, dispatch);
        }
    }

    /// One-way deactivation: fires `complete` when every quartile was seen
    /// and playback is not paused, then stops the clock. A deactivated
    /// advert never becomes active again.
    pub fn deactivate(&mut self, content_playhead: f64, dispatch: &mut dyn TrackingDispatch) {
        self.started_at = None;
        self.watchdog_deadline = None;
        if !self.active {
            return;
        }
        self.active = false;
        if self.quartile >= 4 && !self.paused {
            self.invoke_tracking("complete", content_playhead, dispatch);
        }
    }

    /// Progress ping: re-arms the watchdog and fires any quartile thresholds
    /// newly crossed, each exactly once, in order.
    pub fn ping_watchdog(
        &mut self,
        now: Instant,
        content_playhead: f64,
        dispatch: &mut dyn TrackingDispatch,
    ) -> Vec<QuartileEvent> {
        if !self.active {
            return Vec::new();
        }
        self.watchdog_deadline = Some(now + Duration::from_secs_f64(self.duration));
        if self.paused {
            return Vec::new();
        }

        let elapsed = self.time_elapsed(now);
        let duration = self.duration;
        let mut fired = Vec::new();
        let thresholds: [(u8, &'static str, u8, f64); 3] = [
            (2, "firstQuartile", 25, duration / 4.0),
            (3, "midpoint", 50, duration / 2.0),
            (4, "thirdQuartile", 75, duration * 3.0 / 4.0),
        ];
        for (point, name, progress, at) in thresholds {
            if self.quartile < point && elapsed > at {
                self.quartile = point;
                self.invoke_tracking(name, content_playhead, dispatch);
                fired.push(QuartileEvent {
                    name,
                    progress,
                    asset: self.descriptor.asset_uri.clone(),
                });
            }
        }
        fired
    }

    /// Freeze elapsed time. The watchdog stays armed via pings so a stalled
    /// pause still surfaces diagnostics.
    pub fn ad_paused(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        self.already_elapsed = self.time_elapsed(now);
        self.started_at = None;
        self.paused = true;
    }

    pub fn ad_resumed(&mut self, now: Instant) {
        if !self.paused {
            return;
        }
        self.started_at = Some(now);
        self.paused = false;
    }

    /// Re-anchor the running clock to an earlier instant. Used when a live
    /// start cue was buffered before schedule data arrived.
    pub fn backdate_start(&mut self, at: Instant) {
        if self.started_at.is_some() {
            self.started_at = Some(at);
        }
    }

    /// Shorten the observed duration, e.g. when a live break ends early.
    pub fn truncate(&mut self, duration: f64) {
        if duration >= 0.0 && duration < self.duration {
            self.duration = duration;
        }
    }
}
