//! State shared by all session variants: the timeline, the break pool, the
//! current advert/break handles, missed-break bookkeeping, suppression and
//! the deadline-based timers.
//!
//! Everything here is synchronous and takes the current instant explicitly,
//! so the whole state machine is deterministic under test; the manager's
//! async loop supplies real time.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::adbreak::{AdBreak, AdvertKey, BreakKey, BreakPool};
use crate::schedule::AdBreakDescriptor;
use crate::config::SessionConfig;
use crate::manifest::{ManifestUrls, StreamType};
use crate::session::{BreakInfo, SessionEvent, SessionKind, TimelineEntry};
use crate::timeline::Timeline;
use crate::tracking::{MacroContext, TrackingDispatch};

const POSITION_EPSILON: f64 = 0.001;

/// A break the player never entered (seeked past, or carried no adverts).
/// Its start and end beacons fire together, once, when the playhead crosses
/// its position.
struct MissedBreak {
    info: BreakInfo,
    tracking: HashMap<String, Vec<String>>,
    fired: bool,
}

/// Position-update flavours shared by the non-pure-live variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineStyle {
    Vod,
    LivePause,
}

pub struct SessionCore {
    pub config: SessionConfig,
    pub kind: SessionKind,
    /// The source URL the session was created for.
    pub source_url: String,
    pub analytics_url: Option<String>,
    pub live_pause_url: Option<String>,
    pub stream_type: Option<StreamType>,
    pub timeline: Timeline,
    pub pool: BreakPool,
    pub current_advert: Option<AdvertKey>,
    pub current_break: Option<BreakKey>,
    break_end_deadline: Option<Instant>,
    pub last_position: f64,
    pub is_playing: bool,
    pub is_paused: bool,
    missed_breaks: Vec<MissedBreak>,
    pub tracking: Box<dyn TrackingDispatch>,
    pending: Vec<SessionEvent>,
    /// The session wants an immediate out-of-band analytics poll.
    pub poll_requested: bool,
    /// Live-pause variant: a ping to the live-pause URL is due.
    pub live_pause_ping_requested: bool,
}

impl SessionCore {
    pub fn new(
        kind: SessionKind,
        config: SessionConfig,
        source_url: String,
        tracking: Box<dyn TrackingDispatch>,
    ) -> Self {
        Self {
            config,
            kind,
            source_url,
            analytics_url: None,
            live_pause_url: None,
            stream_type: None,
            timeline: Timeline::new(),
            pool: BreakPool::default(),
            current_advert: None,
            current_break: None,
            break_end_deadline: None,
            last_position: 0.0,
            is_playing: false,
            is_paused: false,
            missed_breaks: Vec::new(),
            tracking,
            pending: Vec::new(),
            poll_requested: false,
            live_pause_ping_requested: false,
        }
    }

    pub fn apply_manifest(&mut self, urls: &ManifestUrls) {
        self.analytics_url = urls.analytics_url.clone();
        self.live_pause_url = urls.live_pause_url.clone();
        self.stream_type = urls.stream_type;
    }

    /// Analytics endpoint present, or a VOD timeline that carries more than
    /// a single content run.
    pub fn is_managed_stream(&self) -> bool {
        self.analytics_url.is_some()
            || (matches!(self.kind, SessionKind::Vod { .. })
                && self.timeline.all_elements().len() > 1)
    }

    pub fn push_event(&mut self, event: SessionEvent) {
        self.pending.push(event);
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_in_advert(&self) -> bool {
        self.current_advert.is_some()
    }

    /// True while the playhead sits in an advert that is still active.
    pub fn is_in_active_advert(&self) -> bool {
        self.current_advert
            .and_then(|key| self.pool.advert(key))
            .is_some_and(|a| a.active)
    }

    /// The break relevant to the current position. Live sessions track it
    /// directly (their timeline carries no advert ranges); the timeline
    /// variants derive it from the playhead.
    pub fn current_break_key(&self) -> Option<BreakKey> {
        match self.kind {
            SessionKind::Live => self.current_break,
            _ => self
                .current_break
                .or_else(|| self.timeline.element_at(self.last_position)?.break_key()),
        }
    }

    pub fn break_info(&self, key: BreakKey) -> Option<BreakInfo> {
        let ad_break = self.pool.get(key)?;
        Some(BreakInfo {
            id: ad_break.id.clone(),
            description: ad_break.description.clone(),
            start_position: ad_break.start_position,
            duration: ad_break.duration(),
        })
    }

    pub fn timeline_snapshot(&self) -> Vec<TimelineEntry> {
        self.timeline
            .all_elements()
            .iter()
            .map(|e| TimelineEntry {
                offset: e.offset,
                duration: e.duration,
                is_advert: e.is_advert(),
            })
            .collect()
    }

    pub fn emit_timeline(&mut self) {
        let snapshot = self.timeline_snapshot();
        self.pending.push(SessionEvent::TimelineUpdated(snapshot));
    }

    // --- missed breaks ---------------------------------------------------

    /// Register a break the player will never enter. Kept ordered by start
    /// position; a second break at the same position is ignored.
    pub fn add_missed_break(&mut self, info: BreakInfo, tracking: HashMap<String, Vec<String>>) {
        if self
            .missed_breaks
            .iter()
            .any(|mb| (mb.info.start_position - info.start_position).abs() < POSITION_EPSILON)
        {
            return;
        }
        let at = self
            .missed_breaks
            .partition_point(|mb| mb.info.start_position < info.start_position);
        self.missed_breaks.insert(
            at,
            MissedBreak {
                info,
                tracking,
                fired: false,
            },
        );
    }

    /// Fire start+end for any missed break the playhead just crossed. Each
    /// fires at most once, regardless of later re-crossings.
    fn fire_missed_breaks(&mut self, prev: f64, position: f64) {
        let SessionCore {
            missed_breaks,
            tracking,
            pending,
            ..
        } = self;
        for missed in missed_breaks.iter_mut() {
            let start = missed.info.start_position;
            if missed.fired || !(prev <= start && position > start) {
                continue;
            }
            missed.fired = true;
            debug!(break_id = %missed.info.id, start, "firing missed break");
            let ctx = MacroContext {
                content_playhead: start,
                asset_uri: String::new(),
                actual_duration: missed.info.duration,
            };
            for event in ["breakStart", "breakEnd"] {
                if let Some(urls) = missed.tracking.get(event) {
                    tracking.track(event, urls, &ctx);
                }
            }
            pending.push(SessionEvent::AdBreakStart(missed.info.clone()));
            pending.push(SessionEvent::AdBreakEnd(missed.info.clone()));
        }
    }

    // --- suppression -----------------------------------------------------

    pub fn analytics_suppressed(&self) -> bool {
        self.tracking.is_suppressed()
    }

    /// Toggle beacon suppression. Un-suppressing replays the buffered
    /// beacons in order, re-arms the active advert's watchdog and, on live
    /// variants, restarts the break-end timer.
    pub fn suppress_analytics(&mut self, suppressed: bool, now: Instant) {
        if suppressed == self.tracking.is_suppressed() {
            return;
        }
        if suppressed {
            self.tracking.set_suppressed(true);
            return;
        }
        let replay = self.tracking.set_suppressed(false);
        for beacon in &replay {
            self.pending.push(SessionEvent::AnalyticsFired {
                event: beacon.event.clone(),
                progress: 0,
                asset: String::new(),
            });
        }
        self.tracking.enqueue(replay);
        self.ping_current_advert(now);
        if self.kind.is_live() && self.current_break.is_some() {
            self.start_break_end_timer(now);
        }
    }

    // --- timers ----------------------------------------------------------

    pub fn start_break_end_timer(&mut self, now: Instant) {
        self.break_end_deadline = Some(now + self.config.break_tolerance);
    }

    pub fn stop_break_end_timer(&mut self) {
        self.break_end_deadline = None;
    }

    pub fn break_end_timer_running(&self) -> bool {
        self.break_end_deadline.is_some()
    }

    /// Sweep the deadline timers. Returns true when the break-end timer
    /// expired and the open break was closed.
    pub fn check_timers(&mut self, now: Instant) -> bool {
        if let Some(key) = self.current_advert {
            let expired = self
                .pool
                .advert(key)
                .is_some_and(|a| a.watchdog_expired(now));
            if expired {
                let advert_id = self
                    .pool
                    .advert(key)
                    .map(|a| a.descriptor.advert_id.clone())
                    .unwrap_or_default();
                warn!(%advert_id, "advert watchdog expired without a position ping");
                if let Some(advert) = self.pool.advert_mut(key) {
                    advert.clear_watchdog();
                }
                self.pending.push(SessionEvent::WatchdogTimeout(advert_id));
            }
        }

        if matches!(self.break_end_deadline, Some(deadline) if now >= deadline) {
            debug!("break-end tolerance elapsed without a sustaining cue");
            self.handle_break_end();
            return true;
        }
        false
    }

    // --- advert / break transitions --------------------------------------

    /// Fire the break-level beacons for `event`.
    fn track_break_event(&mut self, key: BreakKey, event: &str) {
        let playhead = self.last_position;
        let SessionCore { pool, tracking, .. } = self;
        if let Some(ad_break) = pool.get(key) {
            if let Some(urls) = ad_break.tracking.get(event) {
                let ctx = MacroContext {
                    content_playhead: playhead,
                    asset_uri: String::new(),
                    actual_duration: ad_break.duration(),
                };
                tracking.track(event, urls, &ctx);
            }
        }
    }

    /// Open `key` as the current break: breakStart beacons, player event,
    /// and the break-end tolerance timer on live variants.
    pub fn handle_break_start(&mut self, key: BreakKey, now: Instant) {
        if self.current_break == Some(key) {
            return;
        }
        let Some(info) = self.break_info(key) else {
            return;
        };
        self.track_break_event(key, "breakStart");
        self.current_break = Some(key);
        self.pending.push(SessionEvent::AdBreakStart(info));
        if self.kind.is_live() {
            self.start_break_end_timer(now);
        }
    }

    /// Close the open break (ending its advert first) and stop the timer.
    pub fn handle_break_end(&mut self) {
        self.end_current_advert();
        self.stop_break_end_timer();
        let Some(key) = self.current_break.take() else {
            return;
        };
        self.track_break_event(key, "breakEnd");
        if let Some(info) = self.break_info(key) {
            self.pending.push(SessionEvent::AdBreakEnd(info));
        }
    }

    /// Deactivate and clear the current advert. Returns the break it
    /// belonged to.
    pub fn end_current_advert(&mut self) -> Option<BreakKey> {
        let key = self.current_advert.take()?;
        let playhead = self.last_position;
        let SessionCore { pool, tracking, pending, .. } = self;
        if let Some(advert) = pool.advert_mut(key) {
            advert.deactivate(playhead, tracking.as_mut());
            pending.push(SessionEvent::AdvertEnd(advert.descriptor.advert_id.clone()));
        }
        Some(key.break_key)
    }

    /// Start playout of the current advert handle: entry beacons + player
    /// event.
    pub fn activate_current(&mut self, now: Instant) {
        let Some(key) = self.current_advert else {
            return;
        };
        let playhead = self.last_position;
        let SessionCore { pool, tracking, pending, .. } = self;
        if let Some(advert) = pool.advert_mut(key) {
            advert.begin_playout(now, playhead, tracking.as_mut());
            pending.push(SessionEvent::AdvertStart(advert.descriptor.advert_id.clone()));
        }
    }

    /// Progress ping on the current advert; surfaces crossed quartiles.
    pub fn ping_current_advert(&mut self, now: Instant) {
        let Some(key) = self.current_advert else {
            return;
        };
        let playhead = self.last_position;
        let SessionCore { pool, tracking, pending, .. } = self;
        if let Some(advert) = pool.advert_mut(key) {
            for quartile in advert.ping_watchdog(now, playhead, tracking.as_mut()) {
                pending.push(SessionEvent::AnalyticsFired {
                    event: quartile.name.to_string(),
                    progress: quartile.progress,
                    asset: quartile.asset,
                });
            }
        }
    }

    /// Fire a tracking event against the current advert (click, mute, …).
    pub fn invoke_current_tracking(&mut self, event: &str) {
        let Some(key) = self.current_advert else {
            return;
        };
        let playhead = self.last_position;
        let SessionCore { pool, tracking, .. } = self;
        if let Some(advert) = pool.advert_mut(key) {
            advert.invoke_tracking(event, playhead, tracking.as_mut());
        }
    }

    /// Tracking event against advert `index` of the current break (used for
    /// non-linear creatives, which may fire outside the linear advert).
    pub fn invoke_break_tracking(&mut self, index: usize, event: &str) {
        let Some(break_key) = self.current_break_key() else {
            return;
        };
        let playhead = self.last_position;
        let SessionCore { pool, tracking, .. } = self;
        if let Some(ad_break) = pool.get_mut(break_key) {
            if let Some(advert) = ad_break.adverts.get_mut(index) {
                advert.invoke_tracking(event, playhead, tracking.as_mut());
            }
        }
    }

    /// Clickthrough URL of the advert currently playing, if any.
    pub fn linear_clickthrough(&self) -> Option<String> {
        let advert = self.pool.advert(self.current_advert?)?;
        advert.descriptor.clickthrough.clone()
    }

    /// Deactivate every advert of `key` without firing completion beacons
    /// for unwatched progress (used when a seek jumps a break).
    pub fn deactivate_break(&mut self, key: BreakKey) {
        let playhead = self.last_position;
        let SessionCore { pool, tracking, .. } = self;
        if let Some(ad_break) = pool.get_mut(key) {
            for advert in &mut ad_break.adverts {
                advert.deactivate(playhead, tracking.as_mut());
            }
        }
    }

    // --- playback state ---------------------------------------------------

    /// Pause bookkeeping. `user` distinguishes a user pause from a buffering
    /// stall: a stall freezes the advert clock without the `pause` beacon and
    /// without marking the session paused.
    pub fn pause_playback(&mut self, now: Instant, user: bool) {
        // A pause before the first play tick still marks the stream as
        // having started, matching player-reported state.
        if !self.is_playing {
            self.is_playing = true;
        }
        if user {
            self.is_paused = true;
        }
        let playhead = self.last_position;
        let SessionCore { pool, tracking, current_advert, .. } = self;
        if let Some(key) = *current_advert {
            if let Some(advert) = pool.advert_mut(key) {
                advert.ad_paused(now);
                if user {
                    advert.invoke_tracking("pause", playhead, tracking.as_mut());
                }
            }
        }
    }

    pub fn resume_playback(&mut self, now: Instant, user: bool) {
        self.is_paused = false;
        self.is_playing = true;
        let playhead = self.last_position;
        let SessionCore { pool, tracking, current_advert, .. } = self;
        if let Some(key) = *current_advert {
            if let Some(advert) = pool.advert_mut(key) {
                advert.ad_resumed(now);
                if user {
                    advert.invoke_tracking("resume", playhead, tracking.as_mut());
                }
            }
        }
    }

    /// Poll cadence: tight while an advert plays, relaxed otherwise.
    pub fn poll_interval(&self) -> Duration {
        if self.is_in_advert() {
            self.config.high_freq
        } else {
            self.config.low_freq
        }
    }

    // --- timeline rebuild -------------------------------------------------

    /// Rebuild the timeline from a fresh set of break descriptors.
    ///
    /// A break whose id matches and whose pooled range is either identical to
    /// the descriptor or a head-trimmed tail of it (a live window slid over
    /// its start) keeps its pooled state (active flags, fired quartiles)
    /// across polls; anything else is replaced. Breaks without adverts become
    /// missed-break entries instead of timeline ranges. Returns true when the
    /// resulting geometry differs from the previous one.
    pub fn rebuild_from_breaks(
        &mut self,
        breaks: &[AdBreakDescriptor],
        total: Option<f64>,
    ) -> bool {
        let before = self.timeline_snapshot();
        let old: Vec<(f64, f64, BreakKey)> = self
            .timeline
            .all_elements()
            .iter()
            .filter_map(|e| e.break_key().map(|k| (e.offset, e.duration, k)))
            .collect();

        let mut sorted: Vec<&AdBreakDescriptor> = breaks.iter().collect();
        sorted.sort_by(|a, b| a.position.total_cmp(&b.position));

        let mut used: HashSet<BreakKey> = HashSet::new();
        let mut placed: Vec<(f64, BreakKey)> = Vec::new();
        for descriptor in sorted {
            if descriptor.adverts.is_empty() {
                self.add_missed_break(
                    BreakInfo {
                        id: descriptor.id.clone(),
                        description: descriptor.break_type.clone(),
                        start_position: descriptor.position,
                        duration: 0.0,
                    },
                    descriptor.tracking.clone(),
                );
                continue;
            }
            let duration = descriptor.duration();
            let reused = old.iter().find(|(offset, dur, key)| {
                if used.contains(key)
                    || !self.pool.get(*key).is_some_and(|b| b.id == descriptor.id)
                {
                    return false;
                }
                let exact = (offset - descriptor.position).abs() < POSITION_EPSILON
                    && (dur - duration).abs() < POSITION_EPSILON;
                // A trimmed break starts later than the descriptor but still
                // ends within it.
                let trimmed_tail = *offset > descriptor.position + POSITION_EPSILON
                    && offset + dur <= descriptor.position + duration + POSITION_EPSILON;
                exact || trimmed_tail
            });
            let key = match reused {
                Some(&(_, _, key)) => {
                    used.insert(key);
                    key
                }
                None => self.pool.insert(AdBreak::from_descriptor(descriptor)),
            };
            // A reused trimmed break sits at its trimmed start, not the
            // descriptor's.
            let position = self
                .pool
                .get(key)
                .map(|b| b.start_position)
                .unwrap_or(descriptor.position);
            placed.push((position, key));
        }

        for (_, _, key) in &old {
            if used.contains(key) {
                continue;
            }
            if self.current_advert.map(|a| a.break_key) == Some(*key) {
                self.current_advert = None;
            }
            if self.current_break == Some(*key) {
                self.current_break = None;
                self.stop_break_end_timer();
            }
            self.pool.release(*key);
        }

        self.timeline.clear();
        for (position, key) in &placed {
            let gap = position - self.timeline.end_position();
            if gap > POSITION_EPSILON {
                self.timeline
                    .append_element(gap, crate::timeline::ElementKind::Content);
            }
            let duration = self.pool.get(*key).map(|b| b.duration()).unwrap_or(0.0);
            self.timeline
                .append_element(duration, crate::timeline::ElementKind::Advert(*key));
        }
        let total = total.unwrap_or_else(|| self.timeline.end_position());
        self.timeline.adjust_content(total);
        self.timeline.take_modified();

        self.timeline_snapshot() != before
    }

    // --- shared position handling ----------------------------------------

    /// Timeline-driven position update shared by the VOD and live-pause
    /// variants. Ignored while playback has not started or is paused; a
    /// stray tick from a paused player must not advance the state machine.
    pub fn update_position_on_timeline(
        &mut self,
        position: f64,
        now: Instant,
        style: TimelineStyle,
    ) {
        if !self.is_playing || self.is_paused {
            return;
        }
        let start = self.timeline.start_offset();
        let end = self.timeline.end_position().max(start);
        let clamped = position.clamp(start, end);
        let prev = self.last_position;
        self.fire_missed_breaks(prev, clamped);
        self.last_position = clamped;

        let break_key = self
            .timeline
            .element_at(clamped)
            .and_then(|e| e.break_key());
        match break_key {
            Some(key) => {
                let Some(index) = self
                    .pool
                    .get(key)
                    .and_then(|b| b.advert_index_for_position(clamped))
                else {
                    return;
                };
                let advert_key = AdvertKey {
                    break_key: key,
                    index,
                };
                if self.current_advert == Some(advert_key) {
                    if style == TimelineStyle::LivePause && !self.is_paused {
                        self.start_break_end_timer(now);
                    }
                    self.ping_current_advert(now);
                } else {
                    let previous_break = self.end_current_advert();
                    if previous_break.is_some() && previous_break != Some(key) {
                        self.handle_break_end();
                    }
                    if self.current_break != Some(key) {
                        self.handle_break_start(key, now);
                    }
                    self.current_advert = Some(advert_key);
                    self.activate_current(now);
                }
            }
            None => {
                if self.current_advert.is_some() || self.current_break.is_some() {
                    self.handle_break_end();
                }
            }
        }
    }
}
