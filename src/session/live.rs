//! Live session: no advance timeline. Breaks arrive through schedule polls
//! and are consumed by in-band metadata cues (`YMID`/`YTYP`/`YSEQ`); a
//! tolerance timer closes a break when its sustaining cues stop.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tracing::debug;

use crate::adbreak::{AdBreak, AdvertKey, BreakKey};
use crate::config::SessionConfig;
use crate::metadata::{cue_fields, sanitize, CueFields, CueType, TimedMetadata};
use crate::schedule::ScheduleDocument;
use crate::session::{BreakInfo, Session, SessionCore, SessionEvent, SessionKind};
use crate::tracking::{MacroContext, TrackingDispatch};

/// A cue received before any schedule data; replayed once the first poll
/// lands, with the advert clock back-dated to the cue's arrival.
struct CachedCue {
    at: Instant,
    cue: CueFields,
}

pub struct LiveSession {
    core: SessionCore,
    /// Media id → advert handles, consumed oldest-first.
    ad_pool: HashMap<String, VecDeque<AdvertKey>>,
    /// Breaks delivered but not yet consumed, oldest at the back.
    upcoming_breaks: VecDeque<BreakKey>,
    poll_count: u32,
    deferred: bool,
    cached: Vec<CachedCue>,
}

impl LiveSession {
    pub fn new(
        config: SessionConfig,
        source_url: String,
        tracking: Box<dyn TrackingDispatch>,
    ) -> Self {
        Self {
            core: SessionCore::new(SessionKind::Live, config, source_url, tracking),
            ad_pool: HashMap::new(),
            upcoming_breaks: VecDeque::new(),
            poll_count: 0,
            deferred: false,
            cached: Vec::new(),
        }
    }

    /// Oldest pooled advert for `media_id`, if any.
    fn get_ad_by_id(&mut self, media_id: &str) -> Option<AdvertKey> {
        self.ad_pool.get_mut(media_id)?.pop_back()
    }

    /// Return an advert taken by a non-start cue; it stays next in line.
    fn requeue(&mut self, media_id: &str, key: AdvertKey) {
        self.ad_pool
            .entry(media_id.to_string())
            .or_default()
            .push_back(key);
    }

    fn have_more_ads(&self) -> bool {
        let Some(break_key) = self.core.current_break else {
            return false;
        };
        self.ad_pool
            .values()
            .flatten()
            .any(|a| a.break_key == break_key)
    }

    /// Drop every handle into a consumed break and release it.
    fn cleanup_break(&mut self, key: BreakKey) {
        self.upcoming_breaks.retain(|k| *k != key);
        for queue in self.ad_pool.values_mut() {
            queue.retain(|a| a.break_key != key);
        }
        self.ad_pool.retain(|_, queue| !queue.is_empty());
        self.core.pool.release(key);
    }

    /// An empty break never opens; its start and end beacons fire together
    /// on arrival.
    fn fire_empty_break(&mut self, descriptor: &crate::schedule::AdBreakDescriptor) {
        let info = BreakInfo {
            id: descriptor.id.clone(),
            description: descriptor.break_type.clone(),
            start_position: descriptor.position,
            duration: 0.0,
        };
        let ctx = MacroContext {
            content_playhead: self.core.last_position,
            asset_uri: String::new(),
            actual_duration: 0.0,
        };
        for event in ["breakStart", "breakEnd"] {
            if let Some(urls) = descriptor.tracking.get(event) {
                self.core.tracking.track(event, urls, &ctx);
            }
        }
        self.core.push_event(SessionEvent::AdBreakStart(info.clone()));
        self.core.push_event(SessionEvent::AdBreakEnd(info));
    }

    fn current_media_id(&self) -> Option<String> {
        let advert = self.core.pool.advert(self.core.current_advert?)?;
        Some(advert.descriptor.media_id.clone())
    }

    fn process_cue(&mut self, cue: &CueFields, now: Instant, backdate: Option<Instant>) {
        if self.current_media_id().as_deref() == Some(cue.media_id.as_str()) {
            // Sustaining cue for the playing advert.
            self.core.start_break_end_timer(now);
            self.core.ping_current_advert(now);
            if cue.cue_type == CueType::End {
                let done = cue.sequence >= cue.total || self.current_advert_overran(now);
                if done {
                    self.core.end_current_advert();
                }
            }
            return;
        }

        let was_in_ad = self.core.current_advert.is_some();
        if was_in_ad {
            self.core.end_current_advert();
        }
        let Some(advert_key) = self.get_ad_by_id(&cue.media_id) else {
            debug!(media_id = %cue.media_id, "cue for unpooled advert ignored");
            if self.core.current_break.is_some() {
                self.core.start_break_end_timer(now);
            }
            return;
        };

        let starts = was_in_ad || (cue.cue_type == CueType::Start && cue.sequence == 1);
        if starts {
            if self.core.current_break.is_none() {
                self.core.handle_break_start(advert_key.break_key, now);
            } else {
                self.core.start_break_end_timer(now);
            }
            self.core.current_advert = Some(advert_key);
            self.core.activate_current(now);
            if let Some(at) = backdate {
                if let Some(advert) = self.core.pool.advert_mut(advert_key) {
                    advert.backdate_start(at);
                }
            }
        } else {
            // A mid-advert cue before the advert's start was seen: leave the
            // advert in line for the start cue.
            self.requeue(&cue.media_id, advert_key);
        }
    }

    fn current_advert_overran(&self, now: Instant) -> bool {
        self.core
            .current_advert
            .and_then(|key| self.core.pool.advert(key))
            .is_some_and(|a| a.time_elapsed(now) > a.duration)
    }

    fn process_cached_metadata(&mut self, now: Instant) {
        for cached in std::mem::take(&mut self.cached) {
            self.process_cue(&cached.cue, now, Some(cached.at));
        }
    }
}

impl Session for LiveSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn update_position(&mut self, position: f64, now: Instant) {
        if !self.core.is_playing || self.core.is_paused {
            return;
        }
        self.core.last_position = position.max(0.0);
        if self.core.current_advert.is_some() {
            let linear = self
                .core
                .current_advert
                .and_then(|k| self.core.pool.get(k.break_key))
                .is_some_and(|b| b.description == "linear");
            let interactive = self
                .core
                .current_advert
                .and_then(|k| self.core.pool.advert(k))
                .is_some_and(|a| a.descriptor.interactive);
            if linear && !interactive && self.current_advert_overran(now) {
                // The stream moved on without an end cue.
                debug!("live advert overran its duration; forcing end");
                self.core.end_current_advert();
                if !self.have_more_ads() {
                    let open = self.core.current_break;
                    self.core.handle_break_end();
                    if let Some(key) = open {
                        self.cleanup_break(key);
                    }
                }
            } else {
                self.core.ping_current_advert(now);
            }
        }
    }

    fn handle_metadata(&mut self, metadata: &TimedMetadata, now: Instant) {
        let clean = sanitize(metadata);
        let Some(cue) = cue_fields(&clean) else {
            return;
        };
        if self.upcoming_breaks.is_empty()
            && self.core.current_break.is_none()
            && (self.poll_count < 2 || self.deferred)
        {
            // Cue arrived before schedule data: buffer it and ask for an
            // immediate out-of-band poll.
            debug!(media_id = %cue.media_id, "cue received before schedule; deferring");
            self.deferred = true;
            self.core.poll_requested = true;
            self.cached.push(CachedCue { at: now, cue });
            return;
        }
        self.process_cue(&cue, now, None);
    }

    fn apply_schedule(&mut self, document: &ScheduleDocument, now: Instant) {
        self.poll_count = self.poll_count.saturating_add(1);
        for descriptor in &document.breaks {
            if descriptor.adverts.is_empty() {
                self.fire_empty_break(descriptor);
                continue;
            }
            // Ignore re-delivery of a break already pooled under this id.
            let already = self
                .upcoming_breaks
                .iter()
                .chain(self.core.current_break.iter())
                .any(|k| self.core.pool.get(*k).is_some_and(|b| b.id == descriptor.id));
            if already {
                continue;
            }
            let key = self.core.pool.insert(AdBreak::from_descriptor(descriptor));
            self.upcoming_breaks.push_front(key);
            for (index, advert) in descriptor.adverts.iter().enumerate() {
                self.ad_pool
                    .entry(advert.media_id.clone())
                    .or_default()
                    .push_front(AdvertKey {
                        break_key: key,
                        index,
                    });
            }
        }
        if self.deferred {
            self.deferred = false;
            self.process_cached_metadata(now);
        }
    }

    fn tick(&mut self, now: Instant) {
        let open = self.core.current_break;
        if self.core.check_timers(now) {
            if let Some(key) = open {
                self.cleanup_break(key);
            }
        }
    }
}
