//! Playback-policy adapter: answers the player's "may I…" questions from
//! the session state, and applies the side effects a granted seek implies.

use std::time::Instant;

use tracing::debug;

use crate::session::{SessionCore, SessionKind};

/// Borrowed view over the session used to answer policy queries. Seek
/// resolution mutates state (jumped breaks deactivate), hence the mutable
/// borrow.
pub struct PlayerPolicy<'a> {
    core: &'a mut SessionCore,
}

impl<'a> PlayerPolicy<'a> {
    pub fn new(core: &'a mut SessionCore) -> Self {
        Self { core }
    }

    /// Resolve a seek request to the position playback must actually jump
    /// to.
    ///
    /// Pure-live streams and active adverts pin the playhead. Otherwise the
    /// request snaps back to the closest still-active break at or before the
    /// target, forcing it to be watched; any other active breaks being
    /// jumped are deactivated and never replayed.
    pub fn can_seek_to(&mut self, position: f64) -> f64 {
        if matches!(self.core.kind, SessionKind::Live) {
            return self.core.last_position;
        }
        if self.core.is_in_active_advert() {
            return self.core.last_position;
        }

        let candidates: Vec<(f64, crate::adbreak::BreakKey)> = self
            .core
            .timeline
            .all_elements()
            .iter()
            .filter(|e| e.is_advert() && e.offset <= position)
            .filter_map(|e| e.break_key().map(|k| (e.offset, k)))
            .collect();

        let snap = candidates
            .iter()
            .rev()
            .find(|(_, key)| self.core.pool.get(*key).is_some_and(|b| b.is_active()))
            .copied();

        match snap {
            Some((offset, snap_key)) => {
                let mut deactivated = false;
                for (candidate_offset, key) in candidates {
                    if key != snap_key
                        && candidate_offset < offset
                        && self.core.pool.get(key).is_some_and(|b| b.is_active())
                    {
                        self.core.deactivate_break(key);
                        deactivated = true;
                    }
                }
                if deactivated {
                    self.core.emit_timeline();
                }
                debug!(requested = position, granted = offset, "seek snapped to unwatched break");
                offset
            }
            None => position,
        }
    }

    /// Seconds until the current advert may be skipped: `0` when skippable
    /// now, `-1` when not skippable at all.
    pub fn can_skip(&self, now: Instant) -> f64 {
        let Some(advert_key) = self.core.current_advert else {
            return -1.0;
        };
        let Some(advert) = self.core.pool.advert(advert_key) else {
            return -1.0;
        };
        // An already-watched advert is skippable at once, but still subject
        // to the per-kind rules below (a live edge can deny it).
        let skip_offset = if advert.active {
            match advert.descriptor.skip_offset {
                Some(offset) => offset,
                None => return -1.0,
            }
        } else {
            0.0
        };
        let elapsed = advert.time_elapsed(now);
        match self.core.kind {
            SessionKind::Live => -1.0,
            SessionKind::Vod { .. } => (skip_offset - elapsed).max(0.0),
            SessionKind::LivePause => {
                // Skipping would land within the live-edge buffer: deny.
                let remaining = (advert.duration - elapsed).max(0.0);
                let edge = self.core.timeline.end_position();
                if self.core.last_position + remaining >= edge - self.core.config.live_tolerance {
                    -1.0
                } else {
                    (skip_offset - elapsed).max(0.0)
                }
            }
        }
    }

    pub fn can_pause(&self) -> bool {
        !matches!(self.core.kind, SessionKind::Live)
    }

    pub fn can_seek(&self) -> bool {
        !matches!(self.core.kind, SessionKind::Live) && !self.core.is_in_active_advert()
    }

    pub fn can_start(&self) -> bool {
        true
    }

    pub fn can_stop(&self) -> bool {
        true
    }

    pub fn can_mute(&self) -> bool {
        true
    }

    pub fn can_change_fullscreen(&self) -> bool {
        true
    }

    pub fn can_expand_creative(&self) -> bool {
        false
    }

    pub fn can_click_through(&self) -> bool {
        true
    }
}
