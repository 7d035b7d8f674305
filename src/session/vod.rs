//! Video-on-demand session: full timeline known up front, refreshed by
//! polling; playhead drives every transition.

use std::time::Instant;

use crate::config::SessionConfig;
use crate::schedule::ScheduleDocument;
use crate::session::core::TimelineStyle;
use crate::session::{Session, SessionCore, SessionKind};
use crate::tracking::TrackingDispatch;

pub struct VodSession {
    core: SessionCore,
}

impl VodSession {
    /// `is_vlive` marks a finished live event being replayed as VOD; the
    /// schedule source serves it the same way, but policy stays VOD.
    pub fn new(
        config: SessionConfig,
        source_url: String,
        is_vlive: bool,
        tracking: Box<dyn TrackingDispatch>,
    ) -> Self {
        Self {
            core: SessionCore::new(
                SessionKind::Vod { is_vlive },
                config,
                source_url,
                tracking,
            ),
        }
    }

    /// Map a raw playhead position to the content-only position (advert
    /// ranges excluded). Inside an advert the content position holds at the
    /// advert's start.
    pub fn content_position_for_playhead(&self, playhead: f64) -> f64 {
        let mut content = 0.0;
        for element in self.core.timeline.all_elements() {
            if playhead < element.offset {
                break;
            }
            if element.is_advert() {
                continue;
            }
            let consumed = (playhead - element.offset).min(element.duration);
            content += consumed.max(0.0);
        }
        content
    }

    /// Inverse of [`Self::content_position_for_playhead`]: where on the full
    /// timeline a content-only position falls.
    pub fn playhead_position_for_content(&self, content: f64) -> f64 {
        let mut remaining = content;
        let mut playhead = 0.0;
        for element in self.core.timeline.all_elements() {
            if element.is_advert() {
                playhead = element.end();
                continue;
            }
            if remaining <= element.duration {
                return element.offset + remaining;
            }
            remaining -= element.duration;
            playhead = element.end();
        }
        playhead
    }
}

impl Session for VodSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn update_position(&mut self, position: f64, now: Instant) {
        self.core
            .update_position_on_timeline(position, now, TimelineStyle::Vod);
    }

    fn apply_schedule(&mut self, document: &ScheduleDocument, _now: Instant) {
        let changed = self
            .core
            .rebuild_from_breaks(&document.breaks, document.stream.total_duration);
        if changed {
            self.core.emit_timeline();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use crate::tracking::BeaconQueue;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::schedule::{AdBreakDescriptor, AdvertDescriptor, StreamInfo};

    fn advert(id: &str, duration: f64) -> AdvertDescriptor {
        AdvertDescriptor {
            media_id: format!("media-{id}"),
            advert_id: id.to_string(),
            creative_id: format!("creative-{id}"),
            duration,
            skip_offset: None,
            interactive: false,
            asset_uri: format!("https://cdn.example.com/{id}.ts"),
            clickthrough: None,
            impressions: Vec::new(),
            tracking: HashMap::new(),
        }
    }

    fn schedule(breaks: Vec<AdBreakDescriptor>, total: f64) -> ScheduleDocument {
        ScheduleDocument {
            breaks,
            stream: StreamInfo {
                total_duration: Some(total),
                ..StreamInfo::default()
            },
        }
    }

    fn linear_break(id: &str, position: f64, adverts: Vec<AdvertDescriptor>) -> AdBreakDescriptor {
        AdBreakDescriptor {
            id: id.to_string(),
            break_type: "linear".to_string(),
            position,
            adverts,
            tracking: HashMap::new(),
        }
    }

    fn session_with_one_break() -> (VodSession, Instant) {
        let mut session = VodSession::new(
            SessionConfig::default(),
            "https://example.com/master.m3u8".to_string(),
            false,
            Box::new(BeaconQueue::new(false)),
        );
        let now = Instant::now();
        session.apply_schedule(
            &schedule(
                vec![linear_break("break-1", 30.0, vec![advert("ad-1", 15.0)])],
                100.0,
            ),
            now,
        );
        session.core_mut().take_events();
        session.core_mut().is_playing = true;
        (session, now)
    }

    #[test]
    fn schedule_builds_timeline_and_emits_update() {
        let mut session = VodSession::new(
            SessionConfig::default(),
            "https://example.com/master.m3u8".to_string(),
            false,
            Box::new(BeaconQueue::new(false)),
        );
        session.apply_schedule(
            &schedule(
                vec![linear_break("break-1", 30.0, vec![advert("ad-1", 15.0)])],
                100.0,
            ),
            Instant::now(),
        );
        let events = session.core_mut().take_events();
        assert!(matches!(events.as_slice(), [SessionEvent::TimelineUpdated(entries)]
            if entries.len() == 3 && entries[1].is_advert));
    }

    #[test]
    fn repolling_identical_schedule_is_silent() {
        let (mut session, now) = session_with_one_break();
        session.apply_schedule(
            &schedule(
                vec![linear_break("break-1", 30.0, vec![advert("ad-1", 15.0)])],
                100.0,
            ),
            now,
        );
        assert!(session.core_mut().take_events().is_empty());
    }

    #[test]
    fn entering_break_emits_start_events_and_beacons() {
        let (mut session, now) = session_with_one_break();
        session.update_position(10.0, now);
        assert!(session.core_mut().take_events().is_empty());

        session.update_position(31.0, now + Duration::from_secs(1));
        let events = session.core_mut().take_events();
        assert!(matches!(&events[0], SessionEvent::AdBreakStart(info) if info.id == "break-1"));
        assert!(matches!(&events[1], SessionEvent::AdvertStart(id) if id == "ad-1"));
    }

    #[test]
    fn leaving_break_emits_end_events() {
        let (mut session, now) = session_with_one_break();
        session.update_position(31.0, now);
        session.core_mut().take_events();

        session.update_position(46.0, now + Duration::from_secs(15));
        let events = session.core_mut().take_events();
        assert!(matches!(&events[0], SessionEvent::AdvertEnd(id) if id == "ad-1"));
        assert!(matches!(&events[1], SessionEvent::AdBreakEnd(info) if info.id == "break-1"));
    }

    #[test]
    fn position_clamped_to_timeline_bounds() {
        let (mut session, now) = session_with_one_break();
        session.update_position(500.0, now);
        assert_eq!(session.core().last_position, 100.0);
        session.update_position(-5.0, now);
        assert_eq!(session.core().last_position, 0.0);
    }

    #[test]
    fn empty_break_fires_start_and_end_once_when_crossed() {
        let mut session = VodSession::new(
            SessionConfig::default(),
            "https://example.com/master.m3u8".to_string(),
            false,
            Box::new(BeaconQueue::new(false)),
        );
        let now = Instant::now();
        let mut tracking = HashMap::new();
        tracking.insert(
            "breakStart".to_string(),
            vec!["https://t.example.com/bs".to_string()],
        );
        let mut empty = linear_break("break-empty", 20.0, Vec::new());
        empty.tracking = tracking;
        session.apply_schedule(&schedule(vec![empty], 100.0), now);
        session.core_mut().take_events();
        session.core_mut().is_playing = true;

        session.update_position(10.0, now);
        session.update_position(25.0, now);
        let events = session.core_mut().take_events();
        assert!(matches!(&events[0], SessionEvent::AdBreakStart(info) if info.id == "break-empty"));
        assert!(matches!(&events[1], SessionEvent::AdBreakEnd(info) if info.id == "break-empty"));
        let beacons = session.core_mut().tracking.take_outbox();
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].event, "breakStart");

        // Seeking back and crossing again stays silent.
        session.update_position(10.0, now);
        session.update_position(25.0, now);
        assert!(session.core_mut().take_events().is_empty());
        assert!(session.core_mut().tracking.take_outbox().is_empty());
    }

    #[test]
    fn position_ticks_ignored_unless_playing_unpaused() {
        let mut session = VodSession::new(
            SessionConfig::default(),
            "https://example.com/master.m3u8".to_string(),
            false,
            Box::new(BeaconQueue::new(false)),
        );
        let now = Instant::now();
        session.apply_schedule(
            &schedule(
                vec![linear_break("break-1", 30.0, vec![advert("ad-1", 15.0)])],
                100.0,
            ),
            now,
        );
        session.core_mut().take_events();

        // Playback not started: the tick is dropped.
        session.update_position(31.0, now);
        assert!(session.core_mut().take_events().is_empty());
        assert_eq!(session.core().last_position, 0.0);

        // Paused: a stray tick inside the break must not open it.
        session.core_mut().is_playing = true;
        session.core_mut().pause_playback(now, true);
        session.update_position(31.0, now);
        assert!(session.core_mut().take_events().is_empty());
        assert!(session.core().current_advert.is_none());
        assert_eq!(session.core().last_position, 0.0);

        // Resumed: the next tick enters the break.
        session.core_mut().resume_playback(now + Duration::from_secs(1), true);
        session.update_position(31.0, now + Duration::from_secs(1));
        let events = session.core_mut().take_events();
        assert!(matches!(&events[0], SessionEvent::AdBreakStart(info) if info.id == "break-1"));
        assert!(matches!(&events[1], SessionEvent::AdvertStart(id) if id == "ad-1"));
    }

    #[test]
    fn content_playhead_bijection() {
        let (session, _) = session_with_one_break();
        // Before the break, content == playhead.
        assert_eq!(session.content_position_for_playhead(10.0), 10.0);
        // Inside the break, content holds at the break start.
        assert_eq!(session.content_position_for_playhead(40.0), 30.0);
        // After the break, adverts are excluded.
        assert_eq!(session.content_position_for_playhead(60.0), 45.0);

        assert_eq!(session.playhead_position_for_content(10.0), 10.0);
        assert_eq!(session.playhead_position_for_content(45.0), 60.0);
    }

    #[test]
    fn reused_break_keeps_active_state_across_polls() {
        let (mut session, now) = session_with_one_break();
        // Play the break out so its advert deactivates.
        session.update_position(31.0, now);
        session.update_position(46.0, now + Duration::from_secs(15));
        session.core_mut().take_events();

        session.apply_schedule(
            &schedule(
                vec![linear_break("break-1", 30.0, vec![advert("ad-1", 15.0)])],
                100.0,
            ),
            now + Duration::from_secs(16),
        );
        let key = session.core().timeline.all_elements()[1].break_key().unwrap();
        assert!(!session.core().pool.get(key).unwrap().is_active());
    }
}
