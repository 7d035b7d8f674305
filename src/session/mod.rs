//! Session state machines: the shared core plus the VOD, live and
//! live-pause variants.

mod core;
mod live;
mod live_pause;
mod vod;

pub use self::core::SessionCore;
pub use self::live::LiveSession;
pub use self::live_pause::LivePauseSession;
pub use self::vod::VodSession;

use std::time::Instant;

use crate::schedule::ScheduleDocument;

/// Which variant a session was constructed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Video on demand; `is_vlive` marks a live event replayed as VOD.
    Vod { is_vlive: bool },
    Live,
    /// Live with DVR pause support.
    LivePause,
}

impl SessionKind {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live | Self::LivePause)
    }
}

/// Snapshot of a break handed out with break start/end events.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakInfo {
    pub id: String,
    pub description: String,
    pub start_position: f64,
    pub duration: f64,
}

/// One row of the timeline snapshot handed to the player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineEntry {
    pub offset: f64,
    pub duration: f64,
    pub is_advert: bool,
}

/// Events the session emits towards the registered player, drained by the
/// manager after every call into the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AdvertStart(String),
    AdvertEnd(String),
    AdBreakStart(BreakInfo),
    AdBreakEnd(BreakInfo),
    TimelineUpdated(Vec<TimelineEntry>),
    AnalyticsFired {
        event: String,
        progress: u8,
        asset: String,
    },
    /// Diagnostic: the active advert went unpinged past its grace period.
    WatchdogTimeout(String),
}

/// Common surface the manager drives, implemented by all three variants.
pub trait Session: Send {
    fn core(&self) -> &SessionCore;
    fn core_mut(&mut self) -> &mut SessionCore;

    /// Playhead tick from the player.
    fn update_position(&mut self, position: f64, now: Instant);

    /// In-band timed metadata (live variants only; default ignores it).
    fn handle_metadata(&mut self, metadata: &crate::metadata::TimedMetadata, now: Instant) {
        let _ = (metadata, now);
    }

    /// A freshly fetched schedule document (poll result).
    fn apply_schedule(&mut self, document: &ScheduleDocument, now: Instant);

    /// Timer sweep; called at the driving loop's cadence.
    fn tick(&mut self, now: Instant) {
        self.core_mut().check_timers(now);
    }
}
