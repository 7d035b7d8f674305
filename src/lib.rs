//! midroll — a client-side SSAI (server-side ad insertion) session engine.
//!
//! Given a stream of playback-position ticks, a remotely fetched ad schedule
//! and (for live streams) in-band timed-metadata cues, the engine maintains a
//! single consistent timeline of content and advert ranges, fires tracking
//! beacons at-most-once per qualifying event, and answers playback-policy
//! questions (seek/skip/pause) consistently with that state.
//!
//! The crate deliberately does *not* parse VMAP/VAST documents or video
//! manifests beyond the two embedded endpoint URLs — those arrive through the
//! [`schedule::ScheduleSource`] and [`manifest`] seams as already-structured
//! descriptors.

pub mod adbreak;
pub mod config;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod metadata;
pub mod net;
pub mod policy;
pub mod schedule;
pub mod session;
pub mod timecode;
pub mod timeline;
pub mod tracking;

pub use adbreak::{AdBreak, Advert, AdvertKey, BreakKey, BreakPool};
pub use config::SessionConfig;
pub use error::{InitResult, SessionError};
pub use manager::{PlayerCallbacks, PlayerEvent, SessionManager, SessionManagerHandle};
pub use policy::PlayerPolicy;
pub use schedule::{AdBreakDescriptor, AdvertDescriptor, FetchError, ScheduleDocument, ScheduleSource};
pub use session::{BreakInfo, Session, SessionEvent, SessionKind, TimelineEntry};
pub use timeline::{ElementKind, Timeline, TimelineElement};
