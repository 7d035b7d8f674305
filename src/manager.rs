//! The session manager: owns the single session, polls the analytics
//! endpoint at low/high frequency, translates player events into session
//! calls, relays session events to the registered player and fires prepared
//! beacons.
//!
//! Runs as a small actor: a command channel in, callbacks out, with a
//! `select!` loop over the poll deadline and a fixed timer sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{InitResult, SessionError};
use crate::manifest;
use crate::metadata::{parse_id3, TimedMetadata};
use crate::net::{self, FetchError};
use crate::schedule::ScheduleSource;
use crate::session::{
    BreakInfo, LivePauseSession, LiveSession, Session, SessionEvent, SessionKind, TimelineEntry,
    VodSession,
};
use crate::tracking::BeaconQueue;

/// Timer sweep and event flush cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(250);
/// Delay between playback start and the first analytics ping.
const FIRST_PING_DELAY: Duration = Duration::from_secs(2);

/// Everything the player reports into the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Playhead position in stream seconds.
    Position(f64),
    Start,
    End,
    /// User-initiated pause.
    Pause,
    /// Buffering stall: freezes clocks without pause beacons.
    Stall,
    /// User-initiated resume.
    Resume,
    /// Recovery from a stall: no resume beacon.
    Continue,
    Mute(bool),
    Fullscreen(bool),
    /// Clickthrough on the linear advert.
    Click,
    /// Clickthrough on non-linear creative `index` of the current break.
    NonLinearClick(usize),
    /// Already-decoded timed metadata.
    Metadata(TimedMetadata),
    /// Raw in-band ID3 payload.
    RawMetadata(Vec<u8>),
    /// Arbitrary linear tracking event reported by the player.
    LinearEvent(String),
    NonLinearEvent { index: usize, event: String },
}

/// Player-facing callbacks; all methods default to no-ops so implementors
/// pick what they care about.
#[allow(unused_variables)]
pub trait PlayerCallbacks: Send + Sync {
    fn advert_start(&self, advert_id: &str) {}
    fn advert_end(&self, advert_id: &str) {}
    fn ad_break_start(&self, info: &BreakInfo) {}
    fn ad_break_end(&self, info: &BreakInfo) {}
    fn update_timeline(&self, entries: &[TimelineEntry]) {}
    fn analytics_fired(&self, event: &str, progress: u8, asset: &str) {}
    /// Diagnostic: the active advert stopped receiving position pings.
    fn advert_watchdog(&self, advert_id: &str) {}
}

enum Command {
    Player(PlayerEvent),
    RegisterPlayer(Arc<dyn PlayerCallbacks>),
    SuppressAnalytics(bool),
    PollNow,
    Shutdown,
}

/// Cheap cloneable handle to a running manager. Sends are fire-and-forget;
/// a send after shutdown is silently dropped.
#[derive(Clone, Debug)]
pub struct SessionManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionManagerHandle {
    pub fn report_event(&self, event: PlayerEvent) {
        let _ = self.tx.send(Command::Player(event));
    }

    pub fn register_player(&self, callbacks: Arc<dyn PlayerCallbacks>) {
        let _ = self.tx.send(Command::RegisterPlayer(callbacks));
    }

    pub fn suppress_analytics(&self, suppressed: bool) {
        let _ = self.tx.send(Command::SuppressAnalytics(suppressed));
    }

    pub fn poll_now(&self) {
        let _ = self.tx.send(Command::PollNow);
    }

    /// Idempotent; the actor drains its channel and stops.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

pub struct SessionManager {
    session: Box<dyn Session>,
    source: Arc<dyn ScheduleSource>,
    callbacks: Option<Arc<dyn PlayerCallbacks>>,
    client: reqwest::Client,
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    analytics_enabled: bool,
}

impl SessionManager {
    /// Create a VOD session: fetch the master manifest, extract the
    /// analytics endpoint, take the initial schedule and start the actor.
    pub async fn create_for_vod(
        config: SessionConfig,
        source_url: &str,
        source: Arc<dyn ScheduleSource>,
        is_vlive: bool,
    ) -> Result<(SessionManagerHandle, InitResult), SessionError> {
        let session = Box::new(VodSession::new(
            config.clone(),
            source_url.to_string(),
            is_vlive,
            Box::new(BeaconQueue::new(config.force_https)),
        ));
        Self::create(config, source_url, source, session, false).await
    }

    /// VOD session used for non-linear-only campaigns; identical plumbing.
    pub async fn create_for_nonlinear(
        config: SessionConfig,
        source_url: &str,
        source: Arc<dyn ScheduleSource>,
    ) -> Result<(SessionManagerHandle, InitResult), SessionError> {
        Self::create_for_vod(config, source_url, source, false).await
    }

    pub async fn create_for_live(
        config: SessionConfig,
        source_url: &str,
        source: Arc<dyn ScheduleSource>,
    ) -> Result<(SessionManagerHandle, InitResult), SessionError> {
        let session = Box::new(LiveSession::new(
            config.clone(),
            source_url.to_string(),
            Box::new(BeaconQueue::new(config.force_https)),
        ));
        Self::create(config, source_url, source, session, false).await
    }

    /// Live with DVR pause; fails when the stream advertises no live-pause
    /// endpoint.
    pub async fn create_for_live_pause(
        config: SessionConfig,
        source_url: &str,
        source: Arc<dyn ScheduleSource>,
    ) -> Result<(SessionManagerHandle, InitResult), SessionError> {
        let session = Box::new(LivePauseSession::new(
            config.clone(),
            source_url.to_string(),
            Box::new(BeaconQueue::new(config.force_https)),
        ));
        Self::create(config, source_url, source, session, true).await
    }

    async fn create(
        config: SessionConfig,
        source_url: &str,
        source: Arc<dyn ScheduleSource>,
        mut session: Box<dyn Session>,
        require_live_pause: bool,
    ) -> Result<(SessionManagerHandle, InitResult), SessionError> {
        let client = net::build_client(&config);
        let body = net::fetch_text(&client, source_url, &config)
            .await
            .map_err(fetch_to_session_error)?;
        let urls = manifest::extract_endpoints(&body);
        session.core_mut().apply_manifest(&urls);

        if require_live_pause && urls.live_pause_url.is_none() {
            return Err(SessionError::NoLivePauseSupport);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionManagerHandle { tx: tx.clone() };

        let mut analytics_enabled = false;
        let result = match &urls.analytics_url {
            None => {
                info!(%source_url, "no analytics endpoint; ad management disabled");
                InitResult::NoAnalytics
            }
            Some(analytics_url) => match source.fetch(analytics_url).await {
                Ok(document) => {
                    session.apply_schedule(&document, Instant::now());
                    analytics_enabled = true;
                    InitResult::Initialised
                }
                Err(FetchError::NotApplicable) => {
                    info!(%source_url, "schedule response is not ad-management data");
                    InitResult::NoAnalytics
                }
                Err(err) => return Err(fetch_to_session_error(err)),
            },
        };

        let manager = SessionManager {
            session,
            source,
            callbacks: None,
            client,
            rx,
            tx,
            analytics_enabled,
        };
        tokio::spawn(manager.run());
        Ok((handle, result))
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut next_poll = Instant::now() + self.session.core().poll_interval();

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => {
                            if self.handle_command(command, &mut next_poll).await {
                                self.flush();
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_poll.into()), if self.analytics_enabled => {
                    self.poll().await;
                    next_poll = Instant::now() + self.session.core().poll_interval();
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.session.tick(now);
                    if std::mem::take(&mut self.session.core_mut().poll_requested)
                        && self.analytics_enabled
                    {
                        self.poll().await;
                        next_poll = Instant::now() + self.session.core().poll_interval();
                    }
                    if std::mem::take(&mut self.session.core_mut().live_pause_ping_requested) {
                        self.fire_live_pause_ping();
                    }
                    self.flush();
                }
            }
        }
        debug!("session manager stopped");
    }

    /// Returns true when session state may have changed.
    async fn handle_command(&mut self, command: Command, next_poll: &mut Instant) -> bool {
        let now = Instant::now();
        match command {
            Command::Player(event) => {
                self.handle_player_event(event, now);
                // Advert boundaries move the poller between frequencies.
                *next_poll = (*next_poll).min(now + self.session.core().poll_interval());
                true
            }
            Command::RegisterPlayer(callbacks) => {
                self.callbacks = Some(callbacks);
                true
            }
            Command::SuppressAnalytics(suppressed) => {
                self.session.core_mut().suppress_analytics(suppressed, now);
                true
            }
            Command::PollNow => {
                if self.analytics_enabled {
                    self.poll().await;
                    *next_poll = Instant::now() + self.session.core().poll_interval();
                }
                true
            }
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn handle_player_event(&mut self, event: PlayerEvent, now: Instant) {
        match event {
            PlayerEvent::Position(position) => self.session.update_position(position, now),
            PlayerEvent::Start => {
                let core = self.session.core_mut();
                core.is_playing = true;
                core.is_paused = false;
                // First analytics ping runs shortly after playback starts.
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(FIRST_PING_DELAY).await;
                    let _ = tx.send(Command::PollNow);
                });
            }
            PlayerEvent::End => {
                let core = self.session.core_mut();
                core.invoke_current_tracking("closeLinear");
                core.handle_break_end();
                core.is_playing = false;
            }
            PlayerEvent::Pause => {
                let core = self.session.core_mut();
                core.pause_playback(now, true);
                if core.kind == SessionKind::LivePause {
                    core.live_pause_ping_requested = true;
                }
            }
            PlayerEvent::Stall => self.session.core_mut().pause_playback(now, false),
            PlayerEvent::Resume => self.session.core_mut().resume_playback(now, true),
            PlayerEvent::Continue => self.session.core_mut().resume_playback(now, false),
            PlayerEvent::Mute(muted) => self
                .session
                .core_mut()
                .invoke_current_tracking(if muted { "mute" } else { "unmute" }),
            PlayerEvent::Fullscreen(full) => self.session.core_mut().invoke_current_tracking(
                if full { "fullscreen" } else { "exitFullscreen" },
            ),
            PlayerEvent::Click => self.session.core_mut().invoke_current_tracking("clickTracking"),
            PlayerEvent::NonLinearClick(index) => self
                .session
                .core_mut()
                .invoke_break_tracking(index, "clickTracking"),
            PlayerEvent::Metadata(metadata) => self.session.handle_metadata(&metadata, now),
            PlayerEvent::RawMetadata(bytes) => {
                if let Some(metadata) = parse_id3(&bytes) {
                    self.session.handle_metadata(&metadata, now);
                }
            }
            PlayerEvent::LinearEvent(event) => {
                self.session.core_mut().invoke_current_tracking(&event)
            }
            PlayerEvent::NonLinearEvent { index, event } => {
                self.session.core_mut().invoke_break_tracking(index, &event)
            }
        }
    }

    async fn poll(&mut self) {
        let Some(url) = self.session.core().analytics_url.clone() else {
            return;
        };
        match self.source.fetch(&url).await {
            Ok(document) => self.session.apply_schedule(&document, Instant::now()),
            // Mid-session poll failures are retried at the next interval.
            Err(err) => warn!(error = %err, "analytics poll failed"),
        }
        self.flush();
    }

    fn fire_live_pause_ping(&self) {
        let Some(url) = self.session.core().live_pause_url.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client.get(&url).send().await {
                warn!(error = %err, "live-pause ping failed");
            }
        });
    }

    /// Relay pending session events to the player and fire prepared beacons.
    fn flush(&mut self) {
        let events = self.session.core_mut().take_events();
        if let Some(callbacks) = &self.callbacks {
            for event in &events {
                match event {
                    SessionEvent::AdvertStart(id) => callbacks.advert_start(id),
                    SessionEvent::AdvertEnd(id) => callbacks.advert_end(id),
                    SessionEvent::AdBreakStart(info) => callbacks.ad_break_start(info),
                    SessionEvent::AdBreakEnd(info) => callbacks.ad_break_end(info),
                    SessionEvent::TimelineUpdated(entries) => callbacks.update_timeline(entries),
                    SessionEvent::AnalyticsFired {
                        event,
                        progress,
                        asset,
                    } => callbacks.analytics_fired(event, *progress, asset),
                    SessionEvent::WatchdogTimeout(id) => callbacks.advert_watchdog(id),
                }
            }
        }

        for beacon in self.session.core_mut().tracking.take_outbox() {
            debug!(event = %beacon.event, url = %beacon.url, "firing beacon");
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(err) = client.get(&beacon.url).send().await {
                    warn!(event = %beacon.event, error = %err, "beacon failed");
                }
            });
        }
    }
}

fn fetch_to_session_error(err: FetchError) -> SessionError {
    match err {
        FetchError::Timeout(url) => SessionError::ConnectionTimeout(url),
        FetchError::Connection(msg) => SessionError::ConnectionError(msg),
        FetchError::Malformed(msg) => SessionError::MalformedSchedule(msg),
        FetchError::NotApplicable => SessionError::NotAYospaceSource,
    }
}
