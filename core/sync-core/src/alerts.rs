//! Alert dispatch: turns an alert event into a tone and/or a desktop
//! notification, gated by the user's preferences at the moment of the alert.

use std::io::Write;
use std::sync::Arc;

use tracing::{debug, info};

use crate::preferences::{desktop_notifications_enabled, sound_enabled, PreferenceSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSource {
    Notifications,
    Presence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    pub source: AlertSource,
    /// How many new items triggered this alert (always at least 1).
    pub delta: u32,
    pub title: String,
    pub body: String,
}

impl AlertEvent {
    pub fn waiting_increased(delta: u32) -> Self {
        let body = if delta == 1 {
            "1 conversation is waiting for a response".to_string()
        } else {
            format!("{} more conversations are waiting for a response", delta)
        };
        Self {
            source: AlertSource::Presence,
            delta,
            title: "Leads waiting".to_string(),
            body,
        }
    }
}

/// Receives alert events from the notification store and presence tracker.
pub trait AlertSink: Send + Sync {
    fn alert(&self, event: AlertEvent);
}

pub trait TonePlayer: Send + Sync {
    fn play(&self);
}

pub trait DesktopNotifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Clone, Default)]
pub struct TerminalBell;

impl TonePlayer for TerminalBell {
    fn play(&self) {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}

/// Reports desktop notifications through the log; hosts with a real
/// notification center supply their own `DesktopNotifier`.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl DesktopNotifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!(title, body, "Desktop notification");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub tone_played: bool,
    pub desktop_shown: bool,
}

pub struct AlertDispatcher {
    prefs: Arc<dyn PreferenceSource>,
    tone: Arc<dyn TonePlayer>,
    notifier: Arc<dyn DesktopNotifier>,
}

impl AlertDispatcher {
    pub fn new(
        prefs: Arc<dyn PreferenceSource>,
        tone: Arc<dyn TonePlayer>,
        notifier: Arc<dyn DesktopNotifier>,
    ) -> Self {
        Self {
            prefs,
            tone,
            notifier,
        }
    }

    /// Preferences are read here, per alert, never cached.
    pub fn dispatch(&self, event: &AlertEvent) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if desktop_notifications_enabled(self.prefs.as_ref()) {
            self.notifier.notify(&event.title, &event.body);
            outcome.desktop_shown = true;
        }
        if sound_enabled(self.prefs.as_ref()) {
            self.tone.play();
            outcome.tone_played = true;
        }

        debug!(
            source = ?event.source,
            delta = event.delta,
            tone = outcome.tone_played,
            desktop = outcome.desktop_shown,
            "Alert dispatched"
        );
        outcome
    }
}

impl AlertSink for AlertDispatcher {
    fn alert(&self, event: AlertEvent) {
        self.dispatch(&event);
    }
}
