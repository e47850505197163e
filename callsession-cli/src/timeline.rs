//! Event timeline rendering for the demo

use callsession_core::{CallEvent, CallSessionInfo, RemoteTrackInfo};
use std::time::Duration;

/// One rendered line of the timeline
pub fn describe(party: &str, elapsed: Duration, event: &CallEvent) -> String {
    let what = match event {
        CallEvent::StateChanged { from, to, .. } => format!("🔄 {from:?} → {to:?}"),
        CallEvent::Connected { .. } => "✅ Connected".to_string(),
        CallEvent::RemoteStream { tracks, .. } => {
            format!("📺 Remote stream: {}", track_list(tracks))
        }
        CallEvent::Error { kind, .. } => format!("❌ Error: {kind:?}"),
        CallEvent::Ended { .. } => "📞 Ended".to_string(),
    };
    format!("[{:>6} ms] {party:<10} {what}", elapsed.as_millis())
}

/// Remote tracks as `kind:id` pairs
pub fn track_list(tracks: &[RemoteTrackInfo]) -> String {
    if tracks.is_empty() {
        return "none".to_string();
    }
    tracks
        .iter()
        .map(|t| format!("{}:{}", t.kind, t.id))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Short summary of a session snapshot
pub fn summary(party: &str, info: &CallSessionInfo) -> String {
    format!(
        "{party:<10} {:?} | video {} | audio {} | screen {} | local {} | remote {}",
        info.state,
        on_off(info.flags.video_enabled),
        on_off(info.flags.audio_enabled),
        on_off(info.flags.screen_sharing),
        info.local_tracks.len(),
        info.remote_tracks.len(),
    )
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
