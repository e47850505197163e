//! Local media capture
//!
//! This module turns camera, microphone and screen acquisition into a uniform
//! [`LocalTrack`] handle.
//!
//! # Architecture
//!
//! The module provides a `CaptureBackend` trait that abstracts the platform
//! capture API:
//! - `SyntheticCaptureBackend` - In-process devices with configurable
//!   permissions and availability
//!
//! Every handle returned by a backend is released exactly once. A
//! [`LocalTrack`] releases its device on [`LocalTrack::stop`] or, failing
//! that, when the last reference is dropped, so an acquisition abandoned
//! half-way still gives its devices back.

use crate::types::{MediaConstraints, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The platform or user refused access
    #[error("Permission denied for {0} capture")]
    PermissionDenied(TrackKind),

    /// No device exists for the requested modality
    #[error("No capture device for {0}")]
    DeviceUnavailable(TrackKind),

    /// The device exists but failed to start
    #[error("Capture device error for {kind}: {reason}")]
    DeviceError {
        /// Modality of the failing device
        kind: TrackKind,
        /// Backend message
        reason: String,
    },
}

impl MediaError {
    /// Modality the error refers to
    #[must_use]
    pub fn track_kind(&self) -> TrackKind {
        match self {
            Self::PermissionDenied(kind) | Self::DeviceUnavailable(kind) => *kind,
            Self::DeviceError { kind, .. } => *kind,
        }
    }
}

// ============================================================================
// Capture Backend Abstraction
// ============================================================================

/// Handle to a device source returned by a [`CaptureBackend`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptureHandle {
    /// Backend-specific device/source identifier
    pub device_id: String,
    /// Human readable label
    pub label: String,
}

/// Backend abstraction for local device capture
///
/// `acquire` may suspend for a long time (OS permission prompts). `release`
/// is synchronous so it can run from `Drop`; the caller guarantees it is
/// invoked once per successful `acquire`.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Acquire a source of the given kind
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` when the source
    /// cannot be opened
    async fn acquire(&self, kind: TrackKind) -> Result<CaptureHandle, MediaError>;

    /// Release a previously acquired source
    fn release(&self, kind: TrackKind, handle: &CaptureHandle);

    /// Token the backend cancels when the source ends on its own
    ///
    /// Called once per acquired handle. The default never ends.
    fn source_ended(&self, _handle: &CaptureHandle) -> CancellationToken {
        CancellationToken::new()
    }

    /// Get the backend type name for debugging/logging
    fn backend_type(&self) -> &'static str;
}

// ============================================================================
// Local Tracks
// ============================================================================

/// A locally captured track exclusively owned by one call session
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    handle: CaptureHandle,
    enabled: AtomicBool,
    stopped: AtomicBool,
    source_ended: CancellationToken,
    backend: Arc<dyn CaptureBackend>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device_id", &self.handle.device_id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack {
    fn new(kind: TrackKind, handle: CaptureHandle, backend: Arc<dyn CaptureBackend>) -> Self {
        let source_ended = backend.source_ended(&handle);
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            handle,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            source_ended,
            backend,
        }
    }

    /// Track identifier, unique per acquisition
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Device this track was captured from
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.handle.device_id
    }

    /// Whether frames/samples are currently forwarded
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Set the enabled flag in place
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the enabled flag and return the new value
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Whether the device has been released
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track and release its device
    ///
    /// Returns `true` if this call released the device, `false` if it was
    /// already released.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.enabled.store(false, Ordering::SeqCst);
        self.backend.release(self.kind, &self.handle);
        tracing::debug!(
            track_id = %self.id,
            kind = %self.kind,
            device_id = %self.handle.device_id,
            "Local track released"
        );
        true
    }

    /// Signal that the source ended outside our control
    ///
    /// This is what a capture backend reports when, for example, the user
    /// stops a screen share from the operating system. Observers waiting on
    /// [`LocalTrack::source_ended`] are woken and the device is released.
    pub fn end_source(&self) {
        tracing::info!(track_id = %self.id, kind = %self.kind, "Capture source ended");
        self.source_ended.cancel();
        self.stop();
    }

    /// Wait until the source ends externally
    ///
    /// A local [`LocalTrack::stop`] does not resolve this future.
    pub async fn source_ended(&self) {
        self.source_ended.cancelled().await;
    }

    /// Check if the source ended externally
    #[must_use]
    pub fn has_source_ended(&self) -> bool {
        self.source_ended.is_cancelled()
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        if self.stop() {
            tracing::warn!(track_id = %self.id, "Local track dropped without stop");
        }
    }
}

/// Ownership handle to the tracks captured for one session
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    /// Add a track
    pub fn push(&mut self, track: Arc<LocalTrack>) {
        self.tracks.push(track);
    }

    /// All tracks, in acquisition order
    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// First track of the given kind
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Microphone track
    #[must_use]
    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.track(TrackKind::Audio)
    }

    /// Camera track
    #[must_use]
    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.track(TrackKind::Video)
    }

    /// Check if nothing was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Track ids, in acquisition order
    #[must_use]
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id().to_string()).collect()
    }

    /// Stop every track; returns how many devices this call released
    pub fn release_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

// ============================================================================
// Capture Adapter
// ============================================================================

/// Acquires local media for call sessions
#[derive(Clone)]
pub struct MediaCaptureAdapter {
    backend: Arc<dyn CaptureBackend>,
}

impl MediaCaptureAdapter {
    /// Create an adapter over a capture backend
    #[must_use]
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self { backend }
    }

    /// Get the capture backend
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CaptureBackend> {
        &self.backend
    }

    /// Acquire camera and/or microphone tracks matching the constraints
    ///
    /// Audio is acquired before video. If any acquisition fails, the tracks
    /// acquired so far are released before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first acquisition error
    #[tracing::instrument(skip(self), fields(backend = self.backend.backend_type()))]
    pub async fn acquire_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, MediaError> {
        let mut media = LocalMedia::default();
        for kind in constraints.to_track_kinds() {
            match self.acquire_track(kind).await {
                Ok(track) => media.push(track),
                Err(e) => {
                    let released = media.release_all();
                    tracing::warn!(
                        kind = %kind,
                        released,
                        error = %e,
                        "Media acquisition failed, released partial capture"
                    );
                    return Err(e);
                }
            }
        }
        tracing::debug!(tracks = media.tracks().len(), "User media acquired");
        Ok(media)
    }

    /// Acquire a screen capture track
    ///
    /// # Errors
    ///
    /// Returns error if the user declines or no display source exists
    pub async fn acquire_screen(&self) -> Result<Arc<LocalTrack>, MediaError> {
        self.acquire_track(TrackKind::ScreenShare).await
    }

    async fn acquire_track(&self, kind: TrackKind) -> Result<Arc<LocalTrack>, MediaError> {
        let handle = self.backend.acquire(kind).await?;
        let track = Arc::new(LocalTrack::new(kind, handle, Arc::clone(&self.backend)));
        tracing::info!(track_id = %track.id(), kind = %kind, "Local track acquired");
        Ok(track)
    }
}

// ============================================================================
// Synthetic Backend
// ============================================================================

#[derive(Debug, Default)]
struct SyntheticState {
    denied: HashSet<TrackKind>,
    missing: HashSet<TrackKind>,
    live: HashMap<String, TrackKind>,
    endings: HashMap<String, CancellationToken>,
    next_device: u64,
}

/// In-process capture backend
///
/// All modalities are available and granted by default. Acquisitions and
/// releases are counted so callers can check that nothing leaks and nothing
/// is released twice.
#[derive(Debug, Default)]
pub struct SyntheticCaptureBackend {
    state: Mutex<SyntheticState>,
    acquire_delay: Mutex<Option<Duration>>,
    acquired: AtomicU64,
    released: AtomicU64,
    unmatched_releases: AtomicU64,
}

impl SyntheticCaptureBackend {
    /// Create a backend with every device present and permitted
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse permission for a modality
    pub fn deny(&self, kind: TrackKind) {
        self.state.lock().denied.insert(kind);
    }

    /// Grant permission for a modality
    pub fn grant(&self, kind: TrackKind) {
        self.state.lock().denied.remove(&kind);
    }

    /// Remove the device for a modality
    pub fn remove_device(&self, kind: TrackKind) {
        self.state.lock().missing.insert(kind);
    }

    /// Plug the device for a modality back in
    pub fn restore_device(&self, kind: TrackKind) {
        self.state.lock().missing.remove(&kind);
    }

    /// End every live source of a modality, as the platform would when the
    /// user stops sharing from its own UI
    ///
    /// Returns the number of sources ended.
    pub fn end_source(&self, kind: TrackKind) -> usize {
        let state = self.state.lock();
        let mut ended = 0;
        for (device_id, live_kind) in &state.live {
            if *live_kind != kind {
                continue;
            }
            if let Some(token) = state.endings.get(device_id) {
                token.cancel();
                ended += 1;
            }
        }
        ended
    }

    /// Make every acquisition wait, as a permission prompt would
    pub fn set_acquire_delay(&self, delay: Option<Duration>) {
        *self.acquire_delay.lock() = delay;
    }

    /// Successful acquisitions so far
    #[must_use]
    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Releases that matched a live source
    #[must_use]
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Releases of unknown or already released sources
    #[must_use]
    pub fn unmatched_release_count(&self) -> u64 {
        self.unmatched_releases.load(Ordering::SeqCst)
    }

    /// Sources acquired and not yet released
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCaptureBackend {
    async fn acquire(&self, kind: TrackKind) -> Result<CaptureHandle, MediaError> {
        let delay = *self.acquire_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.missing.contains(&kind) {
            return Err(MediaError::DeviceUnavailable(kind));
        }
        if state.denied.contains(&kind) {
            return Err(MediaError::PermissionDenied(kind));
        }

        state.next_device += 1;
        let device_id = format!("synthetic-{}-{}", kind, state.next_device);
        state.live.insert(device_id.clone(), kind);
        self.acquired.fetch_add(1, Ordering::SeqCst);

        Ok(CaptureHandle {
            label: format!("Synthetic {kind} source"),
            device_id,
        })
    }

    fn release(&self, _kind: TrackKind, handle: &CaptureHandle) {
        let mut state = self.state.lock();
        state.endings.remove(&handle.device_id);
        if state.live.remove(&handle.device_id).is_some() {
            self.released.fetch_add(1, Ordering::SeqCst);
        } else {
            self.unmatched_releases.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(device_id = %handle.device_id, "Release of unknown capture source");
        }
    }

    fn source_ended(&self, handle: &CaptureHandle) -> CancellationToken {
        let token = CancellationToken::new();
        self.state
            .lock()
            .endings
            .insert(handle.device_id.clone(), token.clone());
        token
    }

    fn backend_type(&self) -> &'static str {
        "synthetic"
    }
}
