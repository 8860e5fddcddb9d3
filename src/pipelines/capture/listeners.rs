// SPDX-License-Identifier: GPL-3.0-only

//! Listener registry and session negotiation
//!
//! Listeners are kept in registration order. Negotiation walks them in that
//! order and keeps a running maximum, so the first listener reaching the
//! largest geometry decides the session format.

use crate::backends::camera::frame_loop::BusyFlag;
use crate::backends::camera::types::{FrameBuffer, Geometry, PixelFormat};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Frame callback of a listener
///
/// Runs on the dispatch thread with the engine lock held. It must return
/// quickly and must never call back into the engine (register, unregister or
/// anything else taking the engine lock), or the dispatch thread deadlocks.
/// Work is handed to the listener's own worker; the busy flag keeps the
/// hardware slot alive until that worker is done with it.
pub type ListenerCallback = Arc<dyn Fn(&[FrameBuffer]) + Send + Sync>;

/// Stable handle of a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A registered consumer of capture buffers
pub struct Listener {
    pub id: ListenerId,
    pub geometry: Geometry,
    pub format: PixelFormat,
    pub busy: Arc<BusyFlag>,
    callback: ListenerCallback,
}

impl Listener {
    pub fn invoke(&self, buffers: &[FrameBuffer]) {
        (self.callback)(buffers)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("geometry", &self.geometry)
            .field("format", &self.format)
            .field("busy", &self.busy.is_busy())
            .finish()
    }
}

/// Session shape agreed on by the listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub geometry: Geometry,
    pub format: PixelFormat,
}

impl fmt::Display for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.geometry, self.format)
    }
}

/// Insertion-ordered listener list
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Listener>,
    next_id: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener and return its handle
    pub fn add(
        &mut self,
        geometry: Geometry,
        format: PixelFormat,
        busy: Arc<BusyFlag>,
        callback: ListenerCallback,
    ) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        self.listeners.push(Listener {
            id,
            geometry,
            format,
            busy,
            callback,
        });
        id
    }

    /// Remove a listener, returning whether it was registered
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.id != id);
        self.listeners.len() != before
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.iter().any(|listener| listener.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.iter()
    }

    /// Hand `buffers` to every listener in registration order
    pub fn dispatch(&self, buffers: &[FrameBuffer]) {
        for listener in &self.listeners {
            listener.invoke(buffers);
        }
    }

    /// Wait for every busy flag to clear, up to `deadline`
    ///
    /// Returns false if one was still set at the deadline.
    pub fn wait_idle(&self, deadline: Instant) -> bool {
        self.listeners
            .iter()
            .all(|listener| listener.busy.wait_clear_until(deadline))
    }

    /// Session shape covering every listener
    ///
    /// A candidate replaces the running maximum when it is at least as large
    /// in both dimensions. When the winner is a picture listener that gave no
    /// usable size, `preview` is used instead.
    ///
    /// Returns `None` for an empty registry.
    pub fn negotiate(&self, preview: Geometry, picture_format: PixelFormat) -> Option<Negotiated> {
        let first = self.listeners.first()?;

        let mut geometry = Geometry::default();
        let mut format = first.format;

        for listener in &self.listeners {
            if listener.geometry.covers(geometry) {
                geometry = listener.geometry;
                format = listener.format;
            }
        }

        if geometry.is_empty() && (format.is_compressed() || format == picture_format) {
            geometry = preview;
        }

        Some(Negotiated { geometry, format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ListenerCallback {
        Arc::new(|_: &[FrameBuffer]| {})
    }

    fn add(registry: &mut ListenerRegistry, w: u32, h: u32, format: PixelFormat) -> ListenerId {
        registry.add(Geometry::new(w, h), format, Arc::new(BusyFlag::new()), noop())
    }

    const PREVIEW: Geometry = Geometry::new(1024, 768);

    #[test]
    fn test_empty_registry() {
        let registry = ListenerRegistry::new();
        assert_eq!(registry.negotiate(PREVIEW, PixelFormat::Yuyv), None);
    }

    #[test]
    fn test_elementwise_maximum() {
        let mut registry = ListenerRegistry::new();
        add(&mut registry, 640, 480, PixelFormat::Nv21);
        add(&mut registry, 1280, 960, PixelFormat::Jpeg);

        let negotiated = registry.negotiate(PREVIEW, PixelFormat::Yuyv).unwrap();
        assert_eq!(negotiated.geometry, Geometry::new(1280, 960));
        assert_eq!(negotiated.format, PixelFormat::Jpeg);
    }

    #[test]
    fn test_last_seen_tie_break() {
        let mut registry = ListenerRegistry::new();
        add(&mut registry, 1280, 720, PixelFormat::Nv21);
        add(&mut registry, 1280, 720, PixelFormat::Nv12);

        // Equal candidates still replace the running maximum
        let negotiated = registry.negotiate(PREVIEW, PixelFormat::Yuyv).unwrap();
        assert_eq!(negotiated.format, PixelFormat::Nv12);

        // A wider but shorter candidate does not
        let mut registry = ListenerRegistry::new();
        add(&mut registry, 1280, 720, PixelFormat::Nv21);
        add(&mut registry, 1920, 400, PixelFormat::Nv12);
        let negotiated = registry.negotiate(PREVIEW, PixelFormat::Yuyv).unwrap();
        assert_eq!(negotiated.geometry, Geometry::new(1280, 720));
        assert_eq!(negotiated.format, PixelFormat::Nv21);
    }

    #[test]
    fn test_compressed_only_falls_back_to_preview() {
        let mut registry = ListenerRegistry::new();
        add(&mut registry, 0, 0, PixelFormat::Jpeg);

        let negotiated = registry.negotiate(PREVIEW, PixelFormat::Yuyv).unwrap();
        assert_eq!(negotiated.geometry, PREVIEW);
        assert_eq!(negotiated.format, PixelFormat::Jpeg);
    }

    #[test]
    fn test_picture_format_without_size_falls_back() {
        let mut registry = ListenerRegistry::new();
        add(&mut registry, 0, 0, PixelFormat::Yuyv);
        let negotiated = registry.negotiate(PREVIEW, PixelFormat::Yuyv).unwrap();
        assert_eq!(negotiated.geometry, PREVIEW);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut registry = ListenerRegistry::new();
        let a = add(&mut registry, 640, 480, PixelFormat::Nv21);
        let b = add(&mut registry, 1280, 960, PixelFormat::Jpeg);
        let c = add(&mut registry, 320, 240, PixelFormat::Nv21);

        assert!(registry.remove(b));
        assert!(!registry.remove(b));
        let ids: Vec<ListenerId> = registry.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![a, c]);

        let negotiated = registry.negotiate(PREVIEW, PixelFormat::Yuyv).unwrap();
        assert_eq!(negotiated.geometry, Geometry::new(640, 480));
    }

    #[test]
    fn test_wait_idle() {
        let mut registry = ListenerRegistry::new();
        let busy = Arc::new(BusyFlag::new());
        registry.add(Geometry::new(8, 8), PixelFormat::Nv21, Arc::clone(&busy), noop());

        assert!(registry.wait_idle(Instant::now()));
        assert!(busy.try_set());
        assert!(!registry.wait_idle(Instant::now() + std::time::Duration::from_millis(5)));
    }
}
