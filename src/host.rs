// SPDX-License-Identifier: GPL-3.0-only

//! Host callback surface
//!
//! The host registers a [`HostCallbacks`] implementation and a message mask.
//! Pipelines never call the host directly; they go through [`HostBridge`],
//! which drops events the host did not enable and everything raised while the
//! host itself is starting or stopping a path.

use crate::backends::camera::frame_loop::lock;
use crate::backends::camera::memory::SharedMemory;
use crate::backends::camera::types::{Geometry, PixelFormat};
use crate::errors::CameraResult;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Message bits of the host callback surface
pub mod msg {
    pub const ERROR: i32 = 0x001;
    pub const SHUTTER: i32 = 0x002;
    pub const FOCUS: i32 = 0x004;
    pub const ZOOM: i32 = 0x008;
    pub const PREVIEW_FRAME: i32 = 0x010;
    pub const VIDEO_FRAME: i32 = 0x020;
    pub const POSTVIEW_FRAME: i32 = 0x040;
    pub const RAW_IMAGE: i32 = 0x080;
    pub const COMPRESSED_IMAGE: i32 = 0x100;
    pub const RAW_IMAGE_NOTIFY: i32 = 0x200;
    pub const PREVIEW_METADATA: i32 = 0x400;
    pub const FOCUS_MOVE: i32 = 0x800;
    pub const ALL: i32 = 0xfff;

    /// Name of a single message bit
    pub fn name(event: i32) -> &'static str {
        match event {
            ERROR => "error",
            SHUTTER => "shutter",
            FOCUS => "focus",
            ZOOM => "zoom",
            PREVIEW_FRAME => "preview-frame",
            VIDEO_FRAME => "video-frame",
            POSTVIEW_FRAME => "postview-frame",
            RAW_IMAGE => "raw-image",
            COMPRESSED_IMAGE => "compressed-image",
            RAW_IMAGE_NOTIFY => "raw-image-notify",
            PREVIEW_METADATA => "preview-metadata",
            FOCUS_MOVE => "focus-move",
            _ => "unknown",
        }
    }
}

/// Events delivered to the host
pub trait HostCallbacks: Send + Sync {
    fn notify(&self, event: i32, arg1: i32, arg2: i32);

    /// Buffer `index` of `memory` carries `event` data
    fn data(&self, event: i32, memory: &Arc<dyn SharedMemory>, index: u32);

    fn data_timestamp(
        &self,
        timestamp_ns: i64,
        event: i32,
        memory: &Arc<dyn SharedMemory>,
        index: u32,
    );
}

/// Display surface for preview frames
pub trait PreviewWindow: Send + Sync {
    /// Size the surface buffers for frames of `geometry`
    fn set_geometry(&self, geometry: Geometry, format: PixelFormat) -> CameraResult<()>;

    /// Show one frame
    fn post(&self, frame: &[u8], geometry: Geometry, format: PixelFormat) -> CameraResult<()>;
}

/// Routes pipeline events to the host
#[derive(Default)]
pub struct HostBridge {
    callbacks: RwLock<Option<Arc<dyn HostCallbacks>>>,
    messages: AtomicI32,
    callback_lock: AtomicBool,
    window: Mutex<Option<Arc<dyn PreviewWindow>>>,
}

/// Suppresses host callbacks until dropped
pub struct CallbackLock<'a> {
    bridge: &'a HostBridge,
}

impl Drop for CallbackLock<'_> {
    fn drop(&mut self) {
        self.bridge.callback_lock.store(false, Ordering::SeqCst);
    }
}

impl HostBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callbacks(&self, callbacks: Option<Arc<dyn HostCallbacks>>) {
        *self
            .callbacks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = callbacks;
    }

    pub fn enable_msg_type(&self, mask: i32) {
        self.messages.fetch_or(mask, Ordering::SeqCst);
    }

    pub fn disable_msg_type(&self, mask: i32) {
        self.messages.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Enabled bits among `mask`
    pub fn msg_type_enabled(&self, mask: i32) -> i32 {
        self.messages.load(Ordering::SeqCst) & mask
    }

    /// Hold callbacks back while the host drives a path
    pub fn lock_callbacks(&self) -> CallbackLock<'_> {
        self.callback_lock.store(true, Ordering::SeqCst);
        CallbackLock { bridge: self }
    }

    pub fn callbacks_locked(&self) -> bool {
        self.callback_lock.load(Ordering::SeqCst)
    }

    pub fn set_window(&self, window: Option<Arc<dyn PreviewWindow>>) {
        *lock(&self.window) = window;
    }

    pub fn window(&self) -> Option<Arc<dyn PreviewWindow>> {
        lock(&self.window).clone()
    }

    /// Callbacks to use for `event`, if it may be delivered now
    fn target(&self, event: i32) -> Option<Arc<dyn HostCallbacks>> {
        if self.msg_type_enabled(event) == 0 {
            return None;
        }
        if self.callbacks_locked() {
            debug!(event = msg::name(event), "Callback suppressed while host holds the lock");
            return None;
        }
        self.callbacks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn notify(&self, event: i32, arg1: i32, arg2: i32) {
        if let Some(callbacks) = self.target(event) {
            callbacks.notify(event, arg1, arg2);
        }
    }

    pub fn data(&self, event: i32, memory: &Arc<dyn SharedMemory>, index: u32) {
        if let Some(callbacks) = self.target(event) {
            callbacks.data(event, memory, index);
        }
    }

    /// Returns whether the host received the buffer
    pub fn data_timestamp(
        &self,
        timestamp_ns: i64,
        event: i32,
        memory: &Arc<dyn SharedMemory>,
        index: u32,
    ) -> bool {
        match self.target(event) {
            Some(callbacks) => {
                callbacks.data_timestamp(timestamp_ns, event, memory, index);
                true
            }
            None => false,
        }
    }
}

/// One event received by an [`EventRecorder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Notify { event: i32, arg1: i32, arg2: i32 },
    Data { event: i32, index: u32, payload: Vec<u8> },
    DataTimestamp { timestamp_ns: i64, event: i32, index: u32, payload: Vec<u8> },
}

impl HostEvent {
    pub fn event(&self) -> i32 {
        match self {
            HostEvent::Notify { event, .. }
            | HostEvent::Data { event, .. }
            | HostEvent::DataTimestamp { event, .. } => *event,
        }
    }
}

/// Host stand-in that keeps a copy of everything it receives
///
/// Data payloads are copied from buffer `index` of the memory, assuming
/// equally sized buffers: the whole mapping when `index` is 0 and the mapping
/// holds one buffer, otherwise `buffer_size` bytes.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<HostEvent>>,
    buffer_size: Option<usize>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `buffer_size` bytes per indexed buffer
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            buffer_size: Some(buffer_size),
        }
    }

    pub fn events(&self) -> Vec<HostEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, event: i32) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.event() == event)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    fn payload(&self, memory: &Arc<dyn SharedMemory>, index: u32) -> Vec<u8> {
        let size = self.buffer_size.unwrap_or(memory.len());
        memory
            .read(index as usize * size, size)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }
}

impl HostCallbacks for EventRecorder {
    fn notify(&self, event: i32, arg1: i32, arg2: i32) {
        lock(&self.events).push(HostEvent::Notify { event, arg1, arg2 });
    }

    fn data(&self, event: i32, memory: &Arc<dyn SharedMemory>, index: u32) {
        let payload = self.payload(memory, index);
        lock(&self.events).push(HostEvent::Data {
            event,
            index,
            payload,
        });
    }

    fn data_timestamp(
        &self,
        timestamp_ns: i64,
        event: i32,
        memory: &Arc<dyn SharedMemory>,
        index: u32,
    ) {
        let payload = self.payload(memory, index);
        lock(&self.events).push(HostEvent::DataTimestamp {
            timestamp_ns,
            event,
            index,
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_gates_events() {
        let bridge = HostBridge::new();
        let recorder = Arc::new(EventRecorder::new());
        bridge.set_callbacks(Some(recorder.clone()));

        bridge.notify(msg::FOCUS, 1, 0);
        assert!(recorder.events().is_empty());

        bridge.enable_msg_type(msg::FOCUS | msg::SHUTTER);
        assert_eq!(bridge.msg_type_enabled(msg::ALL), msg::FOCUS | msg::SHUTTER);
        bridge.notify(msg::FOCUS, 1, 0);
        assert_eq!(
            recorder.events(),
            vec![HostEvent::Notify {
                event: msg::FOCUS,
                arg1: 1,
                arg2: 0
            }]
        );

        bridge.disable_msg_type(msg::FOCUS);
        bridge.notify(msg::FOCUS, 1, 0);
        assert_eq!(recorder.count(msg::FOCUS), 1);
    }

    #[test]
    fn test_callback_lock_suppresses() {
        let bridge = HostBridge::new();
        let recorder = Arc::new(EventRecorder::new());
        bridge.set_callbacks(Some(recorder.clone()));
        bridge.enable_msg_type(msg::ALL);

        {
            let _guard = bridge.lock_callbacks();
            assert!(bridge.callbacks_locked());
            bridge.notify(msg::SHUTTER, 0, 0);
        }
        assert!(!bridge.callbacks_locked());
        bridge.notify(msg::SHUTTER, 0, 0);
        assert_eq!(recorder.count(msg::SHUTTER), 1);
    }

    #[test]
    fn test_no_callbacks_is_silent() {
        let bridge = HostBridge::new();
        bridge.enable_msg_type(msg::ALL);
        bridge.notify(msg::ERROR, -1, 0);
    }

    #[test]
    fn test_message_names() {
        assert_eq!(msg::name(msg::COMPRESSED_IMAGE), "compressed-image");
        assert_eq!(msg::name(0x3), "unknown");
    }
}
