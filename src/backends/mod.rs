// SPDX-License-Identifier: MPL-2.0

//! Backend abstraction layer for the sensor nodes
//!
//! This module provides the device control channel the pipelines run on:
//! - V4L2 nodes through ioctls
//! - An in-memory device for tests and simulation
//!
//! # Architecture
//!
//! The backend layer abstracts hardware access, providing a consistent API
//! regardless of the underlying nodes:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Pipeline Layer                │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                  │
//! │  ┌──────────────────┐  ┌─────────────────┐  │
//! │  │      Camera      │  │ Virtual Camera  │  │
//! │  │      (V4L2)      │  │   (in-memory)   │  │
//! │  └──────────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`camera`]: Device trait, V4L2 implementation, memory and worker primitives
//! - [`virtual_camera`]: In-memory nodes and allocators

pub mod camera;
pub mod virtual_camera;
