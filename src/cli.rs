// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for pipeline operations
//!
//! This module provides command-line functionality for:
//! - Listing V4L2 nodes and configured sensors
//! - Inspecting parameter blobs
//! - Printing the configuration
//! - Running the pipeline on the virtual device

use camera_pipeline::backends::camera::frame_loop::lock;
use camera_pipeline::backends::camera::memory::SharedMemory;
use camera_pipeline::backends::camera::v4l2_utils::{describe_capabilities, list_nodes as v4l2_nodes};
use camera_pipeline::backends::virtual_camera::VirtualProvider;
use camera_pipeline::constants::app_info;
use camera_pipeline::media::{ExifBuilder, SoftwareJpegEncoder};
use camera_pipeline::{Camera, Config, HostCallbacks, Parameters, camera_info, msg};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// List V4L2 nodes and the configured sensors
pub fn list_nodes(config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config)?;

    let nodes = v4l2_nodes();
    if nodes.is_empty() {
        println!("No V4L2 nodes found.");
    } else {
        println!("V4L2 nodes:");
        println!();
        for node in &nodes {
            println!("  {} {} ({})", node.path, node.card, node.driver);
            println!("      Capabilities: {}", describe_capabilities(node.capabilities));
        }
    }
    println!();

    println!("Configured sensors:");
    println!();
    for (index, preset) in config.presets.iter().enumerate() {
        let info = camera_info(&config, index)?;
        println!(
            "  [{}] {} ({:?}, mounted at {} degrees)",
            index, preset.name, info.facing, info.orientation
        );
        println!(
            "      Preview: {}, picture: {}, recording: {}",
            preset.params.preview_size, preset.params.picture_size, preset.params.recording_size
        );
    }

    Ok(())
}

/// Print every entry of a parameter blob with its type
pub fn print_params(
    config: Option<&Path>,
    blob: Option<&str>,
    preset: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let params = match blob {
        Some(text) => Parameters::parse(text)?,
        None => {
            let config = Config::load(config)?;
            Parameters::from_preset(config.preset(preset)?)
        }
    };

    let width = params.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, value) in params.iter() {
        println!("{:<width$}  {:<6}  {}", key, value.type_name(), value, width = width);
    }
    println!();
    println!("{} entries", params.len());

    Ok(())
}

/// Print the configuration as JSON
pub fn print_config(config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config)?;
    println!("{}", config.to_json()?);
    Ok(())
}

/// Host stand-in for the simulation
///
/// Recording frames are handed back to the main thread, which releases them:
/// the recording worker holds its slot while delivering.
struct SimulationHost {
    preview_frames: AtomicU64,
    picture: Mutex<Option<Vec<u8>>>,
    recording: Mutex<mpsc::Sender<u32>>,
    focused: AtomicBool,
}

impl HostCallbacks for SimulationHost {
    fn notify(&self, event: i32, arg1: i32, _arg2: i32) {
        match event {
            msg::FOCUS => self.focused.store(arg1 == 1, Ordering::SeqCst),
            msg::ERROR => eprintln!("Camera error {}", arg1),
            _ => {}
        }
    }

    fn data(&self, event: i32, memory: &Arc<dyn SharedMemory>, _index: u32) {
        match event {
            msg::PREVIEW_FRAME => {
                self.preview_frames.fetch_add(1, Ordering::SeqCst);
            }
            msg::COMPRESSED_IMAGE => {
                let bytes = memory.read(0, memory.len()).map(<[u8]>::to_vec);
                *lock(&self.picture) = bytes;
            }
            _ => {}
        }
    }

    fn data_timestamp(
        &self,
        _timestamp_ns: i64,
        _event: i32,
        _memory: &Arc<dyn SharedMemory>,
        index: u32,
    ) {
        // The receiver only goes away once recording is over
        let _ = lock(&self.recording).send(index);
    }
}

/// Run preview, one picture and a recording on the virtual device
pub fn simulate(
    config: Option<&Path>,
    preset: usize,
    duration: u64,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config)?;
    let sensor = config.preset(preset)?;
    println!("camera-pipeline {}", app_info::version());
    println!("Simulating sensor: {}", sensor.name);

    let provider = Arc::new(VirtualProvider::new(config.controls));
    let camera = Camera::open(
        &config,
        preset,
        provider.clone(),
        Arc::new(provider.allocator()),
        Some(Arc::new(provider.contiguous())),
        Arc::new(SoftwareJpegEncoder::new()),
        Arc::new(ExifBuilder::new()),
    )?;

    let (sender, receiver) = mpsc::channel();
    let host = Arc::new(SimulationHost {
        preview_frames: AtomicU64::new(0),
        picture: Mutex::new(None),
        recording: Mutex::new(sender),
        focused: AtomicBool::new(false),
    });
    camera.set_callbacks(Some(host.clone()));
    camera.enable_msg_type(msg::ALL);

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    // Preview
    camera.start_preview()?;
    std::thread::sleep(Duration::from_millis(500));
    println!(
        "Preview: {} frames",
        host.preview_frames.load(Ordering::SeqCst)
    );

    // Focus, then picture
    camera.auto_focus()?;
    let start = Instant::now();
    while !host.focused.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("Capturing...");
    camera.take_picture()?;
    let start = Instant::now();
    let picture = loop {
        if let Some(bytes) = lock(&host.picture).take() {
            break bytes;
        }
        if start.elapsed() > Duration::from_secs(30) || stop_flag.load(Ordering::SeqCst) {
            return Err("No picture received".into());
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    let output_path = match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            path
        }
        None => {
            let dir = get_default_picture_dir();
            std::fs::create_dir_all(&dir)?;
            let timestamp = Local::now().format("%Y%m%d_%H%M%S");
            dir.join(format!("picture_{}.jpg", timestamp))
        }
    };
    std::fs::write(&output_path, &picture)?;
    println!("Picture saved: {} ({} bytes)", output_path.display(), picture.len());

    // Recording through metadata records
    camera.store_metadata_in_buffers(true)?;
    camera.start_recording()?;
    println!();
    println!("Recording... (press Ctrl+C to stop early)");

    let start = Instant::now();
    let target_duration = Duration::from_secs(duration);
    let mut frames = 0u64;
    while start.elapsed() < target_duration {
        if stop_flag.load(Ordering::SeqCst) {
            println!();
            println!("Stopping early...");
            break;
        }

        while let Ok(index) = receiver.try_recv() {
            frames += 1;
            camera.release_recording_frame(index)?;
        }

        let elapsed = start.elapsed().as_secs();
        print!("\rRecording: {:02}:{:02}, {} frames", elapsed / 60, elapsed % 60, frames);
        std::io::Write::flush(&mut std::io::stdout())?;

        std::thread::sleep(Duration::from_millis(20));
    }
    println!();

    camera.stop_recording()?;
    camera.stop_preview()?;
    println!();
    print!("{}", camera.dump());
    camera.release();

    Ok(())
}

fn get_default_picture_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("camera-pipeline")
}
