//! Simulated depth camera producing deterministic synthetic frames.
//!
//! The scene is a tilted plane in front of the sensor: depth grows linearly
//! with the pixel coordinates and every pixel shares the plane normal.
//! Faults (stalled frames, disconnects) and recorded-sequence playback are
//! configurable so the capture pipeline can be exercised without hardware.

use crate::camera::Camera;
use crate::mat::{Mat, TextureData, is_gray_view};
use crate::types::{ErrorCode, Measure, MemoryKind, Resolution, View};
use glam::{UVec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Depth at the top-left pixel, in meters.
const BASE_DEPTH: f32 = 1.5;
/// Depth increase per native pixel along x and y.
const DEPTH_SLOPE: (f32, f32) = (0.002, 0.004);
/// Baseline times focal length used for disparity.
const DISPARITY_SCALE: f32 = 60.0;

/// Simulated camera settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedCameraConfig {
    /// Native sensor resolution.
    pub resolution: UVec2,
    /// Frames per second, used for timestamps and pacing.
    pub frame_rate: f32,
    /// Block in `grab` until the next frame is due.
    pub pace: bool,
    /// Every Nth grab reports `NotANewFrame`.
    pub not_new_frame_every: Option<u32>,
    /// Report a disconnect after this many frames.
    pub disconnect_after: Option<u64>,
    /// Play back a recording of this many frames instead of live capture.
    pub playback_frames: Option<usize>,
    /// Timestamp of frame zero, in nanoseconds.
    pub start_timestamp: u64,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        Self {
            resolution: UVec2::new(64, 48),
            frame_rate: 60.0,
            pace: false,
            not_new_frame_every: None,
            disconnect_after: None,
            playback_frames: None,
            start_timestamp: 1_000_000_000,
        }
    }
}

/// A camera backed by the synthetic plane scene.
#[derive(Debug)]
pub struct SimulatedCamera {
    config: SimulatedCameraConfig,
    period: Duration,
    grabs: u64,
    frames: u64,
    frame_index: u64,
    timestamp: u64,
    next_position: usize,
    position: Option<usize>,
    laps: u64,
    recorded: usize,
    connected: bool,
    next_deadline: Option<Instant>,
}

impl SimulatedCamera {
    pub fn new(config: SimulatedCameraConfig) -> Self {
        let period = if config.frame_rate.is_finite() && config.frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / f64::from(config.frame_rate))
        } else {
            Duration::from_millis(16)
        };
        info!(
            "Simulated camera {}x{} at {} fps{}",
            config.resolution.x,
            config.resolution.y,
            config.frame_rate,
            if config.playback_frames.is_some() {
                " (playback)"
            } else {
                ""
            }
        );

        Self {
            config,
            period,
            grabs: 0,
            frames: 0,
            frame_index: 0,
            timestamp: 0,
            next_position: 0,
            position: None,
            laps: 0,
            recorded: 0,
            connected: true,
            next_deadline: None,
        }
    }

    /// Frames appended by `record_frame`.
    pub fn recorded_frames(&self) -> usize {
        self.recorded
    }

    /// Depth of the scene at a native pixel.
    pub fn depth_at(pixel: Vec3) -> f32 {
        BASE_DEPTH + DEPTH_SLOPE.0 * pixel.x + DEPTH_SLOPE.1 * pixel.y + pixel.z
    }

    /// Unit normal of the scene plane, facing the sensor.
    pub fn plane_normal() -> Vec3 {
        Vec3::new(-DEPTH_SLOPE.0, -DEPTH_SLOPE.1, -1.0).normalize()
    }

    fn pace(&mut self) {
        if !self.config.pace {
            return;
        }
        let now = Instant::now();
        let deadline = *self.next_deadline.get_or_insert(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + self.period);
    }

    fn frame_timestamp(&self, index: u64) -> u64 {
        self.config.start_timestamp + index * self.period.as_nanos() as u64
    }

    /// Small per-frame depth drift so consecutive frames differ.
    fn frame_offset(&self) -> f32 {
        (self.frame_index % 10) as f32 * 0.001
    }

    fn check_ready(&self) -> Result<(), ErrorCode> {
        if !self.connected {
            return Err(ErrorCode::CameraNotDetected);
        }
        if self.timestamp == 0 {
            return Err(ErrorCode::CameraNotInitialized);
        }
        Ok(())
    }

    /// Native coordinates sampled by output pixel `(x, y)`.
    fn native_pixel(&self, x: u32, y: u32, resolution: Resolution) -> (f32, f32) {
        let native = self.config.resolution.as_vec2();
        let scale = native / resolution.as_vec2();
        (x as f32 * scale.x, y as f32 * scale.y)
    }

    fn fill<P: Copy + Default + Send + Sync + 'static>(
        &self,
        mat: &mut Mat<P>,
        memory: MemoryKind,
        resolution: Resolution,
        mut pixel: impl FnMut(f32, f32) -> P,
    ) -> Result<(), ErrorCode> {
        mat.ensure(memory, resolution)?;
        let width = resolution.x as usize;
        for (index, value) in mat.buffer_mut(memory).iter_mut().enumerate() {
            let x = (index % width) as u32;
            let y = (index / width) as u32;
            let (nx, ny) = self.native_pixel(x, y, resolution);
            *value = pixel(nx, ny);
        }
        mat.set_timestamp(self.timestamp);
        Ok(())
    }
}

impl Camera for SimulatedCamera {
    fn grab(&mut self) -> ErrorCode {
        self.grabs += 1;
        if !self.connected {
            return ErrorCode::CameraNotDetected;
        }
        if self
            .config
            .disconnect_after
            .is_some_and(|limit| self.frames >= limit)
        {
            self.connected = false;
            return ErrorCode::CameraNotDetected;
        }

        self.pace();

        if self
            .config
            .not_new_frame_every
            .is_some_and(|every| every > 0 && self.grabs % u64::from(every) == 0)
        {
            return ErrorCode::NotANewFrame;
        }

        if let Some(len) = self.config.playback_frames {
            if self.next_position >= len {
                return ErrorCode::EndOfSvoFile;
            }
            let position = self.next_position;
            self.position = Some(position);
            self.next_position = position + 1;
            self.frame_index = position as u64;
            self.timestamp = self.frame_timestamp(self.laps * len as u64 + self.frame_index + 1);
        } else {
            self.frame_index = self.frames;
            self.timestamp = self.frame_timestamp(self.frame_index + 1);
        }

        self.frames += 1;
        ErrorCode::Success
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn native_resolution(&self) -> Resolution {
        self.config.resolution
    }

    fn retrieve_image(
        &mut self,
        target: &mut Mat<[u8; 4]>,
        view: View,
        memory: MemoryKind,
        resolution: Resolution,
    ) -> Result<(), ErrorCode> {
        self.check_ready()?;
        if resolution.x == 0 || resolution.y == 0 {
            return Err(ErrorCode::InvalidResolution);
        }

        let native = self.config.resolution.as_vec2();
        let shade = (self.frame_index % 256) as u8;
        let shift = if matches!(view, View::Right | View::RightGray) {
            4.0
        } else {
            0.0
        };
        let gray = is_gray_view(view);

        self.fill(target, memory, resolution, |x, y| {
            let r = (((x + shift) / native.x).min(1.0) * 255.0) as u8;
            let g = ((y / native.y).min(1.0) * 255.0) as u8;
            match view {
                View::Depth => {
                    let depth = SimulatedCamera::depth_at(Vec3::new(x, y, 0.0));
                    let level = (255.0 / depth) as u8;
                    [level, level, level, 255]
                }
                View::Confidence => [255, 255, 255, 255],
                View::Normals => [127, 127, 255, 255],
                _ if gray => {
                    let luma = ((u16::from(r) + u16::from(g) + u16::from(shade)) / 3) as u8;
                    [luma, luma, luma, 255]
                }
                _ => [r, g, shade, 255],
            }
        })
    }

    fn retrieve_measure(
        &mut self,
        target: &mut TextureData,
        measure: Measure,
        memory: MemoryKind,
        resolution: Resolution,
    ) -> Result<(), ErrorCode> {
        self.check_ready()?;
        if resolution.x == 0 || resolution.y == 0 {
            return Err(ErrorCode::InvalidResolution);
        }

        let offset = self.frame_offset();
        let normal = Self::plane_normal();
        match (measure, target) {
            (Measure::Depth | Measure::DepthRight, TextureData::F32(mat)) => {
                self.fill(mat, memory, resolution, |x, y| {
                    Self::depth_at(Vec3::new(x, y, offset))
                })?;
            }
            (Measure::Disparity, TextureData::F32(mat)) => {
                self.fill(mat, memory, resolution, |x, y| {
                    DISPARITY_SCALE / Self::depth_at(Vec3::new(x, y, offset))
                })?;
            }
            (Measure::Confidence, TextureData::F32(mat)) => {
                self.fill(mat, memory, resolution, |_, _| 100.0)?;
            }
            (Measure::Normals | Measure::NormalsRight, TextureData::F32x4(mat)) => {
                self.fill(mat, memory, resolution, |_, _| normal.extend(0.0))?;
            }
            (Measure::Xyz, TextureData::F32x4(mat)) => {
                self.fill(mat, memory, resolution, |x, y| {
                    let depth = Self::depth_at(Vec3::new(x, y, offset));
                    Vec4::new(x * 0.001 * depth, y * 0.001 * depth, depth, 0.0)
                })?;
            }
            _ => return Err(ErrorCode::InvalidFunctionParameters),
        }
        Ok(())
    }

    fn playback_len(&self) -> Option<usize> {
        self.config.playback_frames
    }

    fn playback_position(&self) -> Option<usize> {
        self.position
    }

    fn set_playback_position(&mut self, position: usize) {
        if let Some(len) = self.config.playback_frames {
            // Rewinding starts a new lap so timestamps keep increasing.
            if self.position.is_some_and(|current| position < current) {
                self.laps += 1;
            }
            self.next_position = position.min(len);
            debug!("Playback position set to {}", self.next_position);
        }
    }

    fn record_frame(&mut self) -> Result<(), ErrorCode> {
        self.check_ready()?;
        self.recorded += 1;
        Ok(())
    }
}
