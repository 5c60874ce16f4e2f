// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! ONNX cavity detector
//!
//! Runs a YOLO-family detection model over an uploaded photo and returns
//! bounding boxes plus an annotated copy of the image. A submission photo is
//! only stored and indexed when at least one detection comes back.

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use ndarray::{Array4, Axis};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const INPUT_SIZE: u32 = 640;
const CONFIDENCE_THRESHOLD: f32 = 0.25;
const IOU_THRESHOLD: f32 = 0.45;
const BOX_COLOR: Rgb<u8> = Rgb([220, 30, 30]);
const BOX_THICKNESS: u32 = 3;

/// One detection in source-image pixel coordinates
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

pub struct CavityDetector {
    session: Arc<Mutex<Session>>,
}

impl std::fmt::Debug for CavityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CavityDetector").finish_non_exhaustive()
    }
}

impl CavityDetector {
    /// Loads the detection model. Failure is fatal at startup.
    pub fn load(model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            anyhow::bail!("detector model file not found: {}", model_path.display());
        }

        let session = Session::builder()
            .context("failed to create session builder")?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .context("failed to set CPU execution provider")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to set optimization level")?
            .with_intra_threads(4)
            .context("failed to set intra threads")?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to load detector model from {}", model_path.display())
            })?;

        info!("cavity detection model loaded");
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
        })
    }

    /// Runs detection over an RGB image and returns confidence-filtered,
    /// NMS-deduplicated boxes in source coordinates.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let (source_width, source_height) = (image.width() as f32, image.height() as f32);
        let input = preprocess(image);

        let mut session = self.session.lock().unwrap();
        let outputs = session.run(ort::inputs![
            "images" => Value::from_array(input)?
        ])?;

        let output = outputs[0]
            .try_extract_array::<f32>()
            .context("failed to extract detection tensor")?;
        let shape = output.shape().to_vec();
        // [1, 4 + classes, candidates]
        if shape.len() != 3 || shape[1] < 5 {
            anyhow::bail!("detector output has unexpected shape {:?}", shape);
        }

        let view = output.index_axis(Axis(0), 0);
        let num_classes = shape[1] - 4;
        let candidates = shape[2];
        let scale_x = source_width / INPUT_SIZE as f32;
        let scale_y = source_height / INPUT_SIZE as f32;

        let mut detections = Vec::new();
        for j in 0..candidates {
            let mut confidence = 0.0f32;
            let mut class_id = 0usize;
            for c in 0..num_classes {
                let score = view[[4 + c, j]];
                if score > confidence {
                    confidence = score;
                    class_id = c;
                }
            }
            if confidence < CONFIDENCE_THRESHOLD {
                continue;
            }

            let cx = view[[0, j]];
            let cy = view[[1, j]];
            let w = view[[2, j]];
            let h = view[[3, j]];
            detections.push(Detection {
                x1: ((cx - w / 2.0) * scale_x).clamp(0.0, source_width),
                y1: ((cy - h / 2.0) * scale_y).clamp(0.0, source_height),
                x2: ((cx + w / 2.0) * scale_x).clamp(0.0, source_width),
                y2: ((cy + h / 2.0) * scale_y).clamp(0.0, source_height),
                confidence,
                class_id,
            });
        }

        let kept = non_max_suppression(detections);
        debug!(detections = kept.len(), "detection pass complete");
        Ok(kept)
    }
}

/// Resize to the fixed model input and scale pixels to [0, 1],
/// `[1, 3, 640, 640]` layout.
fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let resized = image
        .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
        .to_rgb8();

    let size = INPUT_SIZE as usize;
    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] = pixel.0[channel] as f32 / 255.0;
        }
    }
    input
}

/// Greedy NMS: keep the highest-confidence box, drop overlapping boxes of
/// the same class above the IoU threshold.
fn non_max_suppression(mut detections: Vec<Detection>) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in detections {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && iou(k, &candidate) > IOU_THRESHOLD);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Draws detection boxes on a copy of the image.
pub fn annotate(image: &DynamicImage, detections: &[Detection]) -> DynamicImage {
    let mut canvas = image.to_rgb8();
    for detection in detections {
        draw_box(&mut canvas, detection);
    }
    DynamicImage::ImageRgb8(canvas)
}

fn draw_box(canvas: &mut RgbImage, detection: &Detection) {
    let (width, height) = (canvas.width(), canvas.height());
    if width == 0 || height == 0 {
        return;
    }
    let x1 = (detection.x1 as u32).min(width - 1);
    let y1 = (detection.y1 as u32).min(height - 1);
    let x2 = (detection.x2 as u32).min(width - 1);
    let y2 = (detection.y2 as u32).min(height - 1);

    for t in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            put_pixel_checked(canvas, x, y1.saturating_add(t));
            put_pixel_checked(canvas, x, y2.saturating_sub(t));
        }
        for y in y1..=y2 {
            put_pixel_checked(canvas, x1.saturating_add(t), y);
            put_pixel_checked(canvas, x2.saturating_sub(t), y);
        }
    }
}

fn put_pixel_checked(canvas: &mut RgbImage, x: u32, y: u32) {
    if x < canvas.width() && y < canvas.height() {
        canvas.put_pixel(x, y, BOX_COLOR);
    }
}
