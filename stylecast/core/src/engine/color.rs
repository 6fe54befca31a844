//! Colour Statistics Transfer Engine
//!
//! A built-in [`StyleEngine`] that works directly in pixel space. It imposes
//! the colour statistics of the style image on the content frame:
//!
//! - `adain`: per-channel mean and standard deviation matching, blended with
//!   the untouched frame by `style_strength`
//! - `sanet`: per-channel mean shift plus a single luminance contrast match
//!
//! Both inputs are downsized so their longest edge fits `max_dimension`
//! before statistics are taken. Output is always JPEG.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};

use super::{EngineError, StyleEngine, TransformRequest};

/// Model label for full mean/std matching
pub const MODEL_ADAIN: &str = "adain";

/// Model label for mean shift with luminance contrast match
pub const MODEL_SANET: &str = "sanet";

const MIN_DEVIATION: f32 = 1e-3;

/// Configuration for [`ColorTransferEngine`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorTransferConfig {
    /// Blend factor between original (0.0) and fully styled (1.0)
    pub style_strength: f32,
    /// Longest edge after downsizing, in pixels
    pub max_dimension: u32,
    /// JPEG quality of the output (1-100)
    pub jpeg_quality: u8,
}

impl Default for ColorTransferConfig {
    fn default() -> Self {
        Self {
            style_strength: 1.0,
            max_dimension: 512,
            jpeg_quality: 95,
        }
    }
}

impl ColorTransferConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the style strength (clamped to 0.0-1.0)
    #[must_use]
    pub fn with_style_strength(mut self, strength: f32) -> Self {
        self.style_strength = strength.clamp(0.0, 1.0);
        self
    }

    /// Set the maximum edge length
    #[must_use]
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    /// Set the output JPEG quality (clamped to 1-100)
    #[must_use]
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }
}

/// Per-channel statistics of an RGB image
#[derive(Clone, Copy, Debug, PartialEq)]
struct ChannelStats {
    mean: [f32; 3],
    std: [f32; 3],
}

impl ChannelStats {
    fn of(image: &RgbImage) -> Self {
        let count = (image.width() * image.height()).max(1) as f32;
        let mut sum = [0f32; 3];
        for pixel in image.pixels() {
            for c in 0..3 {
                sum[c] += f32::from(pixel[c]);
            }
        }
        let mean = sum.map(|s| s / count);

        let mut var = [0f32; 3];
        for pixel in image.pixels() {
            for c in 0..3 {
                let d = f32::from(pixel[c]) - mean[c];
                var[c] += d * d;
            }
        }
        let std = var.map(|v| (v / count).sqrt());

        Self { mean, std }
    }

    fn luma_std(&self) -> f32 {
        0.299 * self.std[0] + 0.587 * self.std[1] + 0.114 * self.std[2]
    }
}

/// Built-in pixel-space style engine
#[derive(Clone, Debug, Default)]
pub struct ColorTransferEngine {
    config: ColorTransferConfig,
}

impl ColorTransferEngine {
    /// Create an engine with the given configuration
    #[must_use]
    pub fn new(config: ColorTransferConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &ColorTransferConfig {
        &self.config
    }

    fn decode(&self, data: &[u8], role: &str) -> Result<RgbImage, EngineError> {
        let image = image::load_from_memory(data)
            .map_err(|e| EngineError::Decode(format!("{role} image: {e}")))?;
        Ok(self.fit(image).to_rgb8())
    }

    fn fit(&self, image: DynamicImage) -> DynamicImage {
        let max = self.config.max_dimension.max(1);
        if image.width() > max || image.height() > max {
            image.resize(max, max, FilterType::Triangle)
        } else {
            image
        }
    }

    fn adain(&self, content: &mut RgbImage, source: ChannelStats, target: ChannelStats) {
        let alpha = self.config.style_strength.clamp(0.0, 1.0);
        for pixel in content.pixels_mut() {
            for c in 0..3 {
                let value = f32::from(pixel[c]);
                let normalized = (value - source.mean[c]) / source.std[c].max(MIN_DEVIATION);
                let styled = normalized * target.std[c] + target.mean[c];
                pixel[c] = to_channel(alpha * styled + (1.0 - alpha) * value);
            }
        }
    }

    fn sanet(&self, content: &mut RgbImage, source: ChannelStats, target: ChannelStats) {
        let alpha = self.config.style_strength.clamp(0.0, 1.0);
        let contrast = target.luma_std() / source.luma_std().max(MIN_DEVIATION);
        for pixel in content.pixels_mut() {
            for c in 0..3 {
                let value = f32::from(pixel[c]);
                let styled = (value - source.mean[c]) * contrast + target.mean[c];
                pixel[c] = to_channel(alpha * styled + (1.0 - alpha) * value);
            }
        }
    }

    fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.config.jpeg_quality.clamp(1, 100))
            .encode_image(image)
            .map_err(|e| EngineError::Inference(format!("encode failed: {e}")))?;
        Ok(out)
    }
}

fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

impl StyleEngine for ColorTransferEngine {
    fn name(&self) -> &str {
        "color-transfer"
    }

    fn models(&self) -> Vec<String> {
        vec![MODEL_ADAIN.to_string(), MODEL_SANET.to_string()]
    }

    fn supports_model(&self, model: &str) -> bool {
        model == MODEL_ADAIN || model == MODEL_SANET
    }

    /// Reads the image header, so a frame cut off before its dimensions is
    /// refused at ingress.
    fn probe(&self, data: &[u8]) -> Result<(), EngineError> {
        ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| EngineError::Decode(e.to_string()))?
            .into_dimensions()
            .map(|_| ())
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    fn transform(&self, request: &TransformRequest) -> Result<Vec<u8>, EngineError> {
        if !self.supports_model(&request.model) {
            return Err(EngineError::UnknownModel(request.model.clone()));
        }

        let mut content = self.decode(&request.content, "content")?;
        let style = self.decode(&request.style, "style")?;

        let source = ChannelStats::of(&content);
        let target = ChannelStats::of(&style);

        match request.model.as_str() {
            MODEL_ADAIN => self.adain(&mut content, source, target),
            _ => self.sanet(&mut content, source, target),
        }

        self.encode(&content)
    }
}
