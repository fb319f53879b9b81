//! Offscreen rendering of swarm snapshots into PNG frames and GIF animations.

use anyhow::{Context, Result};
use firefly_core::{SinkError, SnapshotSink, SwarmSnapshot};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// Name of the manifest written next to recorded frames.
pub const MANIFEST_FILE: &str = "frames.json";

/// Glow layers drawn around each lit agent, faintest first.
///
/// `size` scales marker area with depth; `alpha` is the layer opacity.
const GLOW_LAYERS: [GlowLayer; 4] = [
    GlowLayer {
        size: 400.0,
        alpha: 0.05,
    },
    GlowLayer {
        size: 100.0,
        alpha: 0.3,
    },
    GlowLayer {
        size: 20.0,
        alpha: 0.18,
    },
    GlowLayer {
        size: 10.0,
        alpha: 1.0,
    },
];

#[derive(Debug, Clone, Copy)]
struct GlowLayer {
    size: f32,
    alpha: f32,
}

/// Output settings for [`render_png_offscreen`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
    pub background: [u8; 3],
    pub glow_color: [u8; 3],
}

impl RenderOptions {
    /// Pixel dimensions actually produced, never smaller than 1x1.
    #[must_use]
    pub fn frame_size(&self) -> (u32, u32) {
        (self.width.max(1), self.height.max(1))
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 800,
            background: [0, 0, 0],
            glow_color: [0x8e, 0xd8, 0x47],
        }
    }
}

fn blend(base: Rgb<u8>, color: [u8; 3], alpha: f32) -> Rgb<u8> {
    let mix = |b: u8, c: u8| -> u8 {
        (f32::from(b) * (1.0 - alpha) + f32::from(c) * alpha)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Rgb([
        mix(base[0], color[0]),
        mix(base[1], color[1]),
        mix(base[2], color[2]),
    ])
}

fn normalized(value: f32, lower: f32, upper: f32) -> f32 {
    let width = upper - lower;
    if width <= 0.0 {
        return 0.0;
    }
    ((value - lower) / width).clamp(0.0, 1.0)
}

/// Render one snapshot as PNG bytes.
///
/// The camera looks down the x axis: y runs left to right, z bottom to top.
/// Only lit agents are drawn; agents further along x get larger halos.
pub fn render_png_offscreen(snapshot: &SwarmSnapshot, options: &RenderOptions) -> Result<Vec<u8>> {
    let image = render_frame(snapshot, options);
    let mut bytes = Vec::new();
    {
        let mut cursor = Cursor::new(&mut bytes);
        image
            .write_to(&mut cursor, image::ImageFormat::Png)
            .context("encode frame as png")?;
    }
    Ok(bytes)
}

/// Rasterise one snapshot into an RGB buffer.
#[must_use]
pub fn render_frame(snapshot: &SwarmSnapshot, options: &RenderOptions) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let (width, height) = options.frame_size();
    let mut image = ImageBuffer::from_pixel(width, height, Rgb(options.background));

    let bounds = snapshot.bounds;
    let marker_scale = height as f32 / 400.0;

    for agent in snapshot.lit_agents() {
        let depth = normalized(agent.position.x, bounds.x.lower, bounds.x.upper);
        let u = normalized(agent.position.y, bounds.y.lower, bounds.y.upper);
        let v = normalized(agent.position.z, bounds.z.lower, bounds.z.upper);
        let center_x = u * (width - 1) as f32;
        let center_y = (1.0 - v) * (height - 1) as f32;

        for layer in GLOW_LAYERS {
            let radius_px = (2.0 + depth * layer.size).sqrt() * 0.5 * marker_scale;
            let radius = radius_px.ceil() as i32;
            let cx = center_x.round() as i32;
            let cy = center_y.round() as i32;
            for dy in -radius..=radius {
                let py = cy + dy;
                if py < 0 || py >= height as i32 {
                    continue;
                }
                for dx in -radius..=radius {
                    let px = cx + dx;
                    if px < 0 || px >= width as i32 {
                        continue;
                    }
                    let dist = ((dx as f32).powi(2) + (dy as f32).powi(2)).sqrt();
                    if dist <= radius_px {
                        let pixel = image.get_pixel_mut(px as u32, py as u32);
                        *pixel = blend(*pixel, options.glow_color, layer.alpha);
                    }
                }
            }
        }
    }
    image
}

/// Ordered frame list written next to the recorded PNGs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameManifest {
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
    pub frames: Vec<String>,
}

impl FrameManifest {
    /// Load a manifest previously written by [`FrameRecorder`].
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }
}

/// Join the frames listed in `manifest` into a looping GIF at its frame rate.
pub fn assemble_animation(dir: &Path, manifest: &FrameManifest, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = File::create(output).with_context(|| format!("create {}", output.display()))?;
    let mut encoder = GifEncoder::new(BufWriter::new(file));
    encoder
        .set_repeat(Repeat::Infinite)
        .context("configure gif looping")?;

    let delay = Delay::from_numer_denom_ms(1000, manifest.frame_rate.max(1));
    let mut frames = Vec::with_capacity(manifest.frames.len());
    for name in &manifest.frames {
        let path = dir.join(name);
        let image = image::open(&path)
            .with_context(|| format!("decode {}", path.display()))?
            .to_rgba8();
        frames.push(Frame::from_parts(image, 0, 0, delay));
    }
    encoder
        .encode_frames(frames)
        .with_context(|| format!("encode {}", output.display()))?;
    info!(
        frames = manifest.frames.len(),
        animation = %output.display(),
        "animation assembled"
    );
    Ok(())
}

/// Snapshot sink that writes one PNG per step plus a manifest on finish.
///
/// With [`FrameRecorder::with_animation`] set, finishing also joins the
/// frames into a GIF.
#[derive(Debug)]
pub struct FrameRecorder {
    dir: PathBuf,
    options: RenderOptions,
    frame_rate: u32,
    frames: Vec<String>,
    animation: Option<PathBuf>,
}

impl FrameRecorder {
    /// Create the output directory and an empty recorder.
    pub fn create(dir: impl Into<PathBuf>, options: RenderOptions, frame_rate: u32) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self {
            dir,
            options,
            frame_rate,
            frames: Vec::new(),
            animation: None,
        })
    }

    /// Also assemble the frames into a GIF at `path` on finish.
    #[must_use]
    pub fn with_animation(mut self, path: impl Into<PathBuf>) -> Self {
        self.animation = Some(path.into());
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File names written so far, in step order.
    #[must_use]
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    fn write_frame(&mut self, snapshot: &SwarmSnapshot) -> Result<()> {
        let png = render_png_offscreen(snapshot, &self.options)?;
        let name = format!("frame_{:05}.png", snapshot.tick.0);
        let path = self.dir.join(&name);
        fs::write(&path, png).with_context(|| format!("write {}", path.display()))?;
        trace!(frame = %path.display(), lit = snapshot.lit_agents().count(), "frame written");
        self.frames.push(name);
        Ok(())
    }

    fn manifest(&self) -> FrameManifest {
        let (width, height) = self.options.frame_size();
        FrameManifest {
            frame_rate: self.frame_rate,
            width,
            height,
            frames: self.frames.clone(),
        }
    }

    fn write_manifest(&self, manifest: &FrameManifest) -> Result<()> {
        let path = self.dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(manifest).context("serialize frame manifest")?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        debug!(
            frames = self.frames.len(),
            manifest = %path.display(),
            "frame manifest written"
        );
        Ok(())
    }
}

impl SnapshotSink for FrameRecorder {
    fn on_step(&mut self, snapshot: &SwarmSnapshot) -> Result<(), SinkError> {
        self.write_frame(snapshot).map_err(Into::into)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let manifest = self.manifest();
        self.write_manifest(&manifest)?;
        if let Some(path) = &self.animation {
            assemble_animation(&self.dir, &manifest, path)?;
        }
        Ok(())
    }
}
