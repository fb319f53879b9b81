//! Shared application plumbing for the firefly command-line driver.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use firefly_core::{SinkError, SnapshotSink, SwarmConfig, SwarmSnapshot};
use firefly_render::{FrameRecorder, RenderOptions};
use tracing::info;

/// Load a JSON configuration file; missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Writes each snapshot as one JSON object per line.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl SnapshotSink for JsonLinesSink {
    fn on_step(&mut self, snapshot: &SwarmSnapshot) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, snapshot)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every snapshot to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn SnapshotSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn SnapshotSink>) {
        self.sinks.push(sink);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl SnapshotSink for FanoutSink {
    fn on_step(&mut self, snapshot: &SwarmSnapshot) -> Result<(), SinkError> {
        for sink in &mut self.sinks {
            sink.on_step(snapshot)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        for sink in &mut self.sinks {
            sink.finish()?;
        }
        Ok(())
    }
}

/// Where snapshots should go for a run.
#[derive(Debug, Clone, Default)]
pub struct OutputPlan {
    pub frames_dir: Option<PathBuf>,
    pub animation_path: Option<PathBuf>,
    pub snapshots_path: Option<PathBuf>,
    pub render: RenderOptions,
}

impl OutputPlan {
    /// Build the fan-out sink described by this plan.
    pub fn build_sink(&self, config: &SwarmConfig) -> Result<FanoutSink> {
        let mut sink = FanoutSink::new();
        if let Some(dir) = &self.frames_dir {
            info!(dir = %dir.display(), "recording png frames");
            let mut recorder = FrameRecorder::create(dir, self.render, config.frame_rate)?;
            if let Some(path) = &self.animation_path {
                recorder = recorder.with_animation(path);
            }
            sink.push(Box::new(recorder));
        }
        if let Some(path) = &self.snapshots_path {
            info!(path = %path.display(), "writing json-lines snapshots");
            sink.push(Box::new(JsonLinesSink::create(path)?));
        }
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firefly_core::SwarmState;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_path(label: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_micros();
        std::env::temp_dir().join(format!(
            "firefly_app_{label}_{}_{}",
            std::process::id(),
            timestamp
        ))
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_step() {
        let path = scratch_path("snapshots").with_extension("jsonl");
        let config = SwarmConfig {
            total_steps: 7,
            rng_seed: Some(4),
            ..SwarmConfig::default()
        };
        let plan = OutputPlan {
            snapshots_path: Some(path.clone()),
            ..OutputPlan::default()
        };
        let sink = plan.build_sink(&config).expect("sink");
        assert_eq!(sink.len(), 1);
        let mut swarm = SwarmState::with_sink(config, Box::new(sink)).expect("swarm");
        swarm.run().expect("run");

        let raw = fs::read_to_string(&path).expect("snapshots file");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 7);
        let last: SwarmSnapshot = serde_json::from_str(lines[6]).expect("parse snapshot");
        assert_eq!(last.tick.0, 6);
        assert_eq!(last.agents.len(), 13);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn empty_plan_builds_empty_fanout() {
        let sink = OutputPlan::default()
            .build_sink(&SwarmConfig::default())
            .expect("sink");
        assert!(sink.is_empty());
    }

    #[test]
    fn load_config_fills_defaults() {
        let path = scratch_path("config").with_extension("json");
        fs::write(&path, r#"{"population_size": 21, "rng_seed": 9}"#).expect("write config");
        let config = load_config(&path).expect("load");
        assert_eq!(config.population_size, 21);
        assert_eq!(config.rng_seed, Some(9));
        assert_eq!(config.total_steps, 1_000);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn load_config_reports_parse_errors() {
        let path = scratch_path("broken").with_extension("json");
        fs::write(&path, "{ not json").expect("write config");
        let err = load_config(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains("parse"));
        let _ = fs::remove_file(&path);
    }
}
