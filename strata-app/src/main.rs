//! Strata Application
//!
//! Runs a scripted capture session against a simulated depth camera:
//! - Frame grabbing with a depth/normal measure pool and a texture batch
//! - Background mesh reconstruction (scan, filter, texture, save)
//! - Cubemap baking once the mesh is saved

mod config;
mod error;
mod session;

use clap::Parser;
use config::AppConfig;
use error::AppError;
use session::{LoggingConfig, SessionBuilder};
use std::path::PathBuf;

/// Strata - depth capture and background reconstruction
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; missing fields use defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop the session after this many seconds
    #[arg(short, long)]
    duration: Option<f32>,

    /// Where to save the reconstructed mesh
    #[arg(short, long)]
    save: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// Play back a looping recording of this many frames
    #[arg(long, value_name = "FRAMES")]
    playback: Option<usize>,

    /// Retrieve textures on the application thread
    #[arg(long)]
    no_async_textures: bool,

    /// Send spans to Tracy (requires the `tracy` feature)
    #[arg(long)]
    tracy: bool,
}

impl Args {
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(duration) = self.duration {
            config.script.max_secs = duration;
        }
        if let Some(save) = &self.save {
            config.save_path = save.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(frames) = self.playback {
            config.camera.playback_frames = Some(frames);
        }
        if self.no_async_textures {
            config.async_textures = false;
        }
        config
    }
}

fn run(args: Args) -> Result<(), AppError> {
    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let config = args.apply(config);
    let logging = LoggingConfig {
        level: config.log_level.clone(),
        enable_tracy: args.tracy,
    };

    let report = SessionBuilder::new()
        .with_config(config)
        .with_logging(logging)
        .run()?;

    println!(
        "{} frames, {} textures swapped ({} dropped), {} depth probes, {} mesh vertices",
        report.frames,
        report.textures_swapped,
        report.textures_dropped,
        report.depth_probes,
        report.mesh_vertices
    );
    if !report.failed_steps.is_empty() {
        println!("Failed steps: {:?}", report.failed_steps);
    }
    if report.disconnected {
        println!("Camera disconnected");
    } else if !report.completed {
        println!("Session stopped before the script finished");
    }
    println!(
        "Mesh saved: {}, cubemap built: {}",
        report.saved, report.cubemap_built
    );
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::try_parse_from([
            "strata",
            "--duration",
            "2.5",
            "--save",
            "out.ply",
            "--playback",
            "40",
            "--no-async-textures",
        ])
        .unwrap();
        let config = args.apply(AppConfig::default());

        assert_eq!(config.script.max_secs, 2.5);
        assert_eq!(config.save_path, PathBuf::from("out.ply"));
        assert_eq!(config.camera.playback_frames, Some(40));
        assert!(!config.async_textures);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_defaults_untouched() {
        let args = Args::try_parse_from(["strata"]).unwrap();
        assert!(args.config.is_none());
        let config = args.apply(AppConfig::default());
        assert_eq!(config.script.max_secs, 30.0);
        assert!(config.async_textures);
    }

    #[test]
    fn test_rejects_bad_duration() {
        assert!(Args::try_parse_from(["strata", "--duration", "soon"]).is_err());
    }
}
