use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use fbx2vmd_motion::{load, retarget, write_vmd, DEFAULT_FRAME_RATE};
use log::info;

/// Convert Mixamo skeletal animation in binary FBX files to MMD VMD motion data.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The input binary .fbx file.
    input: String,

    /// The output .vmd file. Defaults to the input with a vmd extension.
    output: Option<String>,

    /// Output keyframe rate.
    #[arg(long, default_value_t = DEFAULT_FRAME_RATE)]
    fps: f64,

    /// Index of the animation take to convert when the file contains several.
    #[arg(long, default_value_t = 0)]
    take: usize,
}

fn main() -> anyhow::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;
    let cli = Cli::parse();

    let bytes =
        std::fs::read(&cli.input).with_context(|| format!("error reading {}", cli.input))?;
    let clips = load(&bytes)?;
    let retargeted = retarget(&clips);
    let Some(clip) = retargeted.get(cli.take) else {
        bail!(
            "take {} out of range for {} animation takes",
            cli.take,
            retargeted.len()
        );
    };
    info!(
        "converting {:?}: {} bone tracks over {:.2}s",
        clip.name,
        clip.tracks.len(),
        clip.duration
    );

    let vmd = write_vmd(clip, cli.fps)?;
    let output = cli
        .output
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(&cli.input).with_extension("vmd"));
    std::fs::write(&output, vmd).with_context(|| format!("error writing {output:?}"))?;
    info!("wrote {output:?}");
    Ok(())
}
