//! calibrate - derive focal lengths from the configured reference images

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use proximity_kernel::ui::{Ui, UiMode};
use proximity_kernel::{calibrate_all, open_backend, ProximityConfig, ReferenceGroup};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "PROXIMITY_CONFIG")]
    config: Option<PathBuf>,
    /// Override the person reference image.
    #[arg(long)]
    person_image: Option<PathBuf>,
    /// Override the small-object reference image.
    #[arg(long)]
    small_object_image: Option<PathBuf>,
    /// Detection script for the scripted detector.
    #[arg(long)]
    script: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, value_enum, default_value_t = UiMode::Auto, value_name = "MODE")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::new(args.ui);
    let mut cfg = ProximityConfig::load_from(args.config.as_deref())?;
    if let Some(script) = args.script {
        cfg.detector.script_path = Some(script);
    }
    for reference in &mut cfg.references {
        let image = match reference.group {
            ReferenceGroup::Person => args.person_image.as_ref(),
            ReferenceGroup::SmallObject => args.small_object_image.as_ref(),
        };
        if let Some(image) = image {
            reference.image = image.clone();
        }
    }

    let mut detector = {
        let stage = ui.stage("Open detector");
        let detector = open_backend(&cfg.detector)?;
        stage.done();
        detector
    };
    let calibration = {
        let stage = ui.stage("Calibrate reference images");
        let calibration = calibrate_all(detector.as_mut(), &cfg.references)?;
        stage.done();
        calibration
    };

    println!("{}", serde_json::to_string_pretty(&calibration.constants())?);
    Ok(())
}
