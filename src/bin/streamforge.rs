use std::ffi::CStr;

use clap::Parser;
use ffmpeg_sys_next::av_version_info;
use log::{error, info};
use streamforge::pipeline::supervisor::Supervisor;
use streamforge::pipeline::ExitStatus;
use streamforge::settings::Settings;

#[derive(Parser, Debug)]
#[command(about = "Live video transcoding pipeline")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    unsafe {
        info!(
            "ffmpeg version={}",
            CStr::from_ptr(av_version_info()).to_string_lossy()
        );
    }

    let settings = match Settings::load(&args.config) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to load {}: {e:#}", args.config);
            std::process::exit(ExitStatus::ConfigError.code());
        }
    };

    let supervisor = match Supervisor::new(&settings) {
        Ok(s) => s,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            std::process::exit(ExitStatus::ConfigError.code());
        }
    };

    let status = supervisor.run();
    info!("pipeline finished: {status:?}");
    std::process::exit(status.code());
}
