use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use autotake_lib::config::{default_config_path, Config};
use autotake_lib::devices::{DeviceHost, SystemHost};

/// Unattended audio/MIDI recorder: records a take whenever the input is active
#[derive(Debug, Parser)]
#[command(name = "autotake", version, about)]
struct Cli {
    /// Directory where takes are written
    #[arg(required_unless_present = "list_devices")]
    out_dir: Option<PathBuf>,

    /// Substrings matched against audio and MIDI device names. Falls back to
    /// `device_patterns` from the config file.
    patterns: Vec<String>,

    /// Config file (defaults to the user config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the available audio and MIDI devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if cli.list_devices {
        print_devices(&SystemHost::new());
        return ExitCode::SUCCESS;
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default(&config_path);
    cli.apply_to(&mut config);

    match autotake_lib::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

impl Cli {
    /// Command-line values take precedence over the config file
    fn apply_to(&self, config: &mut Config) {
        if let Some(out_dir) = &self.out_dir {
            config.storage_path = out_dir.clone();
        }
        if !self.patterns.is_empty() {
            config.device_patterns = self.patterns.clone();
        }
    }
}

fn print_devices(host: &impl DeviceHost) {
    println!("Audio devices:");
    for device in host.audio_devices() {
        println!(
            "  {}{} (in {}, out {}, {}Hz)",
            device.name,
            if device.is_default { " [default]" } else { "" },
            device.max_input_channels,
            device.max_output_channels,
            device.default_sample_rate
        );
    }
    println!("MIDI devices:");
    for device in host.midi_devices() {
        println!("  {}", device.name);
    }
}
