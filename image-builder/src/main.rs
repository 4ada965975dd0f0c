use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use boot_pipeline::config::{
    Arches, BootModes, BuildConfig, ModelSource, DEFAULT_MEMORY, DEFAULT_REPO,
};
use boot_pipeline::env::Session;
use boot_pipeline::host::SystemHost;
use boot_pipeline::runner::SystemRunner;
use boot_pipeline::{logging, pipeline};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "image-builder",
    about = "Build a BIOS/UEFI bootable llamafile image with an embedded model"
)]
struct Cli {
    /// Upstream llamafile repository
    #[arg(short, long, default_value = DEFAULT_REPO)]
    repo: String,

    /// Model to embed: a local GGUF file or an http(s) URL
    #[arg(short, long)]
    model: String,

    /// Directory for the source checkout and downloaded models
    #[arg(short, long, default_value = "build")]
    build_dir: PathBuf,

    /// Output directory for images, scripts and logs
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    /// Boot media to produce
    #[arg(short = 'B', long, value_enum, default_value_t = BootModes::Both)]
    boot_mode: BootModes,

    /// Target architecture
    #[arg(short, long, value_enum, default_value_t = Arches::X86_64)]
    arch: Arches,

    /// Verbose build and log output
    #[arg(short, long)]
    verbose: bool,

    /// Boot each produced image in QEMU after building
    #[arg(short, long)]
    test: bool,

    /// Guest memory for --test (QEMU -m syntax)
    #[arg(short = 'M', long, default_value = DEFAULT_MEMORY)]
    memory: String,

    /// Link the VGA console and boot --test runs with a display
    #[arg(short = 'V', long)]
    vga: bool,

    /// Arguments the image runs with on bare metal (quotes group words)
    #[arg(short = 'A', long, allow_hyphen_values = true)]
    args: Option<String>,
}

impl Cli {
    fn into_config(self) -> boot_pipeline::Result<BuildConfig> {
        BuildConfig {
            repo: self.repo,
            model: ModelSource::parse(&self.model),
            build_dir: self.build_dir,
            output_dir: self.output_dir,
            boot_modes: self.boot_mode,
            arches: self.arch,
            memory: self.memory,
            verbose: self.verbose,
            test: self.test,
            vga: self.vga,
            runtime_args: self.args,
        }
        .validate()
    }
}

#[derive(Debug)]
enum Parsed {
    Run(BuildConfig),
    Exit(u8),
}

/// Parse and validate without touching the filesystem. Usage errors exit
/// 1, help exits 0.
fn parse<I, T>(args: I) -> Parsed
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => return Parsed::Exit(report(err)),
    };
    match cli.into_config() {
        Ok(config) => Parsed::Run(config),
        Err(err) => Parsed::Exit(report(
            Cli::command().error(ErrorKind::ValueValidation, err),
        )),
    }
}

fn report(err: clap::Error) -> u8 {
    let _ = err.print();
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

async fn run(config: BuildConfig) -> Result<()> {
    let session = Session::start(&config.output_dir)?;
    logging::init(&session.session_log(), config.verbose)?;

    let artifacts =
        pipeline::run_build(&config, &session, &SystemRunner, &SystemHost).await?;
    if let Some(image) = &artifacts.bios_image {
        tracing::info!(image = %image.display(), "BIOS");
    }
    if let Some(script) = &artifacts.fat_image_script {
        tracing::info!(script = %script.display(), "UEFI");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match parse(std::env::args_os()) {
        Parsed::Run(config) => config,
        Parsed::Exit(code) => return ExitCode::from(code),
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if tracing::dispatcher::has_been_set() {
                tracing::error!("{err:#}");
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
