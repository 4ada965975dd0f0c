use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use boot_pipeline::config::{Arch, BootMode, DebugConfig, DEFAULT_MEMORY};
use boot_pipeline::env::Session;
use boot_pipeline::host::SystemHost;
use boot_pipeline::runner::SystemRunner;
use boot_pipeline::{logging, pipeline};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "boot-debugger",
    about = "Boot a llamafile image in QEMU with serial capture and an optional GDB stub"
)]
struct Cli {
    /// Image to boot: a raw BIOS image, an EFI application or an EFI tree
    #[arg(short, long)]
    image: PathBuf,

    /// Firmware boot path
    #[arg(short, long, value_enum, default_value_t = BootMode::Bios)]
    mode: BootMode,

    /// Guest architecture
    #[arg(short, long, value_enum, default_value_t = Arch::X86_64)]
    arch: Arch,

    /// Guest memory (QEMU -m syntax)
    #[arg(short = 'M', long, default_value = DEFAULT_MEMORY)]
    memory: String,

    /// Directory for logs, the GDB script and the summary
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    /// Expose a GDB stub on localhost:1234
    #[arg(short, long)]
    gdb: bool,

    /// Halt the CPU until a debugger attaches (implies --gdb)
    #[arg(short, long)]
    wait: bool,

    /// Log debug-level detail to the console and session log
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> boot_pipeline::Result<DebugConfig> {
        DebugConfig {
            image: self.image,
            mode: self.mode,
            arch: self.arch,
            memory: self.memory,
            output_dir: self.output_dir,
            gdb: self.gdb,
            wait: self.wait,
            verbose: self.verbose,
        }
        .validate()
    }
}

#[derive(Debug)]
enum Parsed {
    Run(DebugConfig),
    Exit(u8),
}

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

async fn run(config: DebugConfig) -> Result<()> {
    let session = Session::start(&config.output_dir)?;
    logging::init(&session.session_log(), config.verbose)?;

    let analysis = pipeline::run_debug(&config, &session, &SystemRunner, &SystemHost).await?;
    for rec in analysis.recommendations() {
        tracing::info!("{rec}");
    }
    tracing::info!(summary = %session.summary().display(), "debug session finished");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_image_exits_1() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let image = dir.path().join("missing.img");
        let parsed = parse([
            "boot-debugger",
            "--image",
            image.to_str().unwrap(),
            "--output-dir",
            out.to_str().unwrap(),
        ]);
        assert!(matches!(parsed, Parsed::Exit(1)));
        assert!(!out.exists());
    }

    #[test]
    fn image_is_required() {
        assert!(matches!(parse(["boot-debugger"]), Parsed::Exit(1)));
        assert!(matches!(parse(["boot-debugger", "-h"]), Parsed::Exit(0)));
    }

    #[test]
    fn both_is_not_a_debug_mode() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("boot.img");
        std::fs::write(&image, b"x").unwrap();
        let image = image.to_str().unwrap();
        assert!(matches!(
            parse(["boot-debugger", "-i", image, "--mode", "both"]),
            Parsed::Exit(1)
        ));
        assert!(matches!(
            parse(["boot-debugger", "-i", image, "--arch", "both"]),
            Parsed::Exit(1)
        ));
    }

    #[test]
    fn bios_on_aarch64_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("boot.img");
        std::fs::write(&image, b"x").unwrap();
        assert!(matches!(
            parse([
                "boot-debugger",
                "-i",
                image.to_str().unwrap(),
                "-m",
                "bios",
                "-a",
                "aarch64"
            ]),
            Parsed::Exit(1)
        ));
    }

    #[test]
    fn wait_turns_on_gdb() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("boot.efi");
        std::fs::write(&image, b"MZ").unwrap();
        let Parsed::Run(config) = parse([
            "boot-debugger",
            "--image",
            image.to_str().unwrap(),
            "--mode",
            "uefi",
            "--arch",
            "aarch64",
            "--wait",
            "--memory",
            "512M",
        ]) else {
            panic!("expected a config");
        };
        assert!(config.gdb && config.wait);
        assert_eq!(config.mode, BootMode::Uefi);
        assert_eq!(config.arch, Arch::Aarch64);
        assert_eq!(config.memory, "512M");
    }

    #[test]
    fn every_flag_has_help() {
        let mut cmd = Cli::command();
        let help = cmd.render_help().to_string();
        assert!(help.contains("Log debug-level detail"));
        for arg in cmd.get_arguments() {
            assert!(arg.get_help().is_some(), "--{} has no help", arg.get_id());
        }
    }
}
