//! The two end-to-end runs: build (and optionally boot-test) an image, or
//! boot an existing image under the debugger.

use crate::analyzer::{self, Analysis};
use crate::builder::{self, FINAL_ARTIFACT};
use crate::config::{Arch, BootMode, BuildConfig, DebugConfig, DEFAULT_RUNTIME_ARGS};
use crate::emulator::{self, DebugStub, EmulatorPlan};
use crate::env::{self, Session};
use crate::host::Host;
use crate::manifest::{self, ArtifactSet};
use crate::runner::CommandRunner;
use crate::templates::{self, PatchOptions};
use crate::{deps, fetch, media, success, Result};

pub async fn run_build(
    config: &BuildConfig,
    session: &Session,
    runner: &dyn CommandRunner,
    host: &dyn Host,
) -> Result<ArtifactSet> {
    tracing::info!(
        session = session.id(),
        model = %config.model,
        boot_mode = ?config.boot_modes,
        arch = ?config.arches,
        "starting build"
    );
    deps::check_build(config, host)?;
    if config.boot_modes.includes(BootMode::Bios) && config.arches.arches().contains(&Arch::Aarch64) {
        tracing::warn!("BIOS boot is x86_64 only; skipping bios/aarch64");
    }

    env::ensure_dir(&config.output_dir)?;
    let source = env::prepare_source(&config.repo, &config.build_dir, runner).await?;
    let model = fetch::resolve_model(&config.model, &config.build_dir.join("models")).await?;

    let raw_args = config.runtime_args.as_deref().unwrap_or(DEFAULT_RUNTIME_ARGS);
    let opts = PatchOptions {
        vga_console: config.vga,
        init_args: Some(templates::split_args(raw_args)?),
    };
    let patch = builder::apply_patch(&source, &config.output_dir, &opts, runner).await?;

    let build_log = session.build_log();
    let binary = builder::compile(config, &source, &build_log, runner).await?;

    let final_artifact = config.output_dir.join(FINAL_ARTIFACT);
    let size = builder::concatenate(&binary, &model, &final_artifact)?;
    success!(path = %final_artifact.display(), bytes = size, "final artifact written");

    let mut artifacts = ArtifactSet {
        final_artifact: Some(final_artifact.clone()),
        patch: Some(patch),
        build_log: Some(build_log),
        ..Default::default()
    };
    media::assemble(config, &final_artifact, &mut artifacts)?;
    manifest::write(&session.manifest(), session.id(), config, &artifacts)?;

    if config.test {
        test_boot(config, session, &artifacts, runner, host).await?;
    }

    success!("build complete");
    Ok(artifacts)
}

/// Boot every produced combination once and report what the serial log
/// shows.
async fn test_boot(
    config: &BuildConfig,
    session: &Session,
    artifacts: &ArtifactSet,
    runner: &dyn CommandRunner,
    host: &dyn Host,
) -> Result<()> {
    // Resolve firmware for every combination before the first launch.
    let mut plans = Vec::new();
    for (mode, arch) in config.combinations() {
        let Some(boot_source) = media::boot_source(artifacts, mode) else {
            continue;
        };
        let firmware = match mode {
            BootMode::Bios => None,
            BootMode::Uefi => Some(deps::require_firmware(arch, host)?),
        };
        plans.push(EmulatorPlan {
            mode,
            arch,
            memory: config.memory.clone(),
            graphical: config.vga,
            boot_source,
            firmware,
            serial_log: session.serial_log(mode, arch),
            monitor_log: session.monitor_log(mode, arch),
            debug: None,
        });
    }

    for plan in &plans {
        emulator::run(plan, runner).await?;
        let log = analyzer::read_log(&plan.serial_log)?;
        analyzer::analyze(&log).log();
    }
    Ok(())
}

pub async fn run_debug(
    config: &DebugConfig,
    session: &Session,
    runner: &dyn CommandRunner,
    host: &dyn Host,
) -> Result<Analysis> {
    tracing::info!(
        session = session.id(),
        image = %config.image.display(),
        mode = %config.mode,
        arch = %config.arch,
        "starting debug boot"
    );
    let firmware = deps::check_debug(config, host)?;
    env::ensure_dir(&config.output_dir)?;

    let boot_source = match config.mode {
        BootMode::Bios => config.image.clone(),
        BootMode::Uefi => env::stage_efi(
            &config.image,
            config.arch,
            &config.output_dir.join(format!("efi-{}", session.id())),
        )?,
    };

    let debug = if config.gdb {
        let (script, symbols) = templates::write_gdb_script(&config.output_dir, &config.image)?;
        match symbols {
            Some(symbols) => tracing::info!(
                "attach with: gdb -x {} {}",
                script.display(),
                symbols.display()
            ),
            None => tracing::info!("attach with: gdb -x {}", script.display()),
        }
        Some(DebugStub { wait: config.wait })
    } else {
        None
    };

    let plan = EmulatorPlan {
        mode: config.mode,
        arch: config.arch,
        memory: config.memory.clone(),
        graphical: false,
        boot_source,
        firmware,
        serial_log: session.serial_log(config.mode, config.arch),
        monitor_log: session.monitor_log(config.mode, config.arch),
        debug,
    };
    emulator::run(&plan, runner).await?;

    analyzer::write_summary(&session.summary(), session.id(), config, &plan.serial_log)
}
