//! Compile the upstream tree and glue the model onto the result.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::config::{Arches, BuildConfig};
use crate::error::IoContext;
use crate::runner::{CommandRunner, ToolCommand};
use crate::templates::{self, EntrySource, PatchOptions, ENTRY_DIR, PATCHED_SOURCE};
use crate::{Error, Result};

/// Name of the executable the upstream makefile produces.
pub const BINARY_NAME: &str = "llamafile";
/// Make's output root inside the source tree.
pub const OBJECT_DIR: &str = "o";
/// Binary with the model appended.
pub const FINAL_ARTIFACT: &str = "llamafile-metal.com";

pub const BUILD_MODE: &str = "MODE=opt";
pub const VGA_DEFINE: &str = "CPPFLAGS=-DMETAL_VGA_CONSOLE";

fn jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Arguments for `make`, in order.
pub fn make_args(config: &BuildConfig) -> Vec<String> {
    let mut args = vec![format!("-j{}", jobs()), BUILD_MODE.to_owned()];
    match config.arches {
        Arches::X86_64 => args.push("ARCH=x86_64".to_owned()),
        Arches::Aarch64 => args.push("ARCH=aarch64".to_owned()),
        Arches::Both => {}
    }
    if config.vga {
        args.push(VGA_DEFINE.to_owned());
    }
    if config.verbose {
        args.push("V=1".to_owned());
    }
    args
}

/// Undo a previous run's patch: drop the generated glue and check the
/// entry directory back out.
pub async fn restore_tree(source: &Path, runner: &dyn CommandRunner) -> Result<()> {
    let glue = source.join(PATCHED_SOURCE);
    match fs::remove_file(&glue) {
        Ok(()) => tracing::debug!(path = %glue.display(), "removed previous entry glue"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).at(&glue),
    }
    let checkout = ToolCommand::new("git")
        .arg("-C")
        .arg(source)
        .args(["checkout", "--", ENTRY_DIR]);
    checkout.check(runner.run(&checkout).await?)
}

/// The translation unit under [`ENTRY_DIR`] that defines `main`. A file
/// named `main.*` wins over the rest; otherwise the first by name.
pub fn locate_entry(source: &Path) -> Result<EntrySource> {
    let dir = source.join(ENTRY_DIR);
    let mut files: Vec<PathBuf> = WalkDir::new(&dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext == "c" || ext == "cc" || ext == "cpp")
        })
        .collect();
    files.sort_by_key(|path| (path.file_stem() != Some(OsStr::new("main")), path.clone()));

    for path in files {
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        if templates::entry_line(&text).is_some() {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            return Ok(EntrySource {
                path: format!("{ENTRY_DIR}/{name}"),
                text,
            });
        }
    }
    Err(Error::EntryNotFound { path: dir })
}

/// Reset the tree, render the entry patch against it and apply it. Safe to
/// repeat with different options. Returns the patch path.
pub async fn apply_patch(
    source: &Path,
    output_dir: &Path,
    opts: &PatchOptions,
    runner: &dyn CommandRunner,
) -> Result<PathBuf> {
    restore_tree(source, runner).await?;
    let entry = locate_entry(source)?;
    let patch = templates::write_patch(output_dir, opts, &entry)?;

    // `git -C` resolves relative paths against the checkout.
    let patch = fs::canonicalize(&patch).at(&patch)?;
    let apply = ToolCommand::new("git")
        .arg("-C")
        .arg(source)
        .args(["apply", "--whitespace=nowarn"])
        .arg(&patch);
    apply.check(runner.run(&apply).await?)?;
    tracing::info!(entry = %entry.path, patch = %patch.display(), "applied entry patch");
    Ok(patch)
}

/// Run `make` in `source` and return the produced binary.
pub async fn compile(
    config: &BuildConfig,
    source: &Path,
    build_log: &Path,
    runner: &dyn CommandRunner,
) -> Result<PathBuf> {
    let cmd = ToolCommand::new("make")
        .args(make_args(config))
        .current_dir(source)
        .log_to(build_log);
    tracing::info!(command = %cmd, log = %build_log.display(), "building");

    let status = runner.run(&cmd).await?;
    if !status.success() {
        tracing::error!(log = %build_log.display(), "build failed; see the build log");
    }
    cmd.check(status)?;

    let binary = locate_binary(source)?;
    tracing::info!(binary = %binary.display(), "build finished");
    Ok(binary)
}

/// Newest file named [`BINARY_NAME`] under the object directory.
pub fn locate_binary(source: &Path) -> Result<PathBuf> {
    let root = source.join(OBJECT_DIR);
    WalkDir::new(&root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == BINARY_NAME)
        .max_by_key(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
        .map(|entry| entry.into_path())
        .ok_or_else(|| Error::ArtifactNotFound {
            pattern: BINARY_NAME.to_owned(),
            dir: root,
        })
}

/// Write `binary` followed immediately by `payload` to `output`. The boot
/// loader finds the model right after the binary's last byte, so nothing
/// may be inserted between them. Returns the total length.
pub fn concatenate(binary: &Path, payload: &Path, output: &Path) -> Result<u64> {
    let mut out = File::create(output).at(output)?;
    let mut total = 0;
    for input in [binary, payload] {
        let mut file = File::open(input).at(input)?;
        total += io::copy(&mut file, &mut out).at(output)?;
    }
    out.sync_all().at(output)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BootModes, ModelSource};
    use crate::runner::fake::FakeRunner;
    use crate::runner::Exit;

    fn config(arches: Arches, vga: bool) -> BuildConfig {
        BuildConfig {
            repo: "repo".into(),
            model: ModelSource::Local("m.gguf".into()),
            build_dir: "build".into(),
            output_dir: "output".into(),
            boot_modes: BootModes::Both,
            arches,
            memory: "2G".into(),
            verbose: false,
            test: false,
            vga,
            runtime_args: None,
        }
    }

    #[test]
    fn make_flags() {
        let args = make_args(&config(Arches::Aarch64, true));
        assert!(args[0].starts_with("-j"));
        assert_eq!(&args[1..], [BUILD_MODE, "ARCH=aarch64", VGA_DEFINE]);

        let args = make_args(&config(Arches::Both, false));
        assert_eq!(&args[1..], [BUILD_MODE]);
    }

    #[test]
    fn concatenation_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let binary: Vec<u8> = (0..=255u8).cycle().take(4099).collect();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        fs::write(dir.path().join("bin"), &binary).unwrap();
        fs::write(dir.path().join("model"), &payload).unwrap();

        let out = dir.path().join("final");
        let len = concatenate(&dir.path().join("bin"), &dir.path().join("model"), &out).unwrap();

        let joined = fs::read(&out).unwrap();
        assert_eq!(len as usize, binary.len() + payload.len());
        assert_eq!(joined.len(), binary.len() + payload.len());
        assert_eq!(&joined[..binary.len()], &binary[..]);
        assert_eq!(&joined[binary.len()..], &payload[..]);
    }

    #[test]
    fn locate_finds_binary_in_object_tree() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("o/opt/llamafile");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("llamafile"), b"MZqFpD").unwrap();
        fs::write(nested.join("llamafile.dbg"), b"ELF").unwrap();
        assert_eq!(locate_binary(dir.path()).unwrap(), nested.join("llamafile"));
    }

    #[test]
    fn locate_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let err = locate_binary(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn build_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::with(|_| Exit(Some(2)));
        let err = compile(
            &config(Arches::X86_64, false),
            dir.path(),
            &dir.path().join("build.log"),
            &runner,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { ref tool, .. } if tool == "make"));
        assert_eq!(runner.calls().len(), 1);
    }

    const MAIN_CPP: &str = "#include <stdio.h>\n\nint main(int argc, char **argv) {\n    return argc - 1;\n}\n";

    #[test]
    fn entry_prefers_main_translation_unit() {
        let dir = tempfile::tempdir().unwrap();
        let llamafile = dir.path().join(ENTRY_DIR);
        fs::create_dir_all(&llamafile).unwrap();
        fs::write(llamafile.join("a_tool.c"), "int main(void) { return 0; }\n").unwrap();
        fs::write(llamafile.join("main.cpp"), MAIN_CPP).unwrap();
        fs::write(llamafile.join("main.h"), "int main(int, char **);\n").unwrap();

        let entry = locate_entry(dir.path()).unwrap();
        assert_eq!(entry.path, "llamafile/main.cpp");
        assert_eq!(entry.text, MAIN_CPP);

        fs::remove_file(llamafile.join("main.cpp")).unwrap();
        assert_eq!(locate_entry(dir.path()).unwrap().path, "llamafile/a_tool.c");

        fs::remove_file(llamafile.join("a_tool.c")).unwrap();
        assert!(matches!(locate_entry(dir.path()), Err(Error::EntryNotFound { .. })));
    }

    #[tokio::test]
    async fn patch_resets_tree_before_applying() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join(ENTRY_DIR)).unwrap();
        fs::write(src.join("llamafile/main.cpp"), MAIN_CPP).unwrap();
        fs::write(src.join(PATCHED_SOURCE), "stale").unwrap();

        let runner = FakeRunner::new();
        let opts = PatchOptions {
            vga_console: false,
            init_args: None,
        };
        let patch = apply_patch(&src, dir.path(), &opts, &runner).await.unwrap();

        assert!(!src.join(PATCHED_SOURCE).exists());
        assert!(fs::read_to_string(patch).unwrap().contains("llamafile_main"));
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].has_arg("checkout") && calls[0].has_arg(ENTRY_DIR));
        assert!(calls[1].has_arg("apply") && calls[1].has_arg("--whitespace=nowarn"));
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=build", "-c", "user.email=build@localhost", "-c", "commit.gpgsign=false"])
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    #[tokio::test]
    async fn reapplying_with_new_options_replaces_the_glue() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        fs::create_dir_all(src.join(ENTRY_DIR)).unwrap();
        fs::create_dir_all(&out).unwrap();
        fs::write(src.join("llamafile/main.cpp"), MAIN_CPP).unwrap();
        git(&src, &["init", "-q"]);
        git(&src, &["add", "."]);
        git(&src, &["commit", "-q", "-m", "upstream"]);

        let first = PatchOptions {
            vga_console: false,
            init_args: Some(vec!["--interactive".into()]),
        };
        let second = PatchOptions {
            vga_console: true,
            init_args: None,
        };
        let runner = crate::runner::SystemRunner;
        apply_patch(&src, &out, &first, &runner).await.unwrap();
        apply_patch(&src, &out, &first, &runner).await.unwrap();
        apply_patch(&src, &out, &second, &runner).await.unwrap();

        let glue = fs::read_to_string(src.join(PATCHED_SOURCE)).unwrap();
        assert!(glue.contains("__static_yoink(\"vga_console\");"));
        assert!(!glue.contains("metal_argv"));

        let main = fs::read_to_string(src.join("llamafile/main.cpp")).unwrap();
        assert_eq!(main.matches("llamafile_main").count(), 1);
        assert!(main.contains("extern \"C\" int llamafile_main(int argc, char **argv) {"));
        assert!(!main.contains("int main("));
    }
}
