//! Generated text files: the bare-metal entry patch applied to the
//! upstream tree, and the GDB command script for attaching to QEMU.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::IoContext;
use crate::{Error, Result};

pub const PATCH_FILE: &str = "metal-boot.patch";
pub const GDB_SCRIPT: &str = "gdb-commands.gdb";

/// Directory of the upstream tree the patch touches.
pub const ENTRY_DIR: &str = "llamafile";

/// File the patch creates inside the source tree.
pub const PATCHED_SOURCE: &str = "llamafile/metal_boot.c";

/// What upstream `main` is renamed to; the generated `main` calls it.
pub const RENAMED_MAIN: &str = "llamafile_main";

/// QEMU's `-gdb tcp::1234` stub.
pub const GDB_PORT: u16 = 1234;

/// Symbols every APE program passes through on the way to `main`.
pub const ENTRY_SYMBOLS: [&str; 2] = ["_start", "main"];

/// What goes into the entry patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    /// Link the VGA text console driver.
    pub vga_console: bool,
    /// Arguments a bare-metal boot runs with. `None` keeps whatever the
    /// loader passes.
    pub init_args: Option<Vec<String>>,
}

/// The upstream translation unit that defines `main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySource {
    /// Relative to the source root, `/`-separated.
    pub path: String,
    pub text: String,
}

impl EntrySource {
    fn is_cxx(&self) -> bool {
        [".cpp", ".cc", ".cxx"].iter().any(|ext| self.path.ends_with(ext))
    }
}

/// Split `--args` into words with shell quoting rules.
pub fn split_args(raw: &str) -> Result<Vec<String>> {
    shlex::split(raw)
        .ok_or_else(|| Error::Config(format!("unbalanced quoting in arguments: {raw}")))
}

/// Quote `s` as a C string literal.
fn c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\{:03o}", c as u32 & 0xff)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// The C source the patch adds. It owns `main`, so the linker always pulls
/// it in along with its yoinks.
pub fn render_metal_source(opts: &PatchOptions) -> String {
    let mut src = String::new();
    src.push_str("// Bare-metal (BIOS/UEFI) entry glue. Generated; do not edit.\n");
    src.push_str("#include \"libc/cosmo.h\"\n");
    src.push_str("#include \"libc/dce.h\"\n\n");
    src.push_str("__static_yoink(\"EfiMain\");\n");
    if opts.vga_console {
        src.push_str("__static_yoink(\"vga_console\");\n");
    }

    if let Some(args) = &opts.init_args {
        src.push_str("\nstatic char *metal_argv[] = {\n");
        src.push_str("    \"llamafile\",\n");
        for arg in args {
            src.push_str(&format!("    {},\n", c_string(arg)));
        }
        src.push_str("    0,\n};\n");
    }

    src.push_str(&format!("\nint {RENAMED_MAIN}(int, char **);\n\n"));
    src.push_str("int main(int argc, char **argv) {\n");
    if opts.init_args.is_some() {
        src.push_str("    if (IsMetal()) {\n");
        src.push_str("        argc = sizeof(metal_argv) / sizeof(*metal_argv) - 1;\n");
        src.push_str("        argv = metal_argv;\n");
        src.push_str("    }\n");
    }
    src.push_str(&format!("    return {RENAMED_MAIN}(argc, argv);\n"));
    src.push_str("}\n");
    src
}

/// Index of the line that defines `main`.
pub fn entry_line(text: &str) -> Option<usize> {
    text.lines().position(|line| {
        line.trim_start()
            .strip_prefix("int main")
            .is_some_and(|rest| rest.trim_start().starts_with('('))
    })
}

fn push_diff_line(patch: &mut String, tag: char, line: &str) {
    patch.push(tag);
    patch.push_str(line);
    if !line.ends_with('\n') {
        patch.push_str("\n\\ No newline at end of file\n");
    }
}

/// A diff renaming upstream `main` to [`RENAMED_MAIN`].
pub fn render_entry_diff(entry: &EntrySource) -> Result<String> {
    let idx = entry_line(&entry.text).ok_or_else(|| Error::EntryNotFound {
        path: PathBuf::from(&entry.path),
    })?;
    let lines: Vec<&str> = entry.text.split_inclusive('\n').collect();
    let start = idx.saturating_sub(3);
    let end = (idx + 4).min(lines.len());
    let renamed = if entry.is_cxx() {
        format!("extern \"C\" int {RENAMED_MAIN}")
    } else {
        format!("int {RENAMED_MAIN}")
    };

    let mut patch = format!(
        "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -{from},{n} +{from},{n} @@\n",
        path = entry.path,
        from = start + 1,
        n = end - start,
    );
    for (i, line) in lines.iter().enumerate().take(end).skip(start) {
        if i == idx {
            push_diff_line(&mut patch, '-', line);
            push_diff_line(&mut patch, '+', &line.replacen("int main", &renamed, 1));
        } else {
            push_diff_line(&mut patch, ' ', line);
        }
    }
    Ok(patch)
}

/// Git diff that reroutes `entry`'s `main` through [`PATCHED_SOURCE`].
pub fn render_patch(opts: &PatchOptions, entry: &EntrySource) -> Result<String> {
    let mut patch = render_entry_diff(entry)?;
    let source = render_metal_source(opts);
    let lines: Vec<&str> = source.lines().collect();
    patch.push_str(&format!(
        "diff --git a/{path} b/{path}\nnew file mode 100644\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{n} @@\n",
        path = PATCHED_SOURCE,
        n = lines.len(),
    ));
    for line in lines {
        patch.push('+');
        patch.push_str(line);
        patch.push('\n');
    }
    Ok(patch)
}

pub fn write_patch(output_dir: &Path, opts: &PatchOptions, entry: &EntrySource) -> Result<PathBuf> {
    let path = output_dir.join(PATCH_FILE);
    fs::write(&path, render_patch(opts, entry)?).at(&path)?;
    tracing::info!(path = %path.display(), entry = %entry.path, "wrote entry patch");
    Ok(path)
}

/// Debug symbol files the build leaves next to `binary`, most specific
/// first.
pub fn symbol_candidates(binary: &Path) -> Vec<PathBuf> {
    let dir = binary.parent().unwrap_or_else(|| Path::new(""));
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = binary
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut candidates: Vec<PathBuf> = Vec::new();
    for file in [
        format!("{name}.dbg"),
        format!("{stem}.com.dbg"),
        format!("{stem}.dbg"),
        format!("{stem}.elf"),
    ] {
        let path = dir.join(file);
        if !candidates.contains(&path) {
            candidates.push(path);
        }
    }
    candidates
}

pub fn find_symbols(binary: &Path) -> Option<PathBuf> {
    symbol_candidates(binary).into_iter().find(|p| p.is_file())
}

pub fn render_gdb_script(symbols: Option<&Path>) -> String {
    let mut script = String::new();
    script.push_str("set confirm off\n");
    script.push_str("set pagination off\n");
    script.push_str("set disassembly-flavor intel\n");
    script.push_str(&format!("target remote localhost:{GDB_PORT}\n"));
    match symbols {
        Some(path) => script.push_str(&format!("symbol-file {}\n", path.display())),
        None => script.push_str("echo warning: no debug symbols found, continuing without\\n\n"),
    }
    for symbol in ENTRY_SYMBOLS {
        script.push_str(&format!("tbreak {symbol}\n"));
    }
    script.push_str("continue\n");
    script
}

/// Write the GDB script for `binary` and mark it executable. Returns the
/// script path and the symbol file it loads, if any.
pub fn write_gdb_script(output_dir: &Path, binary: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
    let symbols = find_symbols(binary);
    if symbols.is_none() {
        tracing::warn!(
            binary = %binary.display(),
            "no debug symbols found; GDB will run without them"
        );
    }

    let path = output_dir.join(GDB_SCRIPT);
    fs::write(&path, render_gdb_script(symbols.as_deref())).at(&path)?;
    make_executable(&path)?;
    tracing::info!(path = %path.display(), "wrote GDB script");
    Ok((path, symbols))
}

#[cfg(unix)]
pub(crate) fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path).at(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms).at(path)
}

#[cfg(not(unix))]
pub(crate) fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN_CPP: &str = "#include <stdio.h>\n\nstatic int helper() { return 0; }\n\nint main(int argc, char **argv) {\n    return helper();\n}\n";

    fn entry(path: &str, text: &str) -> EntrySource {
        EntrySource {
            path: path.into(),
            text: text.into(),
        }
    }

    #[test]
    fn split_plain_words() {
        assert_eq!(
            split_args("--interactive  --log-disable").unwrap(),
            ["--interactive", "--log-disable"]
        );
        assert!(split_args("   ").unwrap().is_empty());
    }

    #[test]
    fn split_honours_quotes_and_escapes() {
        assert_eq!(
            split_args(r#"-p "hello world" --x 'a "b"' c\ d e"#).unwrap(),
            ["-p", "hello world", "--x", "a \"b\"", "c d", "e"]
        );
        assert_eq!(split_args(r#""say \"hi\"""#).unwrap(), ["say \"hi\""]);
    }

    #[test]
    fn split_rejects_unterminated_quotes() {
        assert!(matches!(split_args("-p \"oops"), Err(Error::Config(_))));
        assert!(split_args("'oops").is_err());
    }

    #[test]
    fn source_escapes_arguments() {
        let src = render_metal_source(&PatchOptions {
            vga_console: false,
            init_args: Some(vec!["-p".into(), "say \"hi\"\\".into()]),
        });
        assert!(src.contains(r#"    "say \"hi\"\\","#), "{src}");
        assert!(src.contains("__static_yoink(\"EfiMain\");"));
        assert!(!src.contains("vga_console"));
        assert!(src.contains("int main(int argc, char **argv) {"));
        assert!(src.contains("if (IsMetal())"));
        assert!(src.contains("return llamafile_main(argc, argv);"));
    }

    #[test]
    fn glue_without_args_still_owns_main() {
        let src = render_metal_source(&PatchOptions {
            vga_console: true,
            init_args: None,
        });
        assert!(src.contains("__static_yoink(\"vga_console\");"));
        assert!(!src.contains("metal_argv"));
        assert!(!src.contains("IsMetal"));
        assert!(src.contains("int main(int argc, char **argv) {"));
    }

    #[test]
    fn patch_renames_upstream_main() {
        let opts = PatchOptions {
            vga_console: true,
            init_args: Some(vec!["--interactive".into()]),
        };
        let patch = render_patch(&opts, &entry("llamafile/main.cpp", MAIN_CPP)).unwrap();

        assert!(patch.starts_with("diff --git a/llamafile/main.cpp b/llamafile/main.cpp\n"));
        assert!(patch.contains("@@ -2,6 +2,6 @@\n"), "{patch}");
        assert!(patch.contains("\n-int main(int argc, char **argv) {\n"));
        assert!(patch.contains("\n+extern \"C\" int llamafile_main(int argc, char **argv) {\n"));
        assert!(patch.contains("\n static int helper() { return 0; }\n"));

        let body = render_metal_source(&opts);
        let n = body.lines().count();
        assert!(patch.contains(&format!("+++ b/{PATCHED_SOURCE}\n@@ -0,0 +1,{n} @@\n")));
    }

    #[test]
    fn c_entry_keeps_c_linkage() {
        let diff = render_entry_diff(&entry("llamafile/main.c", "int main(void)\n{\n}\n")).unwrap();
        assert!(diff.contains("@@ -1,3 +1,3 @@\n"));
        assert!(diff.contains("\n+int llamafile_main(void)\n"));
        assert!(!diff.contains("extern"));
    }

    #[test]
    fn entry_without_trailing_newline() {
        let diff = render_entry_diff(&entry("llamafile/main.c", "int x;\nint main() { return x; }")).unwrap();
        assert!(diff.ends_with(
            "-int main() { return x; }\n\\ No newline at end of file\n+int llamafile_main() { return x; }\n\\ No newline at end of file\n"
        ));
    }

    #[test]
    fn entry_must_define_main() {
        let err = render_entry_diff(&entry("llamafile/util.c", "int maintain(void);\n")).unwrap_err();
        assert!(matches!(err, Error::EntryNotFound { .. }));
        assert_eq!(entry_line("  int main (void)"), Some(0));
    }

    #[test]
    fn gdb_script_without_symbols() {
        let script = render_gdb_script(None);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "set confirm off");
        assert_eq!(lines[3], "target remote localhost:1234");
        assert!(lines[4].starts_with("echo warning"));
        assert_eq!(&lines[5..], ["tbreak _start", "tbreak main", "continue"]);
    }

    #[test]
    fn gdb_script_loads_found_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("llamafile.com");
        fs::write(&binary, b"MZ").unwrap();
        fs::write(dir.path().join("llamafile.com.dbg"), b"ELF").unwrap();

        let (script, symbols) = write_gdb_script(dir.path(), &binary).unwrap();
        let symbols = symbols.unwrap();
        assert_eq!(symbols, dir.path().join("llamafile.com.dbg"));
        let text = fs::read_to_string(&script).unwrap();
        assert!(text.contains(&format!("symbol-file {}", symbols.display())));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&script).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn symbol_candidates_for_plain_binary() {
        let c = symbol_candidates(Path::new("/o/llamafile"));
        assert_eq!(c[0], Path::new("/o/llamafile.dbg"));
        assert_eq!(c[1], Path::new("/o/llamafile.com.dbg"));
        assert_eq!(c.len(), 3);
    }
}
