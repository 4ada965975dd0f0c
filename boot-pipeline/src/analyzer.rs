//! Scan captured serial output for known markers and write the boot
//! summary. This is a fixed substring table, not a parser.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::config::DebugConfig;
use crate::error::IoContext;
use crate::Result;

/// Lines of serial output kept in the summary.
pub const TAIL_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Success => "SUCCESS",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub pattern: &'static str,
    pub severity: Severity,
    pub message: &'static str,
}

pub const RULES: &[Rule] = &[
    Rule {
        pattern: "Kernel panic",
        severity: Severity::Error,
        message: "guest panicked",
    },
    Rule {
        pattern: "CPU Reset",
        severity: Severity::Error,
        message: "CPU reset during boot (probably a triple fault)",
    },
    Rule {
        pattern: "ACPI Error",
        severity: Severity::Warning,
        message: "ACPI error reported; often harmless under emulation",
    },
    Rule {
        pattern: "llama_new_context_with_model",
        severity: Severity::Success,
        message: "model loaded and inference context created",
    },
    Rule {
        pattern: "failed to allocate",
        severity: Severity::Error,
        message: "memory allocation failed; try a larger --memory",
    },
];

/// Substrings that suggest a CPU exception or crash handler fired.
pub const EXCEPTION_MARKERS: &[&str] = &[
    "exception",
    "Exception",
    "#GP",
    "#PF",
    "#UD",
    "SIGSEGV",
    "Uncaught",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    /// Every matching rule, in table order. Rules are not exclusive.
    pub findings: Vec<Rule>,
    pub empty: bool,
    pub exceptions: bool,
}

pub fn analyze(log: &str) -> Analysis {
    Analysis {
        findings: RULES
            .iter()
            .filter(|rule| log.contains(rule.pattern))
            .copied()
            .collect(),
        empty: log.trim().is_empty(),
        exceptions: EXCEPTION_MARKERS.iter().any(|m| log.contains(m)),
    }
}

impl Analysis {
    pub fn recommendations(&self) -> Vec<&'static str> {
        if self.empty {
            return vec![
                "No serial output was captured. Check that the image is bootable in this mode and that the firmware is correct.",
                "Boot again with --gdb --wait and step from _start to see how far it gets.",
            ];
        }
        if self.exceptions {
            vec![
                "A CPU exception appears in the output. Boot again with --gdb --wait and break on the faulting address.",
                "Inspect the monitor log for the register state at the time of the fault.",
            ]
        } else {
            vec!["No exceptions detected. If the boot stalls, compare the last lines above against a known-good boot."]
        }
    }

    /// Emit each finding as a leveled log line.
    pub fn log(&self) {
        for rule in &self.findings {
            match rule.severity {
                Severity::Success => crate::success!(marker = rule.pattern, "{}", rule.message),
                Severity::Warning => tracing::warn!(marker = rule.pattern, "{}", rule.message),
                Severity::Error => tracing::error!(marker = rule.pattern, "{}", rule.message),
            }
        }
        if self.empty {
            tracing::warn!("no serial output captured");
        }
    }
}

/// Read a serial log; a log the emulator never created reads as empty.
pub fn read_log(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).at(path),
    }
}

pub fn tail_lines(log: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = log.lines().collect();
    lines[lines.len().saturating_sub(n)..].to_vec()
}

pub fn render_summary(
    session: &str,
    config: &DebugConfig,
    serial_log: &Path,
    log: &str,
    analysis: &Analysis,
) -> String {
    let mut s = String::new();
    s.push_str("Boot debug summary\n");
    s.push_str("==================\n");
    s.push_str(&format!("Session:    {session}\n"));
    s.push_str(&format!("Image:      {}\n", config.image.display()));
    s.push_str(&format!("Mode:       {}\n", config.mode));
    s.push_str(&format!("Arch:       {}\n", config.arch));
    s.push_str(&format!("Memory:     {}\n", config.memory));
    let gdb = match (config.gdb, config.wait) {
        (false, _) => "disabled",
        (true, false) => "enabled",
        (true, true) => "enabled, waiting for attach",
    };
    s.push_str(&format!("GDB:        {gdb}\n"));
    s.push_str(&format!("Serial log: {}\n", serial_log.display()));

    s.push_str("\nFindings\n--------\n");
    if analysis.findings.is_empty() {
        s.push_str("(none)\n");
    }
    for rule in &analysis.findings {
        s.push_str(&format!(
            "[{}] {} (matched \"{}\")\n",
            rule.severity, rule.message, rule.pattern
        ));
    }

    s.push_str(&format!("\nLast {TAIL_LINES} lines of serial output\n"));
    s.push_str("-----------------------------------\n");
    if analysis.empty {
        s.push_str("(empty)\n");
    }
    for line in tail_lines(log, TAIL_LINES) {
        s.push_str(&format!("{line}\n"));
    }

    s.push_str("\nRecommendations\n---------------\n");
    for rec in analysis.recommendations() {
        s.push_str(&format!("- {rec}\n"));
    }
    s
}

pub fn write_summary(
    path: &Path,
    session: &str,
    config: &DebugConfig,
    serial_log: &Path,
) -> Result<Analysis> {
    let log = read_log(serial_log)?;
    let analysis = analyze(&log);
    analysis.log();
    fs::write(path, render_summary(session, config, serial_log, &log, &analysis)).at(path)?;
    tracing::info!(path = %path.display(), "wrote boot summary");
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Arch, BootMode};

    fn config() -> DebugConfig {
        DebugConfig {
            image: "out/llamafile-bios.img".into(),
            mode: BootMode::Bios,
            arch: Arch::X86_64,
            memory: "2G".into(),
            output_dir: "out".into(),
            gdb: true,
            wait: true,
            verbose: false,
        }
    }

    fn severities(a: &Analysis) -> Vec<Severity> {
        a.findings.iter().map(|r| r.severity).collect()
    }

    #[test]
    fn success_marker() {
        let a = analyze("loading\nllama_new_context_with_model: n_ctx = 512\n");
        assert_eq!(severities(&a), [Severity::Success]);
        assert!(!a.empty);
        assert!(!a.exceptions);
    }

    #[test]
    fn panic_marker() {
        let a = analyze("Kernel panic - not syncing\n");
        assert_eq!(severities(&a), [Severity::Error]);
    }

    #[test]
    fn markers_are_not_exclusive() {
        let log = "llama_new_context_with_model\nACPI Error: x\nKernel panic\n";
        let a = analyze(log);
        assert_eq!(
            severities(&a),
            [Severity::Error, Severity::Warning, Severity::Success]
        );
    }

    #[test]
    fn recommendations_follow_log_state() {
        let empty = analyze(" \n");
        assert!(empty.empty);
        assert!(empty.recommendations()[0].starts_with("No serial output"));

        let crashed = analyze("Uncaught SIGSEGV at 0x1234");
        assert!(crashed.exceptions);
        assert!(crashed.recommendations()[0].contains("CPU exception"));

        let clean = analyze("hello");
        assert!(clean.recommendations()[0].starts_with("No exceptions"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let log: String = (0..60).map(|i| format!("line {i}\n")).collect();
        let tail = tail_lines(&log, TAIL_LINES);
        assert_eq!(tail.len(), 50);
        assert_eq!(tail[0], "line 10");
        assert_eq!(tail_lines("a\nb", 50), ["a", "b"]);
    }

    #[test]
    fn summary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let serial = dir.path().join("serial.log");
        fs::write(&serial, "boot\nKernel panic\nllama_new_context_with_model\n").unwrap();
        let summary = dir.path().join("summary.txt");

        let analysis = write_summary(&summary, "20240101_000000", &config(), &serial).unwrap();
        assert_eq!(analysis.findings.len(), 2);

        let text = fs::read_to_string(&summary).unwrap();
        assert!(text.contains("Session:    20240101_000000"));
        assert!(text.contains("GDB:        enabled, waiting for attach"));
        assert!(text.contains("[ERROR] guest panicked"));
        assert!(text.contains("[SUCCESS] model loaded"));
        assert!(text.contains("\nboot\n"));
    }

    #[test]
    fn missing_serial_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_log(&dir.path().join("nope")).unwrap(), "");
    }

    #[test]
    fn empty_summary_sections() {
        let analysis = analyze("");
        let text = render_summary("s1", &config(), Path::new("serial.log"), "", &analysis);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Boot debug summary");
        assert!(lines.contains(&"Serial log: serial.log"));
        assert!(text.contains("\nFindings\n--------\n(none)\n"));
        assert!(text.contains("\nLast 50 lines of serial output\n"));
        assert!(text.contains("(empty)\n"));
        assert!(text.contains("\nRecommendations\n---------------\n- No serial output"));
    }
}
