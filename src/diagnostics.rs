//! Build log classification.
//!
//! Each log line is offered to the compiler pattern, then the linker,
//! build-system and toolchain heuristics, in that order. The first match
//! wins. Lines nothing recognises are dropped.

use crate::core::{Diagnostic, DiagnosticKind, DiagnosticSummary, Severity};
use crate::execution::SANDBOX_MOUNT_POINTS;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

static COMPILER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?):(\d+):(?:(\d+):)?\s*(fatal error|error|warning|note):\s*(.+)$")
        .expect("compiler pattern")
});
static UNDEFINED_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"undefined reference to [`']([^`']+)'").expect("undefined pattern"));
static MULTIPLE_DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"multiple definition of [`']([^`']+)'").expect("multiple definition pattern")
});
static MISSING_LIBRARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cannot find -l?([\w.+-]+)").expect("missing library pattern"));
static SECTION_OVERFLOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"section [`']([^`']+)' will not fit in region [`']([^`']+)'")
        .expect("section overflow pattern")
});
static REGION_OVERFLOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"region [`']([^`']+)' overflowed by (\d+) bytes").expect("region overflow pattern")
});
static LINKER_TOOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s/])(?:[\w-]*-)?(?:ld(?:\.\w+)?|collect2)(?:\.exe)?:\s*(.*)$")
        .expect("linker tool pattern")
});
static MAKE_TARGET_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"make(?:\[\d+\])?:\s*\*\*\*\s*\[(.*?)\]\s*Error\s*(\d+)").expect("make failure pattern")
});
static MAKE_NO_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"make(?:\[\d+\])?:\s*\*\*\*\s*No rule to make target [`'"](.+?)['"]"#)
        .expect("make no rule pattern")
});
static CMAKE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^CMake (Error|Warning)(?: \(dev\))? at (.+?):(\d+)").expect("cmake pattern")
});
static TOOL_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"arm-none-eabi-(gcc|g\+\+|cpp|as|objcopy|size):\s*(?:fatal )?error:\s*(.+)")
        .expect("toolchain pattern")
});

/// Classify a raw build log. Output is ordered error, warning, note; ties
/// keep the order they appeared in the log.
pub fn classify(log: &str, workspace_root: Option<&Path>) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = log
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| classify_line(line, workspace_root))
        .collect();

    // Stable sort keeps discovery order within a severity.
    diagnostics.sort_by_key(|d| d.severity);
    diagnostics
}

pub fn classify_line(line: &str, workspace_root: Option<&Path>) -> Option<Diagnostic> {
    parse_compiler(line, workspace_root)
        .or_else(|| parse_linker(line))
        .or_else(|| parse_build_system(line, workspace_root))
        .or_else(|| parse_toolchain(line))
}

fn parse_compiler(line: &str, workspace_root: Option<&Path>) -> Option<Diagnostic> {
    let caps = COMPILER.captures(line)?;
    let file = caps.get(1)?.as_str();
    // "main.c:(.text+0x1c): undefined reference" style lines belong to the linker.
    if file.is_empty() || file.contains("(.") {
        return None;
    }
    let line_no = caps.get(2)?.as_str().parse().ok()?;
    let column = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let severity = match caps.get(4)?.as_str() {
        "warning" => Severity::Warning,
        "note" => Severity::Note,
        _ => Severity::Error,
    };

    Some(Diagnostic {
        kind: DiagnosticKind::Compiler,
        severity,
        file: normalize_path(file, workspace_root),
        line: line_no,
        column,
        message: caps.get(5)?.as_str().trim().to_string(),
        raw: line.to_string(),
    })
}

fn parse_linker(line: &str) -> Option<Diagnostic> {
    let (severity, message) = if let Some(caps) = UNDEFINED_REFERENCE.captures(line) {
        (Severity::Error, format!("undefined reference to '{}'", &caps[1]))
    } else if let Some(caps) = MULTIPLE_DEFINITION.captures(line) {
        (Severity::Error, format!("multiple definition of '{}'", &caps[1]))
    } else if let Some(caps) = SECTION_OVERFLOW.captures(line) {
        (
            Severity::Error,
            format!("section '{}' does not fit in region '{}'", &caps[1], &caps[2]),
        )
    } else if let Some(caps) = REGION_OVERFLOW.captures(line) {
        (
            Severity::Error,
            format!("region '{}' overflowed by {} bytes", &caps[1], &caps[2]),
        )
    } else if let Some(caps) = LINKER_TOOL.captures(line) {
        let rest = caps[1].trim();
        if let Some(caps) = MISSING_LIBRARY.captures(rest) {
            (Severity::Error, format!("cannot find library '{}'", &caps[1]))
        } else if let Some(warning) = rest.strip_prefix("warning:") {
            (Severity::Warning, warning.trim().to_string())
        } else if rest.contains("error") || rest.contains("undefined") {
            (Severity::Error, rest.to_string())
        } else {
            return None;
        }
    } else {
        return None;
    };

    Some(located(DiagnosticKind::Linker, severity, message, line))
}

fn parse_build_system(line: &str, workspace_root: Option<&Path>) -> Option<Diagnostic> {
    if let Some(caps) = MAKE_TARGET_FAILED.captures(line) {
        return Some(located(
            DiagnosticKind::BuildSystem,
            Severity::Error,
            format!("target '{}' failed with exit code {}", &caps[1], &caps[2]),
            line,
        ));
    }
    if let Some(caps) = MAKE_NO_RULE.captures(line) {
        return Some(located(
            DiagnosticKind::BuildSystem,
            Severity::Error,
            format!("no rule to make target '{}'", &caps[1]),
            line,
        ));
    }
    let caps = CMAKE_ERROR.captures(line)?;
    let severity = if &caps[1] == "Warning" {
        Severity::Warning
    } else {
        Severity::Error
    };
    Some(Diagnostic {
        kind: DiagnosticKind::BuildSystem,
        severity,
        file: normalize_path(&caps[2], workspace_root),
        line: caps[3].parse().unwrap_or(0),
        column: 0,
        message: format!("CMake {}", caps[1].to_ascii_lowercase()),
        raw: line.to_string(),
    })
}

fn parse_toolchain(line: &str) -> Option<Diagnostic> {
    if line.contains("command not found") {
        let command = line
            .split(':')
            .rev()
            .nth(1)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or("unknown");
        return Some(located(
            DiagnosticKind::Toolchain,
            Severity::Error,
            format!("command not found: {}", command),
            line,
        ));
    }
    let caps = TOOL_ERROR.captures(line)?;
    Some(located(
        DiagnosticKind::Toolchain,
        Severity::Error,
        format!("{} failed: {}", &caps[1], caps[2].trim()),
        line,
    ))
}

fn located(kind: DiagnosticKind, severity: Severity, message: String, raw: &str) -> Diagnostic {
    Diagnostic {
        kind,
        severity,
        file: String::new(),
        line: 0,
        column: 0,
        message,
        raw: raw.to_string(),
    }
}

/// Rewrite absolute paths under the workspace (or the sandbox mount points)
/// to workspace-relative form. Anything else is returned unchanged.
pub fn normalize_path(file: &str, workspace_root: Option<&Path>) -> String {
    let path = Path::new(file);
    if !path.is_absolute() {
        return file.to_string();
    }
    let cleaned = lexical_clean(path);

    let mut roots: Vec<PathBuf> = workspace_root.map(lexical_clean).into_iter().collect();
    roots.extend(SANDBOX_MOUNT_POINTS.iter().map(PathBuf::from));

    for root in &roots {
        if let Ok(relative) = cleaned.strip_prefix(root) {
            if !relative.as_os_str().is_empty() {
                return relative.to_string_lossy().into_owned();
            }
        }
    }
    file.to_string()
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

pub fn summarize(diagnostics: &[Diagnostic]) -> DiagnosticSummary {
    let mut seen = HashSet::new();
    let mut file_list = Vec::new();
    for diagnostic in diagnostics {
        let key = if diagnostic.file.is_empty() {
            "(global)"
        } else {
            diagnostic.file.as_str()
        };
        if seen.insert(key) {
            file_list.push(key.to_string());
        }
    }
    let files_affected = file_list.len();
    file_list.truncate(10);

    DiagnosticSummary {
        total: diagnostics.len(),
        errors: count(diagnostics, Severity::Error),
        warnings: count(diagnostics, Severity::Warning),
        notes: count(diagnostics, Severity::Note),
        files_affected,
        file_list,
    }
}

fn count(diagnostics: &[Diagnostic], severity: Severity) -> usize {
    diagnostics.iter().filter(|d| d.severity == severity).count()
}

/// One line for humans, e.g. `error[compiler] Core/Src/main.c:42:10: 'Foo' undeclared`.
pub fn format_diagnostic(diagnostic: &Diagnostic) -> String {
    let location = if diagnostic.file.is_empty() {
        "(global)".to_string()
    } else if diagnostic.column > 0 {
        format!("{}:{}:{}", diagnostic.file, diagnostic.line, diagnostic.column)
    } else if diagnostic.line > 0 {
        format!("{}:{}", diagnostic.file, diagnostic.line)
    } else {
        diagnostic.file.clone()
    };
    format!(
        "{}[{}] {}: {}",
        diagnostic.severity, diagnostic.kind, location, diagnostic.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_untouched() {
        assert_eq!(normalize_path("Core/Src/main.c", Some(Path::new("/ws"))), "Core/Src/main.c");
    }

    #[test]
    fn workspace_and_sandbox_paths_become_relative() {
        let root = Path::new("/home/dev/proj");
        assert_eq!(normalize_path("/home/dev/proj/Core/Src/main.c", Some(root)), "Core/Src/main.c");
        assert_eq!(normalize_path("/home/dev/proj/./Core/../Drivers/x.c", Some(root)), "Drivers/x.c");
        assert_eq!(normalize_path("/src/Core/Inc/main.h", None), "Core/Inc/main.h");
        assert_eq!(normalize_path("/usr/include/stdio.h", Some(root)), "/usr/include/stdio.h");
    }

    #[test]
    fn column_is_optional() {
        let d = classify_line("main.c:7: error: expected ';'", None).unwrap();
        assert_eq!((d.line, d.column), (7, 0));
    }

    #[test]
    fn format_without_location() {
        let d = classify_line("make: *** [Makefile:120: build/app.elf] Error 1", None).unwrap();
        assert_eq!(
            format_diagnostic(&d),
            "error[build-system] (global): target 'Makefile:120: build/app.elf' failed with exit code 1"
        );
    }
}
