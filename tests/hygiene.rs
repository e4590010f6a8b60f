//! Hygiene: source-level rules for the production tree.
//!
//! Scans `src/` (minus `*_test.rs`) for patterns that break the crate's
//! runtime model: panics in library code, discarded errors, blocking calls
//! on the async runtime, lock guards alive across an `.await`, stray
//! background tasks, and lossy numeric casts. Budgets only go down.

use std::fs;
use std::path::Path;

struct SourceFile {
    path: String,
    content: String,
}

impl SourceFile {
    /// Lines with their 1-based numbers, comment lines skipped.
    fn code_lines(&self) -> impl Iterator<Item = (usize, &str)> {
        self.content
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line))
            .filter(|(_, line)| !line.trim_start().starts_with("//"))
    }
}

fn source_files() -> Vec<SourceFile> {
    let mut files = Vec::new();
    collect(Path::new("src"), &mut files);
    files
}

fn collect(dir: &Path, out: &mut Vec<SourceFile>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(&path, out);
            continue;
        }
        let path_str = path.to_string_lossy().replace('\\', "/");
        if !path_str.ends_with(".rs") || path_str.ends_with("_test.rs") {
            continue;
        }
        if let Ok(content) = fs::read_to_string(&path) {
            out.push(SourceFile { path: path_str, content });
        }
    }
}

fn report(hits: &[String]) -> String {
    hits.iter().map(|h| format!("  {h}")).collect::<Vec<_>>().join("\n")
}

// =============================================================================
// PATTERN BUDGETS
// =============================================================================

struct Budget {
    pattern: &'static str,
    max: usize,
    hint: &'static str,
}

const BUDGETS: &[Budget] = &[
    Budget { pattern: ".unwrap()", max: 0, hint: "propagate with `?` or recover from poison" },
    Budget { pattern: ".expect(", max: 0, hint: "propagate with `?`" },
    Budget { pattern: "panic!(", max: 0, hint: "return a SyncError" },
    Budget { pattern: "unreachable!(", max: 0, hint: "make the state unrepresentable" },
    Budget { pattern: "todo!(", max: 0, hint: "finish the stub" },
    Budget { pattern: "unimplemented!(", max: 0, hint: "finish the stub" },
    Budget { pattern: "let _ =", max: 0, hint: "inspect or log the discarded value" },
    Budget { pattern: ".ok()", max: 0, hint: "log the error before dropping it" },
    Budget { pattern: "#[allow(dead_code)]", max: 0, hint: "delete the unused item" },
    Budget { pattern: "std::thread::sleep", max: 0, hint: "use tokio::time::sleep" },
    Budget { pattern: "block_on(", max: 0, hint: "await instead of blocking a runtime thread" },
];

#[test]
fn pattern_budgets() {
    let files = source_files();
    let mut failures = Vec::new();
    for budget in BUDGETS {
        let hits: Vec<String> = files
            .iter()
            .flat_map(|f| {
                f.code_lines().filter(|(_, line)| line.contains(budget.pattern)).map(|(n, _)| format!("{}:{n}", f.path))
            })
            .collect();
        if hits.len() > budget.max {
            failures.push(format!(
                "`{}`: found {}, max {} ({}).\n{}",
                budget.pattern,
                hits.len(),
                budget.max,
                budget.hint,
                report(&hits)
            ));
        }
    }
    assert!(failures.is_empty(), "{}", failures.join("\n"));
}

// =============================================================================
// LOCK GUARDS ACROSS AWAIT
// =============================================================================

/// Calls that hand out a `std::sync::MutexGuard`.
const GUARD_CALLS: &[&str] = &[".lock()", ".store()", ".machine()", ".slot()", ".lines()"];

fn binds_guard(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("let ")?;
    let ends_in_guard = GUARD_CALLS.iter().any(|call| line.trim_end().ends_with(&format!("{call};")))
        || line.trim_end().ends_with("(PoisonError::into_inner);");
    if !ends_in_guard {
        return None;
    }
    let rest = rest.strip_prefix("mut ").unwrap_or(rest);
    rest.split([' ', ':']).next()
}

fn brace_delta(line: &str) -> i64 {
    let opens = line.matches('{').count();
    let closes = line.matches('}').count();
    i64::try_from(opens).unwrap_or(0) - i64::try_from(closes).unwrap_or(0)
}

/// `.await` reached while a guard binding is still in scope, or in the same
/// statement as a temporary guard.
fn guards_across_await(file: &SourceFile) -> Vec<String> {
    let lines: Vec<(usize, &str)> = file.code_lines().collect();
    let mut hits = Vec::new();
    for (i, (n, line)) in lines.iter().enumerate() {
        if line.contains(".await") && GUARD_CALLS.iter().any(|call| line.contains(&format!("{call}."))) {
            hits.push(format!("{}:{n} (temporary guard)", file.path));
        }
        let Some(name) = binds_guard(line) else {
            continue;
        };
        let release = format!("drop({name})");
        let mut depth = 0_i64;
        // Awaits inside a spawned `async` block run on another task.
        let mut async_block: Option<i64> = None;
        for (m, later) in &lines[i + 1..] {
            if later.contains(&release) {
                break;
            }
            if async_block.is_none() && later.contains("async") && later.contains('{') {
                async_block = Some(depth);
            } else if async_block.is_none() && later.contains(".await") {
                hits.push(format!("{}:{n} `{name}` held until {m}", file.path));
                break;
            }
            depth += brace_delta(later);
            if depth < 0 {
                break;
            }
            if async_block.is_some_and(|opened| depth <= opened) {
                async_block = None;
            }
        }
    }
    hits
}

#[test]
fn no_lock_guard_across_await() {
    let hits: Vec<String> = source_files().iter().flat_map(guards_across_await).collect();
    assert!(hits.is_empty(), "MutexGuard alive across .await; scope it in a block first.\n{}", report(&hits));
}

#[test]
fn guard_scanner_flags_a_held_guard() {
    let file = SourceFile {
        path: "fixture.rs".into(),
        content: "async fn f(&self) {\n    let mut buffer = self.lock();\n    other().await;\n}\n".into(),
    };
    assert_eq!(guards_across_await(&file).len(), 1);

    let scoped = SourceFile {
        path: "fixture.rs".into(),
        content: "async fn f(&self) {\n    {\n        let buffer = self.lock();\n    }\n    other().await;\n}\n".into(),
    };
    assert!(guards_across_await(&scoped).is_empty());

    let spawned = SourceFile {
        path: "fixture.rs".into(),
        content: "fn f(&self) {\n    let mut slot = self.slot();\n    *slot = Some(tokio::spawn(async move {\n        sleep(d).await;\n    }));\n}\n".into(),
    };
    assert!(guards_across_await(&spawned).is_empty());
}

// =============================================================================
// BACKGROUND TASKS
// =============================================================================

/// Files allowed to spawn: the timer, the switch worker, and the binary.
const SPAWN_OWNERS: &[&str] = &["src/timer.rs", "src/services/switch.rs", "src/main.rs"];

#[test]
fn tasks_spawn_only_in_owning_modules() {
    let hits: Vec<String> = source_files()
        .iter()
        .filter(|f| !SPAWN_OWNERS.iter().any(|owner| f.path.ends_with(owner)))
        .flat_map(|f| {
            f.code_lines().filter(|(_, line)| line.contains("tokio::spawn")).map(|(n, _)| format!("{}:{n}", f.path))
        })
        .collect();
    assert!(hits.is_empty(), "tokio::spawn outside {SPAWN_OWNERS:?}; go through ScopedTimer.\n{}", report(&hits));
}

// =============================================================================
// NUMERIC CASTS
// =============================================================================

const CAST_TARGETS: &[&str] = &["f32", "f64", "i8", "i16", "i32", "i64", "isize", "u8", "u16", "u32", "u64", "usize"];

#[test]
fn no_bare_numeric_casts() {
    let hits: Vec<String> = source_files()
        .iter()
        .flat_map(|f| {
            f.code_lines()
                .filter(|(_, line)| {
                    CAST_TARGETS.iter().any(|ty| {
                        let cast = format!(" as {ty}");
                        line.match_indices(&cast).any(|(at, _)| {
                            line[at + cast.len()..].chars().next().is_none_or(|c| !c.is_alphanumeric() && c != '_')
                        })
                    })
                })
                .map(|(n, _)| format!("{}:{n}", f.path))
        })
        .collect();
    assert!(hits.is_empty(), "bare `as` casts; use From/TryFrom.\n{}", report(&hits));
}
