//! Subcommand bodies. Each opens its own session and drops it on return.

use std::io::{self, Write};
use std::path::Path;

use tidygrid_client::MutationReport;
use tidygrid_config::Settings;
use tidygrid_protocol::CorrectionStrategy;

use crate::output::{self, CheckReport};
use crate::run::{Run, RunOptions, TypeOverride};
use crate::CliError;

// ============================================================================
// check
// ============================================================================

pub fn check(file: &Path, types: &[TypeOverride], opts: &RunOptions, json: bool) -> Result<(), CliError> {
    let run = Run::open(file, types, opts)?;
    let report = CheckReport::build(&run.session, &run.summary);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if json {
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::io(format!("failed to encode report: {e}")))?;
        writeln!(out, "{text}")?;
    } else {
        report.print_table(&mut out)?;
    }

    if report.invalid_cells > 0 {
        return Err(CliError::invalid_cells());
    }
    Ok(())
}

// ============================================================================
// fix / suggest / set
// ============================================================================

fn print_mutation(what: &str, column: &str, before: usize, after: usize, report: &MutationReport) {
    println!("{what}: {} cells changed in {column}", report.changed);
    if report.revalidated {
        println!("invalid: {before} -> {after}");
    } else {
        println!("invalid: {before} -> (not revalidated)");
    }
}

pub fn fix(
    file: &Path,
    types: &[TypeOverride],
    opts: &RunOptions,
    column: &str,
    strategy: CorrectionStrategy,
    output: Option<&Path>,
) -> Result<(), CliError> {
    let run = Run::open(file, types, opts)?;
    let col = run.column(column)?;
    let name = run.session.schema()[col].name.clone();

    let before = run.session.errors().count(col);
    let report = smol::block_on(run.session.apply_correction(col, strategy)).map_err(CliError::client)?;
    let after = run.session.errors().count(col);
    print_mutation("fix", &name, before, after, &report);

    if let Some(path) = output {
        output::export(&run.session, path)?;
    }
    Ok(())
}

pub fn suggest(
    file: &Path,
    types: &[TypeOverride],
    opts: &RunOptions,
    column: &str,
    apply: Option<usize>,
    output: Option<&Path>,
) -> Result<(), CliError> {
    let run = Run::open(file, types, opts)?;
    let col = run.column(column)?;
    let name = run.session.schema()[col].name.clone();
    let reports = smol::block_on(run.session.suggestions(col)).map_err(CliError::client)?;

    let Some(n) = apply else {
        if reports.is_empty() {
            println!("no suggestions for {name}");
        }
        for (i, report) in reports.iter().enumerate() {
            println!(
                "{}. {} ({} cells)  e.g. {:?} -> {:?}",
                i + 1,
                report.description,
                report.affected_count,
                report.example_before,
                report.example_after
            );
        }
        return Ok(());
    };

    let chosen = n
        .checked_sub(1)
        .and_then(|i| reports.get(i))
        .ok_or_else(|| {
            CliError::args(format!("no suggestion #{n} for {name}"))
                .with_hint(format!("{} suggestions available", reports.len()))
        })?;

    let before = run.session.errors().count(col);
    let report = smol::block_on(run.session.apply_suggestion(col, chosen.suggestion.clone()))
        .map_err(CliError::client)?;
    let after = run.session.errors().count(col);
    print_mutation(&chosen.description, &name, before, after, &report);

    if let Some(path) = output {
        output::export(&run.session, path)?;
    }
    Ok(())
}

pub fn set(
    file: &Path,
    types: &[TypeOverride],
    opts: &RunOptions,
    row: usize,
    column: &str,
    value: &str,
    output: Option<&Path>,
) -> Result<(), CliError> {
    let run = Run::open(file, types, opts)?;
    let col = run.column(column)?;
    let name = run.session.schema()[col].name.clone();

    let before = run.session.errors().count(col);
    let report = smol::block_on(run.session.update_cell(row, col, value)).map_err(CliError::client)?;
    let after = run.session.errors().count(col);
    print_mutation("set", &name, before, after, &report);

    if let Some(path) = output {
        output::export(&run.session, path)?;
    }
    Ok(())
}

// ============================================================================
// replace
// ============================================================================

pub fn replace(
    file: &Path,
    types: &[TypeOverride],
    opts: &RunOptions,
    find: &str,
    replace: &str,
    output: Option<&Path>,
) -> Result<(), CliError> {
    if find.is_empty() {
        return Err(CliError::args("--find must not be empty"));
    }
    let run = Run::open(file, types, opts)?;
    let before = run.session.errors().total();
    let summary =
        smol::block_on(run.session.find_replace_all(find, replace)).map_err(CliError::client)?;

    println!("replaced: {} cells in {} chunks", summary.replaced, summary.chunks);
    if summary.revalidated {
        println!("invalid: {before} -> {}", run.session.errors().total());
    }

    if let Some(path) = output {
        output::export(&run.session, path)?;
    }
    Ok(())
}

// ============================================================================
// peek
// ============================================================================

pub fn peek(
    file: &Path,
    types: &[TypeOverride],
    opts: &RunOptions,
    start: usize,
    count: usize,
    mark: bool,
) -> Result<(), CliError> {
    let run = Run::open(file, types, opts)?;
    let rows = run.session.row_count();
    if start >= rows && rows > 0 {
        return Err(CliError::args(format!("--start {start} is past the last row ({rows} rows)")));
    }
    let stdout = io::stdout();
    output::write_rows(&run.session, stdout.lock(), start, count, mark)?;
    Ok(())
}

// ============================================================================
// config
// ============================================================================

pub fn config(path: Option<&Path>, settings: &Settings) -> Result<(), CliError> {
    let shown = match path {
        Some(path) => path.display().to_string(),
        None => Settings::config_path_display(),
    };
    println!("path: {shown}");
    let text = serde_json::to_string_pretty(settings)
        .map_err(|e| CliError::io(format!("failed to encode settings: {e}")))?;
    println!("{text}");
    Ok(())
}
