//! Session plumbing shared by every subcommand: spawn the engine, walk the
//! stage machine to Studio, print progress while the engine works.

use std::path::Path;
use std::str::FromStr;
use std::thread::{self, JoinHandle};

use tidygrid_client::{FullPassSummary, Session, SessionConfig, SessionEvent};
use tidygrid_engine::{spawn_engine, EngineOptions, RowShape};
use tidygrid_protocol::{ColumnSchema, ColumnType, JobKind};

use crate::CliError;

/// `COL=TYPE` from `--type`. `COL` is a header name or a zero-based index.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeOverride {
    pub column: String,
    pub column_type: ColumnType,
}

impl FromStr for TypeOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, ty) = s
            .split_once('=')
            .ok_or_else(|| format!("expected COL=TYPE, got {s:?}"))?;
        let column = column.trim();
        if column.is_empty() {
            return Err(format!("empty column in {s:?}"));
        }
        let column_type = ty.parse::<ColumnType>().map_err(|e| e.to_string())?;
        Ok(Self { column: column.to_string(), column_type })
    }
}

/// Resolve a header name (case-insensitive) or a numeric index.
pub fn resolve_column(schema: &[ColumnSchema], column: &str) -> Result<usize, CliError> {
    if let Some(idx) = schema.iter().position(|c| c.name.eq_ignore_ascii_case(column)) {
        return Ok(idx);
    }
    match column.parse::<usize>() {
        Ok(idx) if idx < schema.len() => Ok(idx),
        _ => {
            let names: Vec<&str> = schema.iter().map(|c| c.name.as_str()).collect();
            Err(CliError::args(format!("unknown column {column:?}"))
                .with_hint(format!("columns: {}", names.join(", "))))
        }
    }
}

/// Global flags every session-backed subcommand shares.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: SessionConfig,
    pub keyed: bool,
    pub quiet: bool,
}

/// A session in Studio plus the engine thread behind it.
pub struct Run {
    pub session: Session,
    pub summary: FullPassSummary,
    engine: Option<JoinHandle<()>>,
    progress: Option<(u64, JoinHandle<()>)>,
}

impl Run {
    /// Load `file`, apply `--type` overrides, confirm the schema.
    pub fn open(file: &Path, types: &[TypeOverride], opts: &RunOptions) -> Result<Self, CliError> {
        let bytes = std::fs::read(file)
            .map_err(|e| CliError::args(format!("{}: {}", file.display(), e)))?;

        let row_shape = if opts.keyed { RowShape::Keyed } else { RowShape::Positional };
        let engine = spawn_engine(EngineOptions { row_shape })
            .map_err(|e| CliError::engine(format!("failed to start engine: {e}")))?;
        let (requests, frames, thread) = engine.into_parts();
        let session = Session::connect(requests, frames, opts.config.clone());

        let progress = (!opts.quiet).then(|| {
            let (id, events) = session.subscribe();
            let printer = thread::spawn(move || {
                while let Ok(event) = events.recv_blocking() {
                    print_progress(&event);
                }
            });
            (id, printer)
        });

        let mut run = Run {
            session,
            summary: FullPassSummary::default(),
            engine: Some(thread),
            progress,
        };
        run.summary = smol::block_on(run.to_studio(bytes, types))?;
        Ok(run)
    }

    async fn to_studio(&self, bytes: Vec<u8>, types: &[TypeOverride]) -> Result<FullPassSummary, CliError> {
        let session = &self.session;
        session.init().await.map_err(CliError::client)?;
        session.begin_ingestion().map_err(CliError::client)?;
        let rows = session.load_dataset(bytes).await.map_err(CliError::client)?;
        log::debug!("engine reports {rows} rows");

        for ov in types {
            let col = resolve_column(&session.schema(), &ov.column)?;
            session.set_column_type(col, ov.column_type).map_err(CliError::client)?;
        }
        session.confirm_schema().await.map_err(CliError::client)
    }

    /// Resolve a column against the confirmed schema.
    pub fn column(&self, column: &str) -> Result<usize, CliError> {
        resolve_column(&self.session.schema(), column)
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        if let Some((id, printer)) = self.progress.take() {
            self.session.unsubscribe(id);
            let _ = printer.join();
        }
        self.session.shutdown();
        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }
    }
}

fn print_progress(event: &SessionEvent) {
    match event {
        SessionEvent::EngineProgress { job, rows_processed, total_rows } => {
            let label = match job {
                JobKind::Validation => "validating",
                JobKind::FindReplace => "replacing",
            };
            eprintln!("{label}: {rows_processed}/{total_rows} rows");
        }
        SessionEvent::StageChanged { to, .. } => eprintln!("stage: {}", to.name()),
        SessionEvent::UnroutableFault { message } => eprintln!("engine: {message}"),
        _ => {}
    }
}
