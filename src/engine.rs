use crate::audit::{count_query, AuditState, RuleEvaluator};
use crate::backend::{Connector, ExecResult, Session};
use crate::backup::{self, BackupLocation, TableUndo};
use crate::batch::BatchController;
use crate::classify::{classify_unit, StatementKind, Target};
use crate::config::{RunMode, SessionConfig};
use crate::error::{InceptionError, RunFailure};
use crate::model::{Finding, Opid, OpidGenerator, Record, Severity};
use crate::record::{self, RecordEmitter};
use crate::split::{split, StatementUnit};
use crate::stats::Statistics;
use sqlparser::ast::Statement;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BATCH_ROLLED_BACK: &str = "Rolled back: a later statement in the same transaction batch failed";
const BATCH_DRAINED: &str = "Not executed: the transaction batch was aborted by an earlier failure";
const DDL_OUTCOME_UNKNOWN: &str =
    "The statement may still complete on the server; its rollback rows were kept";
const BATCH_INTERRUPTED: &str = "Rolled back: the run stopped before the transaction batch committed";

struct Checked {
    unit: StatementUnit,
    target: Target,
    /// Database the unit runs against.
    db: Option<String>,
    executable: bool,
}

struct DmlOutcome {
    result: ExecResult,
    elapsed: Duration,
    backup_elapsed: Option<Duration>,
    partial: Vec<String>,
}

enum DmlFailure {
    /// Nothing was applied; the batch is untouched.
    Capture(InceptionError),
    /// The batch holds a failed mutation or one without its rollback rows.
    Execute(InceptionError),
}

pub struct Engine {
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    stats: Statistics,
}

impl Engine {
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            stats: Statistics::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = Arc::new(config);
    }

    pub fn statistics(&self) -> BTreeMap<&'static str, u64> {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    pub async fn run(&mut self, mode: RunMode, script: &str) -> Result<Vec<Record>, RunFailure> {
        match mode {
            RunMode::Check => self.audit(script).await,
            RunMode::Execute => self.execute(script).await,
            RunMode::Split => self.split(script),
        }
    }

    pub fn split(&mut self, script: &str) -> Result<Vec<Record>, RunFailure> {
        let config = Arc::clone(&self.config);
        config.validate(false)?;
        let mut emitter = RecordEmitter::new();
        for unit in split(script) {
            emitter.push_split(&unit);
        }
        info!(units = emitter.len(), "script split");
        Ok(emitter.into_records())
    }

    pub async fn audit(&mut self, script: &str) -> Result<Vec<Record>, RunFailure> {
        let config = Arc::clone(&self.config);
        let needs_connection = config.source.real_row_count;
        config.validate(needs_connection)?;

        let mut session = if needs_connection {
            Some(self.open_session(&config).await?)
        } else {
            None
        };
        let mut stats = Statistics::new();
        let outcome = check_units(&config, split(script), session.as_mut(), &mut stats).await;
        if let Some(session) = session {
            close_session(session).await;
        }
        let (_, emitter) = outcome?;
        self.stats.merge(&stats);
        info!(units = emitter.len(), "script audited");
        Ok(emitter.into_records())
    }

    pub async fn execute(&mut self, script: &str) -> Result<Vec<Record>, RunFailure> {
        let config = Arc::clone(&self.config);
        config.validate(true)?;
        let mut session = self.open_session(&config).await?;
        let mut stats = Statistics::new();
        let outcome = execute_units(&config, split(script), &mut session, &mut stats).await;
        close_session(session).await;
        let records = outcome?;
        self.stats.merge(&stats);
        Ok(records)
    }

    /// Stored rollback statements for each record, in record order. Records
    /// without backup get an empty list.
    pub async fn rollback_statements(
        &self,
        records: &[Record],
    ) -> Result<Vec<Vec<String>>, InceptionError> {
        let mut by_schema: HashMap<&str, Vec<Opid>> = HashMap::new();
        for rec in records {
            if let (Some(opid), Some(schema)) = (rec.opid, rec.backup_dbname.as_deref()) {
                by_schema.entry(schema).or_default().push(opid);
            }
        }
        if by_schema.is_empty() {
            return Ok(vec![Vec::new(); records.len()]);
        }

        let config = Arc::clone(&self.config);
        let mut session = self
            .open_session(&config)
            .await
            .map_err(|failure| failure.error)?;
        let mut loaded: HashMap<(String, String), Vec<String>> = HashMap::new();
        let mut outcome = Ok(());
        for (schema, opids) in &by_schema {
            let loc = BackupLocation::for_schema(*schema);
            match backup::load_statements(&mut session, &loc, opids).await {
                Ok(found) => {
                    for (opid, stmts) in found {
                        loaded.insert((schema.to_string(), opid), stmts);
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        close_session(session).await;
        outcome?;

        Ok(records
            .iter()
            .map(|rec| match (rec.opid, rec.backup_dbname.as_ref()) {
                (Some(opid), Some(schema)) => loaded
                    .remove(&(schema.clone(), opid.to_string()))
                    .unwrap_or_default(),
                _ => Vec::new(),
            })
            .collect())
    }

    /// Statements that undo a whole run: last record first, stored order
    /// within each record.
    pub async fn undo_script(&self, records: &[Record]) -> Result<Vec<String>, InceptionError> {
        let per_record = self.rollback_statements(records).await?;
        Ok(per_record.into_iter().rev().flatten().collect())
    }

    async fn open_session(&self, config: &SessionConfig) -> Result<Session, RunFailure> {
        let conn = self.connector.connect(&config.source).await?;
        debug!(host = %config.source.host, port = config.source.port, "backend connected");
        Ok(Session::new(conn, config.source.backend_timeout()))
    }
}

async fn close_session(session: Session) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "closing backend connection failed");
    }
}

async fn check_units(
    config: &SessionConfig,
    units: Vec<StatementUnit>,
    mut session: Option<&mut Session>,
    stats: &mut Statistics,
) -> Result<(Vec<Checked>, RecordEmitter), RunFailure> {
    let evaluator = RuleEvaluator::new(&config.rules)?;
    let mut state = AuditState::new(config.source.db.clone().filter(|db| !db.is_empty()));
    let mut emitter = RecordEmitter::new();
    let mut checked = Vec::with_capacity(units.len());

    for unit in units {
        let target = classify_unit(&unit);
        let db = match target.kind {
            StatementKind::Use => target.db.clone(),
            _ => state.resolve_db(&target),
        };
        let mut findings = evaluator.audit(&unit, &target, &mut state);
        if unit.is_parsed() {
            stats.record_target(&target);
        }

        let mut estimate = None;
        let clean = findings.iter().all(|f| f.severity < Severity::Error);
        if let (Some(session), Some(stmt), Some(db), true) =
            (session.as_deref_mut(), &unit.statement, &db, clean)
        {
            if let Some(sql) = count_query(stmt, &target, db) {
                match count_rows(session, &sql).await {
                    Ok(rows) => {
                        findings.extend(evaluator.check_row_estimate(rows));
                        estimate = Some(rows);
                    }
                    Err(e) if e.is_fatal() => {
                        return Err(RunFailure::new(e, emitter.into_records()));
                    }
                    Err(e) => warn!(error = %e, sql, "row estimate failed"),
                }
            }
        }

        let idx = emitter.push_checked(&unit, &findings);
        if let (Some(rows), Some(rec)) = (estimate, emitter.get_mut(idx)) {
            rec.affected_rows = rows;
        }

        let level = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Info);
        let executable = match level {
            Severity::Error => false,
            Severity::Warning => config.source.ignore_warnings,
            Severity::Info => true,
        };
        checked.push(Checked {
            unit,
            target,
            db,
            executable,
        });
    }
    Ok((checked, emitter))
}

async fn count_rows(session: &mut Session, sql: &str) -> Result<u64, InceptionError> {
    let rs = session.query(sql).await?;
    let count = rs
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(|c| c.as_i64())
        .unwrap_or(0);
    Ok(u64::try_from(count).unwrap_or(0))
}

fn location_for(config: &SessionConfig, db: &str) -> BackupLocation {
    backup::derive_location(&config.source.host, config.source.port, db)
}

fn mutates(kind: StatementKind) -> bool {
    kind.is_dml() || kind.is_ddl()
}

async fn execute_units(
    config: &SessionConfig,
    units: Vec<StatementUnit>,
    session: &mut Session,
    stats: &mut Statistics,
) -> Result<Vec<Record>, RunFailure> {
    let (checked, mut emitter) = check_units(
        config,
        units,
        config.source.real_row_count.then_some(&mut *session),
        stats,
    )
    .await?;
    let backup_on = config.source.backup;

    if backup_on {
        let locations: BTreeSet<BackupLocation> = checked
            .iter()
            .filter(|c| c.executable && mutates(c.target.kind))
            .filter_map(|c| c.db.as_deref())
            .map(|db| location_for(config, db))
            .collect();
        for loc in &locations {
            if let Err(e) = backup::ensure_location(session, loc).await {
                return Err(RunFailure::new(e, emitter.into_records()));
            }
        }
    }

    let mut batch = BatchController::new(config.source.batch_size(), backup_on);
    let mut opids = OpidGenerator::starting_now();
    info!(
        units = checked.len(),
        batch = config.source.batch_size(),
        backup = backup_on,
        "execution started"
    );

    for (idx, unit) in checked.iter().enumerate() {
        let Some(rec) = emitter.get_mut(idx) else {
            continue;
        };
        let Some(stmt) = unit.unit.statement.as_ref().filter(|_| unit.executable) else {
            record::mark_skipped(rec);
            continue;
        };
        let kind = unit.target.kind;

        if kind.is_dml() {
            if batch.take_drain_slot() {
                record::mark_drained(rec, BATCH_DRAINED);
                continue;
            }
            if let Err(e) = batch.ensure_open(session).await {
                record::mark_failed(rec, &e);
                if e.is_fatal() {
                    return Err(stop(&mut batch, session, emitter, idx + 1, e).await);
                }
                continue;
            }
            let db = unit.db.clone().unwrap_or_default();
            let location = backup_on.then(|| location_for(config, &db));
            let opid = opids.next_opid();
            match run_dml(session, unit, stmt, &db, location.as_ref(), opid).await {
                Ok(outcome) => {
                    record::mark_executed(rec, outcome.result.affected_rows, outcome.elapsed);
                    rec.opid = Some(opid);
                    if let (Some(loc), Some(elapsed)) = (&location, outcome.backup_elapsed) {
                        record::mark_backed_up(rec, &loc.schema, elapsed);
                    }
                    rec.absorb(&partial_findings(&outcome.partial));
                    batch.admit(idx, location);
                    if batch.is_full() {
                        if let Err(e) = flush(&mut batch, session, &mut opids, &mut emitter).await {
                            return Err(stop(&mut batch, session, emitter, idx + 1, e).await);
                        }
                    }
                }
                Err(DmlFailure::Capture(e)) => {
                    record::mark_backup_failed(rec, &e);
                    if e.is_fatal() {
                        return Err(stop(&mut batch, session, emitter, idx + 1, e).await);
                    }
                }
                Err(DmlFailure::Execute(e)) => {
                    record::mark_failed(rec, &e);
                    let rolled_back =
                        abort_batch(&mut batch, session, &mut emitter, BATCH_ROLLED_BACK).await;
                    if e.is_fatal() {
                        return Err(stop(&mut batch, session, emitter, idx + 1, e).await);
                    }
                    if let Err(e) = rolled_back {
                        if e.is_fatal() {
                            return Err(stop(&mut batch, session, emitter, idx + 1, e).await);
                        }
                        warn!(error = %e, "batch rollback failed");
                    }
                }
            }
            continue;
        }

        if kind.is_ddl() {
            if let Err(e) = flush(&mut batch, session, &mut opids, &mut emitter).await {
                return Err(stop(&mut batch, session, emitter, idx + 1, e).await);
            }
            batch.reset_drain();
            let Some(rec) = emitter.get_mut(idx) else {
                continue;
            };
            let db = unit.db.clone().unwrap_or_default();
            let location = backup_on.then(|| location_for(config, &db));
            let opid = opids.next_opid();
            if let Err(e) = run_ddl(session, unit, stmt, &db, location.as_ref(), opid, rec).await {
                if e.is_fatal() {
                    return Err(stop(&mut batch, session, emitter, idx + 1, e).await);
                }
            }
            continue;
        }

        // Session statements and reads run inline.
        let started = Instant::now();
        let outcome = match kind {
            StatementKind::Select | StatementKind::Show => session
                .query(&unit.unit.text)
                .await
                .map(|rs| rs.rows.len() as u64),
            _ => session.execute(&unit.unit.text).await.map(|_| 0),
        };
        match outcome {
            Ok(rows) => record::mark_executed(rec, rows, started.elapsed()),
            Err(e) => {
                record::mark_failed(rec, &e);
                if e.is_fatal() {
                    return Err(stop(&mut batch, session, emitter, idx + 1, e).await);
                }
            }
        }
    }

    if let Err(e) = flush(&mut batch, session, &mut opids, &mut emitter).await {
        return Err(RunFailure::new(e, emitter.into_records()));
    }
    info!(units = emitter.len(), "execution finished");
    Ok(emitter.into_records())
}

fn partial_findings(partial: &[String]) -> Vec<Finding> {
    partial
        .iter()
        .map(|p| Finding::warning(format!("Rollback is incomplete: {p}")))
        .collect()
}

async fn abort_batch(
    batch: &mut BatchController,
    session: &mut Session,
    emitter: &mut RecordEmitter,
    reason: &str,
) -> Result<(), InceptionError> {
    let (undone, rolled_back) = batch.abort(session).await;
    for member in undone {
        if let Some(rec) = emitter.get_mut(member) {
            record::mark_rolled_back(rec, reason);
        }
    }
    rolled_back
}

/// Ends a run on a fatal error. The open batch never committed, so its
/// members are reported as rolled back.
async fn stop(
    batch: &mut BatchController,
    session: &mut Session,
    mut emitter: RecordEmitter,
    upto: usize,
    error: InceptionError,
) -> RunFailure {
    if let Err(e) = abort_batch(batch, session, &mut emitter, BATCH_INTERRUPTED).await {
        warn!(error = %e, "batch rollback after fatal error failed");
    }
    let mut records = emitter.into_records();
    records.truncate(upto);
    RunFailure::new(error, records)
}

/// Commits the open batch. A failed commit undoes every member.
async fn flush(
    batch: &mut BatchController,
    session: &mut Session,
    opids: &mut OpidGenerator,
    emitter: &mut RecordEmitter,
) -> Result<(), InceptionError> {
    let members = match batch.flush(session, opids).await {
        Ok(members) => members,
        Err(e) => {
            warn!(error = %e, "batch commit failed");
            let reason = format!("Commit failed: {e}");
            if let Err(rollback) = abort_batch(batch, session, emitter, &reason).await {
                warn!(error = %rollback, "batch rollback after failed commit failed");
            }
            batch.reset_drain();
            return if e.is_fatal() { Err(e) } else { Ok(()) };
        }
    };
    debug!(members = members.len(), "batch flushed");
    Ok(())
}

async fn run_dml(
    session: &mut Session,
    unit: &Checked,
    stmt: &Statement,
    db: &str,
    location: Option<&BackupLocation>,
    opid: Opid,
) -> Result<DmlOutcome, DmlFailure> {
    let capture = match location {
        Some(_) => match backup::prepare(session, stmt, &unit.target, db).await {
            Ok(capture) => capture,
            Err(e @ InceptionError::BackupCapture(_)) => return Err(DmlFailure::Capture(e)),
            Err(e) => return Err(DmlFailure::Execute(e)),
        },
        None => None,
    };

    let started = Instant::now();
    let result = session
        .execute(&unit.unit.text)
        .await
        .map_err(DmlFailure::Execute)?;
    let elapsed = started.elapsed();

    let (Some(loc), Some(capture)) = (location, capture) else {
        return Ok(DmlOutcome {
            result,
            elapsed,
            backup_elapsed: None,
            partial: Vec::new(),
        });
    };
    let backup_started = Instant::now();
    let parts = capture.finish(stmt, &result).map_err(DmlFailure::Execute)?;
    let partial = write_undo(session, loc, opid, parts)
        .await
        .map_err(DmlFailure::Execute)?;
    Ok(DmlOutcome {
        result,
        elapsed,
        backup_elapsed: Some(backup_started.elapsed()),
        partial,
    })
}

async fn write_undo(
    session: &mut Session,
    loc: &BackupLocation,
    opid: Opid,
    parts: Vec<TableUndo>,
) -> Result<Vec<String>, InceptionError> {
    let mut partial = Vec::new();
    let mut rows = 0;
    for part in parts {
        backup::write_rows(session, loc, opid, &part.table, &part.undo.statements).await?;
        rows += part.undo.statements.len();
        partial.extend(part.undo.partial);
    }
    debug!(%opid, rows, "undo captured");
    Ok(partial)
}

/// Runs one schema change on its own. Rollback rows are written ahead and
/// removed again when the change fails.
async fn run_ddl(
    session: &mut Session,
    unit: &Checked,
    stmt: &Statement,
    db: &str,
    location: Option<&BackupLocation>,
    opid: Opid,
    rec: &mut Record,
) -> Result<(), InceptionError> {
    let mut backed_up = None;
    if let Some(loc) = location {
        let backup_started = Instant::now();
        let written = async {
            let parts = match backup::prepare(session, stmt, &unit.target, db).await? {
                Some(capture) => capture.finish(stmt, &ExecResult::default())?,
                None => Vec::new(),
            };
            write_undo(session, loc, opid, parts).await
        }
        .await;
        match written {
            Ok(partial) => backed_up = Some((partial, backup_started.elapsed())),
            Err(e) => {
                record::mark_backup_failed(rec, &e);
                return Err(e);
            }
        }
    }

    let started = Instant::now();
    match session.execute(&unit.unit.text).await {
        Ok(result) => {
            record::mark_executed(rec, result.affected_rows, started.elapsed());
            rec.opid = Some(opid);
            if let (Some(loc), Some((partial, elapsed))) = (location, backed_up) {
                record::mark_backed_up(rec, &loc.schema, elapsed);
                rec.absorb(&partial_findings(&partial));
            }
            info!(%opid, kind = unit.target.kind.as_str(), "ddl executed");
            Ok(())
        }
        Err(e @ InceptionError::Timeout(_)) => {
            // The server may still apply the change after the call gave up,
            // so its rollback rows stay under the opid.
            record::mark_failed(rec, &e);
            if let Some(loc) = location {
                rec.opid = Some(opid);
                rec.backup_dbname = Some(loc.schema.clone());
                rec.push_message(DDL_OUTCOME_UNKNOWN);
            }
            warn!(%opid, error = %e, "ddl outcome unknown; rollback rows kept");
            Err(e)
        }
        Err(e) => {
            if let Some(loc) = location {
                if let Err(cleanup) = backup::delete_rows(session, loc, opid).await {
                    warn!(%opid, error = %cleanup, "stale rollback rows left behind");
                }
            }
            record::mark_failed(rec, &e);
            Err(e)
        }
    }
}
