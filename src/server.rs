use crate::auth::Credentials;
use crate::backend::Connector;
use crate::config::{RunMode, SessionConfig};
use crate::engine::Engine;
use crate::error::InceptionError;
use crate::model::{Record, RECORD_COLUMNS};
use async_trait::async_trait;
use opensrv_mysql::{
    AsyncMysqlIntermediary, AsyncMysqlShim, Column, ColumnFlags, ColumnType, ErrorKind,
    InitWriter, IntermediaryOptions, OkResponse, ParamParser, QueryResultWriter,
    StatementMetaWriter, StatusFlags,
};
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const SERVER_VERSION: &str = "8.0.0-rusty-inception";

const INT_COLUMNS: [&str; 3] = ["order_id", "error_level", "affected_rows"];

#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub mode: RunMode,
    pub config: SessionConfig,
    pub script: &'a str,
}

fn flag(name: &str, value: &str) -> Result<bool, InceptionError> {
    match value.trim() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        other => Err(InceptionError::Config(format!(
            "--{name} expects 0 or 1, got {other:?}"
        ))),
    }
}

fn magic_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\binception_magic_(start|commit)\s*;").expect("valid marker regex")
    })
}

/// Reads the option header in front of a script, applying it over `base`.
pub fn parse_request<'a>(query: &'a str, base: &SessionConfig) -> Result<Request<'a>, InceptionError> {
    let mut config = base.clone();
    let mut mode = RunMode::Check;
    let trimmed = query.trim_start();
    let Some(rest) = trimmed.strip_prefix("/*--") else {
        return Ok(Request {
            mode,
            config,
            script: query,
        });
    };
    let Some(end) = rest.find("*/") else {
        return Err(InceptionError::Config("unterminated option header".into()));
    };
    let header = format!("--{}", &rest[..end]);
    for option in header.split(';').map(str::trim).filter(|o| !o.is_empty()) {
        let body = option.strip_prefix("--").unwrap_or(option);
        let (name, value) = body.split_once('=').unwrap_or((body, "1"));
        let src = &mut config.source;
        match name.trim() {
            "host" => src.host = value.trim().to_string(),
            "port" => {
                src.port = value.trim().parse().map_err(|_| {
                    InceptionError::Config(format!("--port expects a number, got {value:?}"))
                })?
            }
            "user" => src.user = value.trim().to_string(),
            "password" => src.password = value.to_string(),
            "db" => src.db = Some(value.trim().to_string()).filter(|d| !d.is_empty()),
            "backup" | "enable-remote-backup" => src.backup = flag(name, value)?,
            "ignore-warnings" => src.ignore_warnings = flag(name, value)?,
            "real-row-count" => src.real_row_count = flag(name, value)?,
            "tran-batch" => {
                src.tran_batch = value.trim().parse().map_err(|_| {
                    InceptionError::Config(format!("--tran-batch expects a number, got {value:?}"))
                })?
            }
            "execute" | "enable-execute" => {
                if flag(name, value)? {
                    mode = RunMode::Execute;
                }
            }
            "check" | "enable-check" => {
                if flag(name, value)? {
                    mode = RunMode::Check;
                }
            }
            "split" | "enable-split" => {
                if flag(name, value)? {
                    mode = RunMode::Split;
                }
            }
            other => {
                return Err(InceptionError::Config(format!("unknown option --{other}")));
            }
        }
    }
    let script = &rest[end + 2..];
    Ok(Request {
        mode,
        config,
        script,
    })
}

pub struct InceptionShim {
    engine: Engine,
    base: SessionConfig,
    credentials: Arc<Credentials>,
    salt: [u8; 20],
    conn_id: u32,
}

impl InceptionShim {
    pub fn new(
        base: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<Credentials>,
        conn_id: u32,
    ) -> Self {
        let mut salt = [0u8; 20];
        OsRng.fill_bytes(&mut salt);
        Self {
            engine: Engine::new(base.clone(), connector),
            base,
            credentials,
            salt,
            conn_id,
        }
    }

    fn err_to_kind(err: &InceptionError) -> ErrorKind {
        match err {
            InceptionError::Parse(_) => ErrorKind::ER_PARSE_ERROR,
            InceptionError::NotSupported(_) => ErrorKind::ER_NOT_SUPPORTED_YET,
            _ => ErrorKind::ER_UNKNOWN_ERROR,
        }
    }

    async fn run_script(&mut self, query: &str) -> Result<Vec<Record>, InceptionError> {
        let request = parse_request(query, &self.base)?;
        let script = magic_markers().replace_all(request.script, "");
        self.engine.set_config(request.config);
        match self.engine.run(request.mode, &script).await {
            Ok(records) => Ok(records),
            Err(failure) => {
                warn!(error = %failure.error, records = failure.records.len(), "run stopped");
                Err(failure.error)
            }
        }
    }
}

/// Client chatter (`SET NAMES`, `SELECT @@var`) that is not a script.
enum SessionQuery {
    Set,
    Variables(Vec<String>),
}

fn session_query(query: &str) -> Option<SessionQuery> {
    let q = query.trim().trim_end_matches(';').trim();
    let lower = q.to_ascii_lowercase();
    if lower.starts_with("set ") {
        return Some(SessionQuery::Set);
    }
    let rest = lower.strip_prefix("select ")?;
    let rest = match rest.find(" limit ") {
        Some(at) => &rest[..at],
        None => rest,
    };
    let vars: Vec<String> = rest.split(',').map(|v| v.trim().to_string()).collect();
    vars.iter()
        .all(|v| v.starts_with("@@"))
        .then_some(SessionQuery::Variables(vars))
}

fn sysvar_value(name: &str) -> String {
    let bare = name
        .trim_start_matches("@@")
        .trim_start_matches("session.")
        .trim_start_matches("global.");
    match bare {
        "version" => SERVER_VERSION.to_string(),
        "version_comment" => "rusty-inception audit server".to_string(),
        "max_allowed_packet" => (64 * 1024 * 1024).to_string(),
        "wait_timeout" => "28800".to_string(),
        "autocommit" => "1".to_string(),
        _ => String::new(),
    }
}

#[async_trait]
impl<W> AsyncMysqlShim<W> for InceptionShim
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    type Error = InceptionError;

    fn version(&self) -> String {
        SERVER_VERSION.to_string()
    }

    fn connect_id(&self) -> u32 {
        self.conn_id
    }

    fn salt(&self) -> [u8; 20] {
        self.salt
    }

    async fn authenticate(
        &self,
        auth_plugin: &str,
        username: &[u8],
        salt: &[u8],
        auth_data: &[u8],
    ) -> bool {
        if auth_plugin != "mysql_native_password" {
            return false;
        }
        self.credentials.verify(username, salt, auth_data)
    }

    async fn on_prepare<'a>(
        &'a mut self,
        _query: &'a str,
        info: StatementMetaWriter<'a, W>,
    ) -> Result<(), InceptionError> {
        info.error(
            ErrorKind::ER_NOT_SUPPORTED_YET,
            b"prepared statements are not supported",
        )
        .await?;
        Ok(())
    }

    async fn on_execute<'a>(
        &'a mut self,
        _id: u32,
        _params: ParamParser<'a>,
        results: QueryResultWriter<'a, W>,
    ) -> Result<(), InceptionError> {
        results
            .error(
                ErrorKind::ER_NOT_SUPPORTED_YET,
                b"prepared statements are not supported",
            )
            .await?;
        Ok(())
    }

    async fn on_close<'a>(&'a mut self, _stmt: u32)
    where
        W: 'async_trait,
    {
    }

    async fn on_init<'a>(
        &'a mut self,
        db: &'a str,
        writer: InitWriter<'a, W>,
    ) -> Result<(), InceptionError> {
        // The selected database becomes the default for later scripts.
        self.base.source.db = Some(db.to_string()).filter(|d| !d.is_empty());
        writer.ok().await?;
        Ok(())
    }

    async fn on_query<'a>(
        &'a mut self,
        query: &'a str,
        results: QueryResultWriter<'a, W>,
    ) -> Result<(), InceptionError> {
        match session_query(query) {
            Some(SessionQuery::Set) => {
                let ok = OkResponse {
                    status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                    ..Default::default()
                };
                results.completed(ok).await?;
                return Ok(());
            }
            Some(SessionQuery::Variables(vars)) => {
                let columns: Vec<Column> = vars
                    .iter()
                    .map(|v| Column {
                        table: String::new(),
                        column: v.clone(),
                        coltype: ColumnType::MYSQL_TYPE_VAR_STRING,
                        colflags: ColumnFlags::empty(),
                    })
                    .collect();
                let mut rw = results.start(&columns).await?;
                for v in &vars {
                    rw.write_col(sysvar_value(v))?;
                }
                rw.end_row().await?;
                rw.finish().await?;
                return Ok(());
            }
            None => {}
        }

        let records = match self.run_script(query).await {
            Ok(records) => records,
            Err(err) => {
                let kind = Self::err_to_kind(&err);
                results.error(kind, err.to_string().as_bytes()).await?;
                return Ok(());
            }
        };

        let columns: Vec<Column> = RECORD_COLUMNS
            .iter()
            .map(|name| Column {
                table: String::new(),
                column: name.to_string(),
                coltype: if INT_COLUMNS.contains(name) {
                    ColumnType::MYSQL_TYPE_LONGLONG
                } else {
                    ColumnType::MYSQL_TYPE_VAR_STRING
                },
                colflags: ColumnFlags::empty(),
            })
            .collect();
        let mut rw = results.start(&columns).await?;
        for record in &records {
            for (name, value) in RECORD_COLUMNS.iter().zip(record.columns()) {
                if INT_COLUMNS.contains(name) {
                    rw.write_col(value.parse::<i64>().unwrap_or(0))?;
                } else {
                    rw.write_col(value)?;
                }
            }
            rw.end_row().await?;
        }
        rw.finish().await?;
        Ok(())
    }
}

pub async fn serve(
    listener: TcpListener,
    base: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: Credentials,
) -> Result<(), InceptionError> {
    let credentials = Arc::new(credentials);
    let conn_id = AtomicU32::new(1);
    info!(addr = %listener.local_addr()?, "server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let id = conn_id.fetch_add(1, Ordering::Relaxed);
        let shim = InceptionShim::new(
            base.clone(),
            Arc::clone(&connector),
            Arc::clone(&credentials),
            id,
        );
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(stream);
            let opts = IntermediaryOptions {
                process_use_statement_on_query: false,
                reject_connection_on_dbname_absence: false,
            };
            if let Err(e) = AsyncMysqlIntermediary::run_with_options(shim, r, w, &opts).await {
                warn!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_selects_mode_and_overrides() {
        let base = SessionConfig::default();
        let req = parse_request(
            "/*--user=admin;--port=3307;--execute=1;--backup=1;--tran-batch=5;*/\
             inception_magic_start; insert into t values(1); inception_magic_commit;",
            &base,
        )
        .unwrap();
        assert_eq!(req.mode, RunMode::Execute);
        assert_eq!(req.config.source.user, "admin");
        assert_eq!(req.config.source.port, 3307);
        assert!(req.config.source.backup);
        assert_eq!(req.config.source.tran_batch, 5);
        let script = magic_markers().replace_all(req.script, "");
        assert_eq!(script.trim(), "insert into t values(1);");
    }

    #[test]
    fn scripts_without_header_are_checked() {
        let req = parse_request("select 1", &SessionConfig::default()).unwrap();
        assert_eq!(req.mode, RunMode::Check);
        assert_eq!(req.script, "select 1");
    }

    #[test]
    fn bad_headers_are_config_errors() {
        let base = SessionConfig::default();
        assert!(matches!(
            parse_request("/*--nope=1;*/ select 1", &base),
            Err(InceptionError::Config(_))
        ));
        assert!(matches!(
            parse_request("/*--execute=yes;*/ select 1", &base),
            Err(InceptionError::Config(_))
        ));
        assert!(parse_request("/*--execute=1; select 1", &base).is_err());
    }

    #[test]
    fn client_chatter_is_not_a_script() {
        assert!(matches!(session_query("SET NAMES utf8mb4"), Some(SessionQuery::Set)));
        match session_query("SELECT @@max_allowed_packet,@@wait_timeout") {
            Some(SessionQuery::Variables(vars)) => assert_eq!(vars.len(), 2),
            _ => panic!("expected variables"),
        }
        assert!(session_query("select * from t").is_none());
        assert_eq!(sysvar_value("@@session.wait_timeout"), "28800");
    }
}
