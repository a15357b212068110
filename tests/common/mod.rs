#![allow(dead_code)]

use mysql::{Opts, OptsBuilder, Pool, PooledConn};
use rusty_inception::model::Cell;
use rusty_inception::store::Store;
use rusty_inception::{
    Connector, Engine, Record, RowSet, SandboxConnector, Session, SessionConfig, Stage,
};
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const DB: &str = "test_inc";

/// An engine over a sandbox store on disk, plus a handle to inspect it.
pub struct Harness {
    pub engine: Engine,
    pub connector: SandboxConnector,
    _data_dir: tempfile::TempDir,
}

pub fn harness(configure: impl FnOnce(&mut SessionConfig)) -> anyhow::Result<Harness> {
    let data_dir = tempfile::tempdir()?;
    let connector = SandboxConnector::new(Store::open(data_dir.path())?);
    let mut config = SessionConfig::default();
    config.source.db = Some(DB.to_string());
    config.rules.enable_drop_table = true;
    configure(&mut config);
    let engine = Engine::new(config, Arc::new(connector.clone()));
    Ok(Harness {
        engine,
        connector,
        _data_dir: data_dir,
    })
}

impl Harness {
    /// Runs `script` directly against the sandbox, bypassing audit.
    pub async fn setup(&self, script: &str) -> anyhow::Result<()> {
        let mut session = self.session().await?;
        session.execute(&format!("CREATE DATABASE IF NOT EXISTS {DB}")).await?;
        for unit in rusty_inception::split::split(script) {
            session.execute(&unit.text).await?;
        }
        session.close().await?;
        Ok(())
    }

    pub async fn query(&self, sql: &str) -> anyhow::Result<RowSet> {
        let mut session = self.session().await?;
        let rs = session.query(sql).await?;
        session.close().await?;
        Ok(rs)
    }

    pub async fn ids(&self, table: &str) -> anyhow::Result<Vec<i64>> {
        let rs = self
            .query(&format!("SELECT id FROM {table} ORDER BY id"))
            .await?;
        Ok(rs
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(Cell::as_i64))
            .collect())
    }

    /// Replays statements one by one, as an operator would.
    pub async fn replay(&self, statements: &[String]) -> anyhow::Result<()> {
        let mut session = self.session().await?;
        for stmt in statements {
            session.execute(stmt).await?;
        }
        session.close().await?;
        Ok(())
    }

    async fn session(&self) -> anyhow::Result<Session> {
        let conn = self.connector.connect(&self.engine.config().source).await?;
        Ok(Session::new(conn, Duration::from_secs(5)))
    }
}

pub fn executed_ok(record: &Record) -> bool {
    record.stage == Stage::Executed && record.stage_status.starts_with("Execute Successfully")
}

pub struct ServerGuard {
    child: Child,
    _data_dir: tempfile::TempDir,
    stderr_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Starts `rusty-inception serve` over a sandbox store.
pub fn spawn_server() -> anyhow::Result<(ServerGuard, SocketAddr)> {
    let bin = env!("CARGO_BIN_EXE_rusty-inception");
    let data_dir = tempfile::tempdir()?;

    let mut child = Command::new(bin)
        .args([
            "serve",
            "--listen",
            "127.0.0.1:0",
            "--sandbox",
            "--data",
            data_dir.path().to_str().unwrap_or("./data"),
            "--server-password",
            "root",
        ])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture server stderr"))?;

    let (addr_tx, addr_rx) = mpsc::channel::<SocketAddr>();
    let stderr_thread = thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        while reader
            .read_line(&mut line)
            .ok()
            .filter(|n| *n > 0)
            .is_some()
        {
            if let Some(rest) = line.strip_prefix("rusty-inception listening on ") {
                if let Ok(addr) = rest.trim().parse::<SocketAddr>() {
                    let _ = addr_tx.send(addr);
                }
            }
            eprint!("{}", line);
            line.clear();
        }
    });

    let addr = match addr_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(addr) => addr,
        Err(err) => {
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("server exited before reporting listen address: {status} ({err})");
            }
            anyhow::bail!("timed out waiting for server listen address: {err}");
        }
    };

    Ok((
        ServerGuard {
            child,
            _data_dir: data_dir,
            stderr_thread: Some(stderr_thread),
        },
        addr,
    ))
}

pub fn pool_for_url(url: &str) -> anyhow::Result<Pool> {
    let opts = OptsBuilder::from_opts(Opts::from_url(url)?)
        .tcp_connect_timeout(Some(Duration::from_secs(1)));
    Ok(Pool::new(opts)?)
}

pub fn get_conn_with_retry(pool: &Pool, url: &str) -> anyhow::Result<PooledConn> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        match pool.get_conn() {
            Ok(conn) => return Ok(conn),
            Err(_) => thread::sleep(Duration::from_millis(200)),
        }
    }
    Err(anyhow::anyhow!("could not connect to server at {url}"))
}
