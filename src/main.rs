use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rusty_inception::auth::Credentials;
use rusty_inception::record::render_table;
use rusty_inception::server;
use rusty_inception::store::Store;
use rusty_inception::{
    Connector, Engine, MysqlConnector, Record, RunMode, SandboxConnector, SessionConfig,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "rusty-inception", version, about = "Audit, execute and roll back SQL change scripts")]
struct Cli {
    /// TOML file with [source] and [rules] sections.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print records as JSON instead of a table.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Audit a script without touching the target.
    Check(RunArgs),
    /// Audit, then execute approved statements.
    Execute(RunArgs),
    /// Split a script into statements.
    Split(RunArgs),
    /// Accept scripts over the MySQL protocol.
    Serve(ServeArgs),
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    db: Option<String>,
    #[arg(long)]
    backup: bool,
    #[arg(long)]
    ignore_warnings: bool,
    #[arg(long)]
    real_row_count: bool,
    #[arg(long)]
    tran_batch: Option<usize>,
    /// Run against the in-process sandbox instead of a MySQL server.
    #[arg(long)]
    sandbox: bool,
    /// Directory for a persistent sandbox store.
    #[arg(long, requires = "sandbox")]
    data: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Print the undo script after an execute run.
    #[arg(long)]
    show_rollback: bool,
    /// Script file, or `-` for stdin.
    script: String,
}

#[derive(Args)]
struct ServeArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long, default_value = "127.0.0.1:4000")]
    listen: String,
    #[arg(long, default_value = "root")]
    server_user: String,
    #[arg(long, default_value = "")]
    server_password: String,
}

impl TargetArgs {
    fn apply(&self, config: &mut SessionConfig) {
        let src = &mut config.source;
        if let Some(host) = &self.host {
            src.host = host.clone();
        }
        if let Some(port) = self.port {
            src.port = port;
        }
        if let Some(user) = &self.user {
            src.user = user.clone();
        }
        if let Some(password) = &self.password {
            src.password = password.clone();
        }
        if let Some(db) = &self.db {
            src.db = Some(db.clone());
        }
        if let Some(n) = self.tran_batch {
            src.tran_batch = n;
        }
        src.backup |= self.backup;
        src.ignore_warnings |= self.ignore_warnings;
        src.real_row_count |= self.real_row_count;
    }

    fn connector(&self) -> anyhow::Result<Arc<dyn Connector>> {
        if !self.sandbox {
            return Ok(Arc::new(MysqlConnector));
        }
        let store = match &self.data {
            Some(dir) => Store::open(dir)
                .with_context(|| format!("opening sandbox store at {}", dir.display()))?,
            None => Store::temporary()?,
        };
        Ok(Arc::new(SandboxConnector::new(store)))
    }
}

fn read_script(path: &str) -> anyhow::Result<String> {
    if path == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading script {path}"))
}

fn print_records(records: &[Record], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
    } else {
        println!("{}", render_table(records));
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let (mode, args) = match cli.command {
        Command::Check(args) => (RunMode::Check, args),
        Command::Execute(args) => (RunMode::Execute, args),
        Command::Split(args) => (RunMode::Split, args),
        Command::Serve(args) => {
            args.target.apply(&mut config);
            config.validate(false)?;
            let connector = args.target.connector()?;
            let listener = TcpListener::bind(&args.listen).await?;
            eprintln!("rusty-inception listening on {}", listener.local_addr()?);
            let credentials = Credentials::new(args.server_user, &args.server_password);
            server::serve(listener, config, connector, credentials).await?;
            return Ok(());
        }
    };

    args.target.apply(&mut config);
    config.mode = mode;
    let script = read_script(&args.script)?;
    let mut engine = Engine::new(config, args.target.connector()?);
    let records = match engine.run(mode, &script).await {
        Ok(records) => records,
        Err(failure) => {
            print_records(&failure.records, cli.json)?;
            return Err(failure.error.into());
        }
    };
    print_records(&records, cli.json)?;

    if mode == RunMode::Execute && args.show_rollback {
        for stmt in engine.undo_script(&records).await? {
            println!("{stmt};");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    run(Cli::parse()).await
}
