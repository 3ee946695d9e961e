use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use shellpod::activity::HttpProbe;
use shellpod::api::{AppState, create_router};
use shellpod::config::AppConfig;
use shellpod::db::Database;
use shellpod::lifecycle::{ActorDeps, CredentialResolver, SessionRegistry};
use shellpod::store::{DurableStore, MemoryStore, SettingsRepository, SqliteStore};
use shellpod_term::{
    ConnectionFailure, ConnectionState, ErrorCallback, RenderTarget, TerminalKey, TerminalManager,
    WsConnector,
};

const APP_NAME: &str = "shellpod";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Serve(cmd) => handle_serve(&ctx, cmd).await,
        Command::Attach(cmd) => handle_attach(&ctx, cmd).await,
        Command::Settings { command } => handle_settings(&ctx, command).await,
        Command::Config { .. } | Command::Completions { .. } => Ok(()),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Shellpod - per-session container runtimes with idle reclamation.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Attach this terminal to a session terminal
    Attach(AttachCommand),
    /// Manage fallback settings (storage credentials)
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
    /// Keep session state in memory only; nothing survives a restart
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Debug, Clone, Args)]
struct AttachCommand {
    /// Session id
    session: String,
    /// Terminal id within the session
    terminal: String,
    /// Server base URL (defaults to `attach.server`, then the listen address)
    #[arg(long, value_name = "URL")]
    server: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    /// Store a setting
    Set { key: String, value: String },
    /// Print a setting
    Get { key: String },
    /// Remove a setting
    Delete { key: String },
    /// List settings, optionally filtered by key prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("shellpod={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Library modules log through the `log` facade.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.config.logging.level.as_str()),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }

    async fn open_database(&self) -> Result<Database> {
        let path = &self.paths.database;
        Database::new(path)
            .await
            .with_context(|| format!("opening database {}", path.display()))
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
    database: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        let data_dir = default_data_dir()?;
        let state_dir = default_state_dir()?;
        let database = data_dir.join("shellpod.db");

        Ok(Self {
            config_file,
            data_dir,
            state_dir,
            database,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
            self.database = self.data_dir.join("shellpod.db");
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        if let Some(ref database) = cfg.paths.database {
            self.database = expand_str_path(database)?;
        }
        Ok(self)
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_settings(ctx: &RuntimeContext, command: SettingsCommand) -> Result<()> {
    let db = ctx.open_database().await?;
    let settings = SettingsRepository::new(db.pool().clone());

    match command {
        SettingsCommand::Set { key, value } => {
            if ctx.common.dry_run {
                info!("dry-run: would set {}", key);
                return Ok(());
            }
            settings.set(&key, &value).await?;
            info!("Stored setting {}", key);
        }
        SettingsCommand::Get { key } => match settings.get(&key).await? {
            Some(value) => println!("{}", value),
            None => return Err(anyhow!("setting {} is not set", key)),
        },
        SettingsCommand::Delete { key } => {
            if ctx.common.dry_run {
                info!("dry-run: would delete {}", key);
                return Ok(());
            }
            if !settings.delete(&key).await? {
                warn!("Setting {} was not set", key);
            }
        }
        SettingsCommand::List { prefix } => {
            let entries = settings.list(&prefix).await?;
            if ctx.common.json {
                let map: serde_json::Map<String, serde_json::Value> = entries
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&map).context("serializing settings")?
                );
            } else {
                for (key, value) in entries {
                    println!("{} = {}", key, value);
                }
            }
        }
    }
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let cfg = &ctx.config;

    let (store, settings): (Arc<dyn DurableStore>, Option<SettingsRepository>) = if cmd.ephemeral
    {
        info!("Ephemeral mode: session state is kept in memory only");
        (Arc::new(MemoryStore::new()), None)
    } else {
        let db = ctx.open_database().await?;
        info!("Using database {}", ctx.paths.database.display());
        (
            Arc::new(SqliteStore::new(db.pool().clone())),
            Some(SettingsRepository::new(db.pool().clone())),
        )
    };

    let runtime = cfg.container.build_runtime();
    match runtime.health_check().await {
        Ok(_) => info!("Container runtime: {}", runtime.runtime_type()),
        Err(e) => warn!(
            "Container runtime {} is not responding: {}",
            runtime.runtime_type(),
            e
        ),
    }

    let client = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let probe = HttpProbe::new(
        client,
        Duration::from_millis(cfg.lifecycle.activity_timeout_ms),
        Duration::from_millis(cfg.lifecycle.health_timeout_ms),
    );

    let registry = Arc::new(SessionRegistry::new(ActorDeps {
        store,
        runtime: Arc::new(runtime),
        probe: Arc::new(probe),
        credentials: CredentialResolver::new(settings),
        lifecycle: cfg.lifecycle.clone(),
        container: cfg.container.clone(),
    }));

    let restored = registry
        .rehydrate()
        .await
        .context("restoring persisted wake-ups")?;
    if restored > 0 {
        info!("Restored {} session runtime(s)", restored);
    }
    registry.start_reaper();

    let app = create_router(AppState::new(Arc::clone(&registry)));

    let host = cmd.host.unwrap_or_else(|| cfg.server.host.clone());
    let port = cmd.port.unwrap_or(cfg.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_signal = async move {
        wait_for_shutdown().await;
        info!("Shutdown signal received, releasing session runtimes...");
        // Containers keep running; persisted wake-ups resume them on restart.
        registry.shutdown();
        info!("Shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Writes terminal output straight to stdout. Geometry comes from
/// `COLUMNS`/`LINES`, read on every call.
struct StdoutTarget;

impl RenderTarget for StdoutTarget {
    fn geometry(&self) -> (u16, u16) {
        let read = |name: &str, fallback: u16| {
            env::var(name)
                .ok()
                .and_then(|v| v.parse::<u16>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
        };
        (read("COLUMNS", 80), read("LINES", 24))
    }

    fn write(&self, data: &[u8]) {
        let mut stdout = io::stdout().lock();
        if let Err(e) = stdout.write_all(data).and_then(|_| stdout.flush()) {
            debug!("stdout write failed: {}", e);
        }
    }

    fn refresh(&self) {
        let _ = io::stdout().flush();
    }
}

async fn handle_attach(ctx: &RuntimeContext, cmd: AttachCommand) -> Result<()> {
    let cfg = &ctx.config;
    let server = cmd
        .server
        .or_else(|| cfg.attach.server.clone())
        .unwrap_or_else(|| format!("http://{}:{}", cfg.server.host, cfg.server.port));
    let connector = WsConnector::from_server_url(&server)
        .with_context(|| format!("invalid server url {}", server))?
        .with_buffer(cfg.attach.outgoing_buffer);

    let manager = TerminalManager::new(Arc::new(connector), cfg.terminal.clone());
    let key = TerminalKey::new(cmd.session, cmd.terminal);

    let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if input_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });

    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<String>();
    let on_error: ErrorCallback = Arc::new(move |key: &TerminalKey, failure: &ConnectionFailure| {
        let _ = failure_tx.send(format!("{}: {}", key, failure));
    });

    let handle = manager
        .connect(key.clone(), Arc::new(StdoutTarget), input_rx, Some(on_error))
        .await;
    let mut state = manager
        .subscribe(&key)
        .ok_or_else(|| anyhow!("terminal {} was released before it started", key))?;

    let result = attach_loop(&manager, &key, &mut state, &mut failure_rx).await;
    handle.dispose().await;
    result
}

async fn attach_loop(
    manager: &TerminalManager,
    key: &TerminalKey,
    state: &mut tokio::sync::watch::Receiver<ConnectionState>,
    failures: &mut mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    #[cfg(unix)]
    let mut winch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
            .context("installing SIGWINCH handler")?;

    let mut was_connected = state.borrow().is_connected();
    loop {
        #[cfg(unix)]
        let resized = winch.recv();
        #[cfg(not(unix))]
        let resized = std::future::pending::<Option<()>>();

        tokio::select! {
            failure = failures.recv() => {
                if let Some(failure) = failure {
                    return Err(anyhow!(failure));
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Connected => was_connected = true,
                    ConnectionState::Disconnected if was_connected => {
                        info!("Terminal {} closed", key);
                        return Ok(());
                    }
                    _ => {}
                }
            }
            _ = resized => {
                manager.fit(key);
            }
            _ = tokio::signal::ctrl_c() => {
                return Ok(());
            }
        }
    }
}

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {}\n# File: {}\n\n",
        APP_NAME,
        path.display()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}, database: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display(),
            self.database.display()
        )
    }
}
