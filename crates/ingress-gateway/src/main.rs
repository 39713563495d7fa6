use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use tokio_util::sync::CancellationToken;

use ingress_gateway::config::{self, APP_NAME, AppConfig};
use ingress_gateway::{bridge, proxy};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, Service::Both(cmd)),
        Command::Proxy(cmd) => async_main(ctx, Service::Proxy(cmd)),
        Command::Bridge(cmd) => async_main(ctx, Service::Bridge(cmd)),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, service: Service) -> Result<()> {
    handle_service(ctx, service).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Ingress gateway - HTML path rewriting proxy and SSE-over-WebSocket bridge.",
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
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
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
    /// Run the proxy and the bridge together
    Serve(ServeCommand),
    /// Run only the HTML rewriting proxy
    Proxy(ProxyCommand),
    /// Run only the WebSocket bridge
    Bridge(BridgeCommand),
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
    #[command(flatten)]
    proxy: ProxyCommand,
    #[command(flatten)]
    bridge: BridgeCommand,
}

#[derive(Debug, Clone, Args)]
struct ProxyCommand {
    /// Proxy listen port
    #[arg(long, value_name = "PORT")]
    proxy_port: Option<u16>,
    /// Port of the app server
    #[arg(long, value_name = "PORT")]
    upstream_port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct BridgeCommand {
    /// Bridge listen port
    #[arg(long, value_name = "PORT")]
    bridge_port: Option<u16>,
    /// Base URL of the app server for chat requests
    #[arg(long, value_name = "URL")]
    chat_upstream: Option<String>,
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

#[derive(Debug)]
enum Service {
    Both(ServeCommand),
    Proxy(ProxyCommand),
    Bridge(BridgeCommand),
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config.clone() {
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

        let config = load_or_init_config(&config_file, &common)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
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
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "ingress_gateway={level},ingress_protocol={level},tower_http={level}"
            ))
        });

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
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // For `log` users when no tracing bridge was installed.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            return LevelFilter::Trace;
        }
        if self.common.debug {
            return LevelFilter::Debug;
        }
        match self.common.verbose {
            0 => self.config.logging.level.parse().unwrap_or_else(|_| {
                warn!(
                    "unknown logging.level {:?}, using info",
                    self.config.logging.level
                );
                LevelFilter::Info
            }),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

async fn handle_service(ctx: RuntimeContext, service: Service) -> Result<()> {
    let mut proxy_config = ctx.config.proxy.clone();
    let mut bridge_config = ctx.config.bridge.clone();
    let (run_proxy, run_bridge) = match &service {
        Service::Both(cmd) => {
            cmd.proxy.apply(&mut proxy_config);
            cmd.bridge.apply(&mut bridge_config);
            (true, true)
        }
        Service::Proxy(cmd) => {
            cmd.apply(&mut proxy_config);
            (true, false)
        }
        Service::Bridge(cmd) => {
            cmd.apply(&mut bridge_config);
            (false, true)
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let proxy_task = run_proxy.then(|| tokio::spawn(proxy::serve(proxy_config, shutdown.clone())));
    let bridge_task =
        run_bridge.then(|| tokio::spawn(bridge::serve(bridge_config, shutdown.clone())));

    // Either service failing takes the other one down with it.
    let mut result = Ok(());
    for task in [proxy_task, bridge_task].into_iter().flatten() {
        let outcome = task.await.context("server task panicked")?;
        if let Err(err) = outcome {
            shutdown.cancel();
            if result.is_ok() {
                result = Err(err);
            }
        }
    }

    info!("Shutdown complete");
    result
}

impl ProxyCommand {
    fn apply(&self, config: &mut config::ProxyConfig) {
        if let Some(port) = self.proxy_port {
            config.port = port;
        }
        if let Some(port) = self.upstream_port {
            config.upstream_port = port;
        }
    }
}

impl BridgeCommand {
    fn apply(&self, config: &mut config::BridgeConfig) {
        if let Some(port) = self.bridge_port {
            config.port = port;
        }
        if let Some(url) = &self.chat_upstream {
            config.upstream_url = url.clone();
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => return,
    }

    info!("Shutdown signal received, stopping servers...");
    shutdown.cancel();
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
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
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
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.config_file.display()
                );
                return Ok(());
            }
            config::write_default_config(&ctx.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(config_file: &Path, common: &CommonOpts) -> Result<AppConfig> {
    if !config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                config_file.display()
            );
        } else {
            config::write_default_config(config_file)?;
        }
    }
    AppConfig::load(config_file)
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    let Some(text) = path.to_str() else {
        return Ok(path);
    };
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
