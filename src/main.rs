use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use xray_shell::engine_log::read_tail;
use xray_shell::{
    build, measure_all, parse_links, platform_proxy, AccountStatus, AppPaths, ConfigWriter,
    NoopProxy, ProbeOutcome, Session, Settings, SystemProxy,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// App data directory (settings, generated configs, logs)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse share links and print the resulting server descriptors
    Parse(LinkArgs),
    /// Write an engine config for the given links
    Build {
        #[command(flatten)]
        links: LinkArgs,
        /// Directory to write the config into
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Measure TCP connect latency to each link's server
    Probe {
        #[command(flatten)]
        links: LinkArgs,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Start the engine for one link and route the system through it
    Connect {
        /// Account status JSON, or one share link per line
        #[arg(long)]
        file: PathBuf,
        /// Index of the link to connect to
        #[arg(long, default_value_t = 0)]
        select: usize,
        /// Leave OS proxy settings untouched
        #[arg(long)]
        no_system_proxy: bool,
    },
    /// Print the end of the engine log
    Logs {
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },
}

#[derive(Args, Debug)]
struct LinkArgs {
    links: Vec<String>,
    /// File with one share link per line
    #[arg(long)]
    file: Option<PathBuf>,
}

impl LinkArgs {
    fn collect(&self) -> Result<Vec<String>> {
        let mut links = self.links.clone();
        if let Some(path) = &self.file {
            links.extend(read_link_file(path)?);
        }
        if links.is_empty() {
            bail!("no share links given");
        }
        Ok(links)
    }
}

enum Wake {
    Enter,
    Crashed(Option<i32>),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = match &cli.data_dir {
        Some(dir) => AppPaths::at(dir),
        None => AppPaths::discover().context("locating app data directory")?,
    };
    let _guard = xray_shell::logging::init(&paths.log_dir(), cli.verbose)
        .context("initializing logging")?;
    let settings = Settings::load(&paths);
    tracing::debug!(root = %paths.root().display(), "app data");

    match cli.command {
        Command::Parse(args) => parse(&args),
        Command::Build { links, out } => build_config(&settings, &paths, &links, out),
        Command::Probe { links, timeout_ms } => probe(&settings, &links, timeout_ms),
        Command::Connect {
            file,
            select,
            no_system_proxy,
        } => connect(settings, &paths, &file, select, no_system_proxy),
        Command::Logs { lines } => {
            for line in read_tail(&paths.engine_log(), lines)? {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn parse(args: &LinkArgs) -> Result<()> {
    let links = args.collect()?;
    let batch = parse_links(&links);
    println!("{}", serde_json::to_string_pretty(&batch.descriptors)?);
    for (index, error) in &batch.failures {
        eprintln!("link #{index}: {error}");
    }
    Ok(())
}

fn build_config(
    settings: &Settings,
    paths: &AppPaths,
    args: &LinkArgs,
    out: Option<PathBuf>,
) -> Result<()> {
    let links = args.collect()?;
    let batch = parse_links(&links);
    for (index, error) in &batch.failures {
        eprintln!("link #{index}: {error}");
    }
    let document = build(&batch.descriptors, &settings.build_options())?;
    let writer = ConfigWriter::new(out.unwrap_or_else(|| paths.config_dir()))?;
    let path = writer.write(&document)?;
    println!("{}", path.display());
    Ok(())
}

fn probe(settings: &Settings, args: &LinkArgs, timeout_ms: Option<u64>) -> Result<()> {
    let links = args.collect()?;
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.probe_timeout());
    let outcomes = measure_all(&links, timeout);
    for (link, outcome) in links.iter().zip(outcomes) {
        let shown = match outcome {
            ProbeOutcome::Latency(_) => format!("{} ms", outcome.as_millis_or_sentinel()),
            ProbeOutcome::Timeout => "timeout".to_string(),
            ProbeOutcome::Failed => "failed".to_string(),
        };
        println!("{shown:>10}  {}", short_label(link));
    }
    Ok(())
}

fn connect(
    settings: Settings,
    paths: &AppPaths,
    file: &Path,
    select: usize,
    no_system_proxy: bool,
) -> Result<()> {
    let status = read_account(file)?;
    let proxy: Arc<dyn SystemProxy> = if no_system_proxy {
        Arc::new(NoopProxy)
    } else {
        platform_proxy()
    };
    let session = Session::new(settings, paths, proxy).context("preparing config directory")?;

    let swept = session.supervisor().sweep_orphans();
    if swept > 0 {
        tracing::info!(swept, "cleaned up engines from an earlier run");
    }

    let (tx, rx) = mpsc::channel();
    let crash_tx = tx.clone();
    session.watch_crashes(move |code| {
        let _ = crash_tx.send(Wake::Crashed(code));
    });

    let connection = session.connect(&status, select)?;
    println!(
        "connected to {} ({} {}) via socks://{}:{}, press Enter to disconnect",
        connection.tag,
        connection.protocol,
        connection.server,
        session.settings().socks_host,
        session.settings().socks_port
    );

    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
        let _ = tx.send(Wake::Enter);
    });

    match rx.recv() {
        Ok(Wake::Crashed(code)) => {
            for line in session.supervisor().recent_logs().iter().rev().take(20).rev() {
                eprintln!("{line}");
            }
            bail!("engine exited unexpectedly (code {code:?})");
        }
        Ok(Wake::Enter) | Err(_) => {
            session.disconnect()?;
            println!("disconnected");
            Ok(())
        }
    }
}

fn read_link_file(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn read_account(path: &Path) -> Result<AccountStatus> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    if raw.trim_start().starts_with('{') {
        return serde_json::from_str(&raw)
            .with_context(|| format!("parsing account status in {}", path.display()));
    }
    Ok(AccountStatus {
        status: "active".to_string(),
        links: read_link_file(path)?,
    })
}

fn short_label(link: &str) -> &str {
    match link.rsplit_once('#') {
        Some((_, tag)) if !tag.is_empty() => tag,
        _ => link.get(..48).unwrap_or(link),
    }
}
