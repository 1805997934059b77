//! Startup wiring: configuration, logging, listeners, signals.

use std::io::Write;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use phoebe::config::ConfigBuilder;
use phoebe::ext;
use phoebe::server::{Server, ServerState};

use crate::cli::Cli;

/// Build (or rebuild, on reload) the complete server state from the CLI.
fn build_state(cli: &Cli) -> anyhow::Result<ServerState> {
    let mut builder = ConfigBuilder::new();
    for host in &cli.hosts {
        builder.add_host(host.as_str());
    }
    for port in &cli.ports {
        builder.add_port(*port);
    }
    for path in &cli.cert_files {
        builder.add_cert_file(absolute(path)?);
    }
    for path in &cli.key_files {
        builder.add_key_file(absolute(path)?);
    }
    builder.wiki_dir(absolute(&cli.wiki_dir)?);
    for spec in &cli.wiki_spaces {
        builder.add_space_spec(spec.as_str());
    }
    for token in &cli.wiki_tokens {
        builder.add_token(token.as_str());
    }
    for page in &cli.wiki_pages {
        builder.add_extra_page(page.as_str());
    }
    if let Some(main_page) = &cli.wiki_main_page {
        builder.main_page(main_page.as_str());
    }
    for mime in &cli.wiki_mime_types {
        builder.add_mime_type(mime.as_str());
    }
    builder.page_size_limit(cli.wiki_page_size_limit);
    builder.load_config_file()?;
    let registry = ext::initialize(&mut builder)?;
    let config = builder.build()?;
    Ok(ServerState::build(config, registry)?)
}

/// Paths are made absolute once at startup; the server never changes its
/// working directory.
fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("cannot resolve path {}", path.display()))
}

/// Run the server until a shutdown signal arrives.
pub fn run(cli: &Cli, log: &LogTarget) -> anyhow::Result<()> {
    let state = build_state(cli)?;
    let ports = state.context.config.ports.clone();
    let server = Server::new(state);

    // Bind before dropping privileges so low ports still work.
    let mut listeners = Vec::new();
    for port in &ports {
        let listener = TcpListener::bind(("0.0.0.0", *port))
            .with_context(|| format!("cannot bind port {port}"))?;
        listeners.push(listener);
    }

    if let Some(pid_file) = &cli.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pid file {}", pid_file.display()))?;
    }

    #[cfg(unix)]
    apply_process_flags(cli)?;

    let reload = Arc::new(AtomicBool::new(false));
    let terminate = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        signal_hook::flag::register(signal_hook::consts::SIGHUP, reload.clone())
            .context("cannot register SIGHUP")?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, terminate.clone())
            .context("cannot register SIGTERM")?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, terminate.clone())
            .context("cannot register SIGINT")?;
    }

    let mut handles = Vec::new();
    for listener in listeners {
        let server = server.clone();
        handles.push(thread::spawn(move || server.serve(listener)));
    }
    info!(?ports, "phoebe {} started", env!("CARGO_PKG_VERSION"));

    loop {
        thread::sleep(Duration::from_millis(200));
        if terminate.load(Ordering::SeqCst) {
            break;
        }
        if reload.swap(false, Ordering::SeqCst) {
            log.reopen();
            match build_state(cli) {
                Ok(state) => server.swap_state(state),
                Err(err) => {
                    // Keep serving the old configuration on a bad reload.
                    error!("reload failed: {err:#}");
                }
            }
        }
    }

    info!("shutting down");
    server.request_shutdown();
    for port in &ports {
        // Wake the accept loops so they observe the flag.
        let _ = std::net::TcpStream::connect(("127.0.0.1", *port));
    }
    for handle in handles {
        let _ = handle.join();
    }
    server.drain();
    Ok(())
}

#[cfg(unix)]
fn apply_process_flags(cli: &Cli) -> anyhow::Result<()> {
    if cli.setsid {
        nix::unistd::setsid().context("setsid failed")?;
    }
    if let Some(name) = &cli.group {
        let group = nix::unistd::Group::from_name(name)
            .with_context(|| format!("cannot look up group '{name}'"))?
            .with_context(|| format!("unknown group '{name}'"))?;
        nix::unistd::setgid(group.gid).with_context(|| format!("setgid {name} failed"))?;
    }
    if let Some(name) = &cli.user {
        let user = nix::unistd::User::from_name(name)
            .with_context(|| format!("cannot look up user '{name}'"))?
            .with_context(|| format!("unknown user '{name}'"))?;
        nix::unistd::setuid(user.uid).with_context(|| format!("setuid {name} failed"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Where log lines go: stderr, or an append-mode file that a hangup
/// reload reopens (for rotation).
#[derive(Clone)]
pub struct LogTarget {
    path: Option<PathBuf>,
    file: Arc<Mutex<Option<std::fs::File>>>,
}

impl LogTarget {
    pub fn new(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let file = path.as_deref().map(open_log).transpose()?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Reopen the log file after rotation; no-op when logging to stderr.
    pub fn reopen(&self) {
        let Some(path) = &self.path else {
            return;
        };
        match open_log(path) {
            Ok(file) => {
                *self.file.lock().unwrap_or_else(PoisonError::into_inner) = Some(file);
            }
            Err(err) => warn!("cannot reopen log file: {err:#}"),
        }
    }
}

fn open_log(path: &Path) -> anyhow::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))
}

pub struct LogWriter(Arc<Mutex<Option<std::fs::File>>>);

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(file) => file.write(buf),
            None => std::io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(file) => file.flush(),
            None => std::io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogTarget {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(self.file.clone())
    }
}

/// Map `--log_level` 0-4 onto a tracing filter.
pub fn init_logging(cli: &Cli) -> anyhow::Result<LogTarget> {
    let filter = match cli.log_level {
        0 => "off",
        1 => "phoebe=error",
        2 => "phoebe=warn",
        3 => "phoebe=info",
        _ => "phoebe=trace",
    };
    let target = LogTarget::new(cli.log_file.clone())?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(target.clone())
        .init();
    Ok(target)
}
