//! CLI entry point for `relaymail`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use relaymail::config::{self, Config};
use relaymail::connection::{ConnectionManager, ConnectionSettings, UsbModemProbe, WvdialDialer};
use relaymail::ingest::{self, InboundIngestionJob, InboundMessage};
use relaymail::queue::{QueueConsumer, SpoolQueue};
use relaymail::store::fs::{FsArchive, FsBlobStore, FsMailbox};
use relaymail::sync::{FsTransport, SyncEngine};

#[derive(Parser)]
#[command(
    name = "relaymail",
    version,
    about = "Store-and-forward email relay for low-connectivity sites"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the link up and run one upload/download cycle
    Sync,
    /// Drain the inbound queue into the email archive until interrupted
    Ingest,
    /// Store a raw MIME message and enqueue it for ingestion ("-" reads stdin)
    Receive {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = setup_logging(log_level, &config);

    match cli.command {
        Commands::Sync => cmd_sync(&config),
        Commands::Ingest => cmd_ingest(&config),
        Commands::Receive { file } => cmd_receive(&config, &file),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and file logging in the state directory.
fn setup_logging(
    level: &str,
    config: &Config,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::state_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "relaymail.log");
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        None
    }
}

/// Run one sync cycle inside a connection scope.
fn cmd_sync(config: &Config) -> anyhow::Result<()> {
    let settings = ConnectionSettings::from_config(config);
    let probe = UsbModemProbe::new(&config.connection.lsusb_bin, &config.connection.modeswitch_bin);
    let dialer = WvdialDialer::new(&config.connection.wvdial_bin);
    let mut manager = ConnectionManager::new(settings, probe, dialer);

    let mailbox_path = config::mailbox_path(config);
    let mailbox = FsMailbox::open(&mailbox_path)
        .with_context(|| format!("opening mailbox {}", mailbox_path.display()))?;
    let transport = FsTransport::new(
        &config.sync.outbox_dir,
        &config.sync.inbox_dir,
        &config.sync.client_id,
    );

    let report = manager.with_connection(|_connection| -> anyhow::Result<_> {
        let mut engine = SyncEngine::new(mailbox, transport).with_span(tracing::info_span!(
            "sync",
            client_id = %config.sync.client_id
        ));
        Ok(engine.run_cycle())
    })?;

    println!(
        "uploaded {} email(s), downloaded {} email(s){}",
        report.uploaded,
        report.downloaded,
        if report.is_success() {
            ""
        } else {
            " (some phases failed; they will be retried next cycle)"
        }
    );
    Ok(())
}

/// Consume the inbound queue until SIGINT/SIGTERM.
fn cmd_ingest(config: &Config) -> anyhow::Result<()> {
    let server = &config.server;
    let queue = SpoolQueue::open(&server.queue_dir, server.visibility_timeout())
        .with_context(|| format!("opening queue {}", server.queue_dir.display()))?;
    let job = InboundIngestionJob::new(
        FsBlobStore::new(&server.blob_dir),
        FsArchive::new(&server.archive_dir),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("installing signal handler")?;
    }

    let mut consumer = QueueConsumer::new(queue)
        .with_max_deliveries(server.max_deliveries)
        .with_poll_interval(server.poll_interval())
        .with_shutdown(shutdown);

    let stats = consumer.run(|message: InboundMessage| job.process(message))?;
    println!(
        "acked {}, left for redelivery {}, dead-lettered {}, broker errors {}",
        stats.acked, stats.unacked, stats.dead_lettered, stats.broker_errors
    );
    Ok(())
}

/// Store a raw message and enqueue it.
fn cmd_receive(config: &Config, file: &Path) -> anyhow::Result<()> {
    let raw = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading message from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?
    };

    let server = &config.server;
    let blobs = FsBlobStore::new(&server.blob_dir);
    let mut queue = SpoolQueue::open(&server.queue_dir, server.visibility_timeout())?;
    let resource_id = ingest::receive_inbound(&blobs, &mut queue, &raw)?;
    println!("{resource_id}");
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "relaymail", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    man.render(&mut std::io::stdout())?;
    Ok(())
}
