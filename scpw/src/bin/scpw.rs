use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "scpw",
    version,
    about = "Simplify scp operations - upload and download directory maps of inventory hosts",
    long_about = "`scpw` copies files and directory trees to and from the hosts of an inventory file by driving the remote `scp` over one shared ssh connection.

Each inventory node names a host, how to log in, a transfer type (PUT or GET) and a list of local/remote path pairs (`lr-map`). All pairs of the chosen node are transferred, several at a time.

The inventory is read from --config, or else from the first of ~/.scpw, ~/.scpw.yml, ~/.scpw.yaml, ./.scpw, ./.scpw.yml, ./.scpw.yaml.

PATHS:
    PUT  local `dir`      uploads the directory itself into the remote path
    PUT  local `dir/*`    uploads only the contents of the directory
    GET  remote `dir/`    downloads the remote directory into the local directory
    GET  remote `file`    downloads a single file to the local path

EXAMPLES:
    # Show the nodes of the inventory
    scpw --list

    # Run the transfers of node `web-1` with progress bars
    scpw web-1 --progress --summary"
)]
struct Args {
    /// Inventory node to transfer (see --list)
    #[arg(required_unless_present = "list")]
    node: Option<String>,

    // Inventory
    /// Inventory file to use instead of searching the default locations
    #[arg(long, value_name = "PATH", help_heading = "Inventory")]
    config: Option<std::path::PathBuf>,

    /// List the nodes of the inventory and exit
    #[arg(long, help_heading = "Inventory")]
    list: bool,

    // Transfer options
    /// Do not preserve modification and access times
    #[arg(long, help_heading = "Transfer options")]
    no_keep_time: bool,

    /// Maximum number of path pairs transferred at the same time
    #[arg(
        long,
        default_value = "4",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    max_parallel: usize,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set delay between progress updates
    ///
    /// Default is 200ms. If specified, --progress flag is implied. Accepts human-readable durations like "200ms", "1s".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

fn progress_board(args: &Args) -> anyhow::Result<common::progress::ProgressBoard> {
    if !args.progress && args.progress_delay.is_none() {
        return Ok(common::progress::ProgressBoard::hidden());
    }
    let tick = match &args.progress_delay {
        Some(delay) => humantime::parse_duration(delay)
            .with_context(|| format!("invalid --progress-delay {delay:?}"))?,
        None => std::time::Duration::from_millis(200),
    };
    common::progress::ProgressBoard::new(tick)
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<scpw::Summary> {
    let inventory = match &args.config {
        Some(path) => common::config::Inventory::load(path)?,
        None => common::config::Inventory::discover()?,
    };
    if args.list {
        for node in inventory.flatten() {
            println!("{node}");
        }
        return Ok(scpw::Summary::default());
    }
    let name = args.node.as_deref().context("no node given")?;
    let node = inventory
        .find(name)
        .with_context(|| format!("node {name:?} not found in {:?}", &inventory.source))?;
    let direction = node
        .direction
        .with_context(|| format!("node {name:?} has no transfer type, set `type` to PUT or GET"))?;
    if node.lr_map.is_empty() {
        return Err(anyhow!("node {name:?} has no `lr-map` entries"));
    }
    let target = remote::ssh::SshTarget::from_node(node)?;
    let board = progress_board(&args)?;
    tracing::info!("{}", node);
    let transport = remote::ssh::connect(&target).await?;
    let session = remote::Session::new(transport, !args.no_keep_time);
    let cancel = tokio_util::sync::CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping at the next directory");
                cancel.cancel();
            }
        })
    };
    let report = scpw::batch::run(
        &session,
        &node.lr_map,
        direction,
        args.max_parallel,
        &board,
        &cancel,
    )
    .await;
    interrupt.abort();
    let closed = match session.into_transport() {
        Some(transport) => transport.close().await,
        None => Ok(()),
    };
    if let Err(error) = closed {
        tracing::warn!("{:#}", &error);
    }
    if report.is_success() {
        Ok(report.summary)
    } else {
        Err(anyhow!("{}", report.to_string().trim_end()))
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: (args.summary || args.verbose > 0) && !args.list,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
