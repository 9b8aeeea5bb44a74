//! Command line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Cairn: a block-image tool over object storage.
#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Global options.
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command.
#[derive(Args)]
pub struct GlobalArgs {
    /// Directory holding the store state.
    #[arg(long, default_value = ".cairn")]
    pub data_dir: PathBuf,

    /// Default pool for image specs without one.
    #[arg(short, long, default_value = "images")]
    pub pool: String,

    /// Client identity used for locks and sessions.
    #[arg(long, default_value = "admin")]
    pub id: String,

    /// File holding the client key (read, never printed).
    #[arg(long)]
    pub keyfile: Option<PathBuf>,

    /// Output format (plain, json).
    #[arg(long, default_value = "plain")]
    pub format: OutputFormat,

    /// Pretty-print json output.
    #[arg(long)]
    pub pretty_format: bool,

    /// Suppress progress output.
    #[arg(long)]
    pub no_progress: bool,
}

/// Output format for CLI commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Plain,
    /// JSON output for scripting.
    Json,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// List images in the pool.
    #[command(alias = "ls")]
    List,
    /// Show image details.
    Info(ImageArg),
    /// Create an image.
    Create(CreateArgs),
    /// Clone a protected snapshot into a new image.
    Clone(CloneArgs),
    /// Copy parent-backed data into a clone and detach it.
    Flatten(ImageArg),
    /// List clones of a snapshot.
    Children(ImageArg),
    /// Resize an image.
    Resize(ResizeArgs),
    /// Remove an image.
    Rm(ImageArg),
    /// Copy an image's head data to a new image.
    Cp(TwoImageArgs),
    /// Rename an image within its pool.
    Mv(TwoImageArgs),
    /// Export an image to a file.
    Export(PathImageArgs),
    /// Import a file as a new image.
    Import(PathImageArgs),
    /// Export the changes between two snapshots as a diff stream.
    ExportDiff(ExportDiffArgs),
    /// Apply a diff stream to an image.
    ImportDiff(PathImageArgs),
    /// Merge two adjacent diff streams.
    MergeDiff(MergeDiffArgs),
    /// Snapshot commands.
    Snap(SnapCommand),
    /// Advisory lock commands.
    Lock(LockCommand),
    /// Watch an image's header for updates.
    Watch(ImageArg),
    /// Show image watchers.
    Status(ImageArg),
    /// Write benchmark against an image.
    BenchWrite(BenchWriteArgs),
}

/// A single image (or `image@snap`) argument.
#[derive(Args)]
pub struct ImageArg {
    /// Image spec: `[pool/]image[@snap]`.
    pub image: String,
}

/// Source and destination image arguments.
#[derive(Args)]
pub struct TwoImageArgs {
    /// Source image spec.
    pub src: String,
    /// Destination image spec.
    pub dst: String,
}

/// A file path plus an image argument.
#[derive(Args)]
pub struct PathImageArgs {
    /// File path (`-` for stdin/stdout where supported).
    pub path: PathBuf,
    /// Image spec.
    pub image: String,
}

/// Arguments for create.
#[derive(Args)]
pub struct CreateArgs {
    /// Image spec: `[pool/]image`.
    pub image: String,

    /// Image size (accepts K/M/G/T suffixes).
    #[arg(short, long)]
    pub size: String,

    /// Block order: block size is 2^order bytes.
    #[arg(long)]
    pub order: Option<u8>,

    /// Image format (only 2 is supported).
    #[arg(long, default_value = "2")]
    pub image_format: u8,

    /// Mark the image shared.
    #[arg(long)]
    pub image_shared: bool,

    /// Stripe unit (accepts size suffixes).
    #[arg(long)]
    pub stripe_unit: Option<String>,

    /// Stripe count.
    #[arg(long)]
    pub stripe_count: Option<u64>,
}

/// Arguments for clone.
#[derive(Args)]
pub struct CloneArgs {
    /// Parent snapshot spec: `[pool/]image@snap`.
    pub parent: String,
    /// Child image spec: `[pool/]image`.
    pub child: String,
}

/// Arguments for resize.
#[derive(Args)]
pub struct ResizeArgs {
    /// Image spec.
    pub image: String,

    /// New size (accepts size suffixes).
    #[arg(short, long)]
    pub size: String,

    /// Permit shrinking.
    #[arg(long)]
    pub allow_shrink: bool,
}

/// Arguments for export-diff.
#[derive(Args)]
pub struct ExportDiffArgs {
    /// Image spec; an `@snap` suffix selects the diff end point.
    pub image: String,

    /// Output file path.
    pub path: PathBuf,

    /// Snapshot the diff starts from (defaults to the image beginning).
    #[arg(long)]
    pub from_snap: Option<String>,
}

/// Arguments for merge-diff.
#[derive(Args)]
pub struct MergeDiffArgs {
    /// First (older) diff stream.
    pub first: PathBuf,
    /// Second (newer) diff stream.
    pub second: PathBuf,
    /// Output path for the merged stream.
    pub path: PathBuf,
}

/// Snapshot commands.
#[derive(Args)]
pub struct SnapCommand {
    /// Snapshot subcommand.
    #[command(subcommand)]
    pub command: SnapSubcommand,
}

/// Snapshot subcommands.
#[derive(Subcommand)]
pub enum SnapSubcommand {
    /// List snapshots of an image.
    Ls(ImageArg),
    /// Create a snapshot (`image@snap`).
    Create(ImageArg),
    /// Roll the image back to a snapshot.
    Rollback(ImageArg),
    /// Remove a snapshot.
    Rm(ImageArg),
    /// Remove all unprotected snapshots.
    Purge(ImageArg),
    /// Protect a snapshot from removal.
    Protect(ImageArg),
    /// Unprotect a snapshot.
    Unprotect(ImageArg),
}

/// Advisory lock commands.
#[derive(Args)]
pub struct LockCommand {
    /// Lock subcommand.
    #[command(subcommand)]
    pub command: LockSubcommand,
}

/// Lock subcommands.
#[derive(Subcommand)]
pub enum LockSubcommand {
    /// List lock holders.
    Ls(ImageArg),
    /// Acquire the image lock.
    Add(LockAddArgs),
    /// Release the image lock.
    Rm(LockAddArgs),
}

/// Arguments for lock add/rm.
#[derive(Args)]
pub struct LockAddArgs {
    /// Image spec.
    pub image: String,

    /// Lock cookie identifying this holder.
    pub lock_id: String,

    /// Take the lock shared instead of exclusive.
    #[arg(long)]
    pub shared: bool,
}

/// Arguments for bench-write.
#[derive(Args)]
pub struct BenchWriteArgs {
    /// Image spec.
    pub image: String,

    /// Bytes per write (accepts size suffixes).
    #[arg(long, default_value = "4K")]
    pub io_size: String,

    /// Concurrent writers.
    #[arg(long, default_value = "4")]
    pub io_threads: usize,

    /// Total bytes to write (accepts size suffixes).
    #[arg(long, default_value = "16M")]
    pub io_total: String,

    /// Write pattern.
    #[arg(long, default_value = "seq")]
    pub io_pattern: IoPattern,
}

/// Benchmark access pattern.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum IoPattern {
    /// Sequential writes.
    #[default]
    Seq,
    /// Uniformly random offsets.
    Rand,
}

/// Parses a size with optional K/M/G/T suffix (powers of two).
pub fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, shift) = match trimmed.chars().last() {
        Some('K' | 'k') => (&trimmed[..trimmed.len() - 1], 10),
        Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 20),
        Some('G' | 'g') => (&trimmed[..trimmed.len() - 1], 30),
        Some('T' | 't') => (&trimmed[..trimmed.len() - 1], 40),
        _ => (trimmed, 0),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid size {input:?}: {e}"))?;
    value
        .checked_shl(shift)
        .filter(|v| shift == 0 || *v >> shift == value)
        .ok_or_else(|| format!("size {input:?} overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_parsing() {
        let cli = Cli::parse_from([
            "cairn", "create", "vols/db01", "--size", "10G", "--order", "22",
        ]);
        if let Commands::Create(args) = cli.command {
            assert_eq!(args.image, "vols/db01");
            assert_eq!(args.size, "10G");
            assert_eq!(args.order, Some(22));
            assert_eq!(args.image_format, 2);
        } else {
            panic!("Expected Create command");
        }
    }

    #[test]
    fn test_global_defaults() {
        let cli = Cli::parse_from(["cairn", "list"]);
        assert_eq!(cli.global.pool, "images");
        assert_eq!(cli.global.id, "admin");
        assert_eq!(cli.global.format, OutputFormat::Plain);
        assert!(!cli.global.no_progress);
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_ls_alias() {
        let cli = Cli::parse_from(["cairn", "ls"]);
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_snap_create_parsing() {
        let cli = Cli::parse_from(["cairn", "snap", "create", "db01@backup"]);
        if let Commands::Snap(cmd) = cli.command {
            if let SnapSubcommand::Create(args) = cmd.command {
                assert_eq!(args.image, "db01@backup");
            } else {
                panic!("Expected snap create");
            }
        } else {
            panic!("Expected Snap command");
        }
    }

    #[test]
    fn test_export_diff_parsing() {
        let cli = Cli::parse_from([
            "cairn",
            "export-diff",
            "db01@s2",
            "/tmp/diff.bin",
            "--from-snap",
            "s1",
        ]);
        if let Commands::ExportDiff(args) = cli.command {
            assert_eq!(args.image, "db01@s2");
            assert_eq!(args.from_snap.as_deref(), Some("s1"));
            assert_eq!(args.path, PathBuf::from("/tmp/diff.bin"));
        } else {
            panic!("Expected ExportDiff command");
        }
    }

    #[test]
    fn test_bench_write_defaults() {
        let cli = Cli::parse_from(["cairn", "bench-write", "db01"]);
        if let Commands::BenchWrite(args) = cli.command {
            assert_eq!(args.io_size, "4K");
            assert_eq!(args.io_threads, 4);
            assert_eq!(args.io_pattern, IoPattern::Seq);
        } else {
            panic!("Expected BenchWrite command");
        }
    }

    #[test]
    fn test_lock_parsing() {
        let cli = Cli::parse_from(["cairn", "lock", "add", "db01", "host1", "--shared"]);
        if let Commands::Lock(cmd) = cli.command {
            if let LockSubcommand::Add(args) = cmd.command {
                assert_eq!(args.lock_id, "host1");
                assert!(args.shared);
            } else {
                panic!("Expected lock add");
            }
        } else {
            panic!("Expected Lock command");
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("10M").unwrap(), 10 << 20);
        assert_eq!(parse_size("2G").unwrap(), 2 << 30);
        assert_eq!(parse_size("1T").unwrap(), 1 << 40);
        assert!(parse_size("").is_err());
        assert!(parse_size("x").is_err());
        assert!(parse_size("99999999T").is_err());
    }
}
