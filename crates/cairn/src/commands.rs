//! Command handlers.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use cairn_core::{Error, ErrorCode, Result};
use cairn_image::{diff, image, ImageCtx, ImageSpec};
use cairn_store::{MemStore, ObjectStore};

use crate::cli::{
    parse_size, BenchWriteArgs, CloneArgs, CreateArgs, ExportDiffArgs, GlobalArgs, ImageArg,
    IoPattern, LockAddArgs, MergeDiffArgs, OutputFormat, PathImageArgs, ResizeArgs, TwoImageArgs,
};
use crate::progress::Progress;

/// Bytes moved per chunk by export/import.
const COPY_CHUNK: u64 = 1 << 22;

fn parse_spec(global: &GlobalArgs, spec: &str) -> Result<ImageSpec> {
    ImageSpec::parse(spec, &global.pool)
}

fn need_snap(spec: &ImageSpec) -> Result<&str> {
    spec.snap
        .as_deref()
        .ok_or_else(|| Error::invalid(format!("spec {spec} needs an @snap suffix")))
}

fn no_snap(spec: &ImageSpec) -> Result<()> {
    if spec.snap.is_some() {
        return Err(Error::invalid(format!("spec {spec} must not name a snapshot")));
    }
    Ok(())
}

fn size_arg(input: &str) -> Result<u64> {
    parse_size(input).map_err(Error::invalid)
}

async fn ensure_pool(store: &MemStore, pool: &str) -> Result<()> {
    match store.create_pool(pool).await {
        Ok(()) => Ok(()),
        Err(e) if e.is(ErrorCode::Exists) => Ok(()),
        Err(e) => Err(e),
    }
}

fn print_json<T: serde::Serialize>(global: &GlobalArgs, value: &T) -> Result<()> {
    let out = if global.pretty_format {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|e| Error::Encoding(e.to_string()))?;
    println!("{out}");
    Ok(())
}

fn fmt_size(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [("TiB", 40), ("GiB", 30), ("MiB", 20), ("KiB", 10)];
    for (name, shift) in UNITS {
        if bytes >= (1 << shift) && bytes % (1 << shift) == 0 {
            return format!("{} {name}", bytes >> shift);
        }
    }
    format!("{bytes} B")
}

pub async fn handle_list(store: &MemStore, global: &GlobalArgs) -> Result<()> {
    let names = image::list(store, &global.pool).await?;
    match global.format {
        OutputFormat::Json => print_json(global, &names)?,
        OutputFormat::Plain => {
            for name in names {
                println!("{name}");
            }
        }
    }
    Ok(())
}

pub async fn handle_info(store: &MemStore, global: &GlobalArgs, args: &ImageArg) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    let info = ctx.info();
    match global.format {
        OutputFormat::Json => print_json(global, &info)?,
        OutputFormat::Plain => {
            println!("image {}:", info.name);
            println!(
                "\tsize {} in {} objects",
                fmt_size(info.size),
                info.size.div_ceil(info.block_size.max(1))
            );
            println!("\torder {} ({} objects)", info.order, fmt_size(info.block_size));
            println!("\tid: {}", info.id);
            println!("\tformat: {}", info.format);
            println!("\tstripe unit: {}", fmt_size(info.stripe_unit));
            println!("\tstripe count: {}", info.stripe_count);
            if let Some(parent) = &info.parent {
                println!("\tparent: {parent}");
            }
        }
    }
    Ok(())
}

pub async fn handle_create(
    store: &MemStore,
    global: &GlobalArgs,
    args: &CreateArgs,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    no_snap(&spec)?;
    ensure_pool(store, &spec.pool).await?;

    let opts = image::CreateOptions {
        size: size_arg(&args.size)?,
        order: args.order,
        stripe_unit: args.stripe_unit.as_deref().map(size_arg).transpose()?,
        stripe_count: args.stripe_count,
        shared: args.image_shared,
        format: args.image_format,
    };
    image::create(store, &spec.pool, &spec.image, &opts).await?;
    Ok(())
}

pub async fn handle_clone(store: &MemStore, global: &GlobalArgs, args: &CloneArgs) -> Result<()> {
    let parent = parse_spec(global, &args.parent)?;
    let snap = need_snap(&parent)?;
    let child = parse_spec(global, &args.child)?;
    no_snap(&child)?;
    ensure_pool(store, &child.pool).await?;
    image::clone(store, &parent.pool, &parent.image, snap, &child.pool, &child.image).await
}

pub async fn handle_flatten(store: &MemStore, global: &GlobalArgs, args: &ImageArg) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    no_snap(&spec)?;
    let mut ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    ctx.flatten().await
}

pub async fn handle_children(
    store: &MemStore,
    global: &GlobalArgs,
    args: &ImageArg,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let snap = need_snap(&spec)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    let children = ctx.children(snap)?;
    match global.format {
        OutputFormat::Json => print_json(global, &children)?,
        OutputFormat::Plain => {
            for child in children {
                println!("{}/{}", child.pool, child.image);
            }
        }
    }
    Ok(())
}

pub async fn handle_resize(store: &MemStore, global: &GlobalArgs, args: &ResizeArgs) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    no_snap(&spec)?;
    let new_size = size_arg(&args.size)?;
    let mut ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    if new_size < ctx.header().size && !args.allow_shrink {
        return Err(Error::invalid(
            "shrinking an image is only allowed with --allow-shrink",
        ));
    }
    ctx.resize(new_size).await
}

pub async fn handle_rm(store: &MemStore, global: &GlobalArgs, args: &ImageArg) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    no_snap(&spec)?;
    image::remove(store, &spec.pool, &spec.image).await
}

pub async fn handle_cp(store: &MemStore, global: &GlobalArgs, args: &TwoImageArgs) -> Result<()> {
    let src = parse_spec(global, &args.src)?;
    let dst = parse_spec(global, &args.dst)?;
    no_snap(&src)?;
    no_snap(&dst)?;
    ensure_pool(store, &dst.pool).await?;
    let ctx = ImageCtx::open(store, &src.pool, &src.image).await?;
    ctx.copy_to(&dst.pool, &dst.image).await
}

pub async fn handle_mv(store: &MemStore, global: &GlobalArgs, args: &TwoImageArgs) -> Result<()> {
    let src = parse_spec(global, &args.src)?;
    let dst = parse_spec(global, &args.dst)?;
    no_snap(&src)?;
    no_snap(&dst)?;
    if src.pool != dst.pool {
        return Err(Error::invalid("mv cannot cross pools"));
    }
    image::rename(store, &src.pool, &src.image, &dst.image).await
}

fn open_output(path: &Path) -> Result<Box<dyn Write>> {
    if path == Path::new("-") {
        Ok(Box::new(std::io::stdout()))
    } else {
        Ok(Box::new(std::fs::File::create(path)?))
    }
}

fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    if path == Path::new("-") {
        Ok(Box::new(std::io::stdin()))
    } else {
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

pub async fn handle_export(
    store: &MemStore,
    global: &GlobalArgs,
    args: &PathImageArgs,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    let size = match spec.snap.as_deref() {
        Some(snap) => {
            ctx.header()
                .snap_by_name(snap)
                .ok_or_else(|| Error::not_found(format!("no such snapshot: {snap}")))?
                .size
        }
        None => ctx.header().size,
    };

    let mut out = open_output(&args.path)?;
    let mut progress = Progress::new("Exporting image", size, !global.no_progress);
    let mut off = 0;
    while off < size {
        let len = COPY_CHUNK.min(size - off);
        let chunk = match spec.snap.as_deref() {
            Some(snap) => ctx.read_at_snap(snap, off, len).await?,
            None => ctx.read(off, len).await?,
        };
        out.write_all(&chunk)?;
        progress.advance(len);
        off += len;
    }
    out.flush()?;
    progress.done();
    Ok(())
}

pub async fn handle_import(
    store: &MemStore,
    global: &GlobalArgs,
    args: &PathImageArgs,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    no_snap(&spec)?;
    ensure_pool(store, &spec.pool).await?;

    let mut input = open_input(&args.path)?;
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;

    let opts = image::CreateOptions { size: data.len() as u64, ..Default::default() };
    image::create(store, &spec.pool, &spec.image, &opts).await?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;

    let mut progress = Progress::new("Importing image", data.len() as u64, !global.no_progress);
    let mut off = 0usize;
    while off < data.len() {
        let len = (COPY_CHUNK as usize).min(data.len() - off);
        let chunk = &data[off..off + len];
        // Sparse import: skip all-zero chunks.
        if chunk.iter().any(|b| *b != 0) {
            ctx.write(off as u64, Bytes::copy_from_slice(chunk)).await?;
        }
        progress.advance(len as u64);
        off += len;
    }
    progress.done();
    Ok(())
}

pub async fn handle_export_diff(
    store: &MemStore,
    global: &GlobalArgs,
    args: &ExportDiffArgs,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    let records = ctx
        .export_diff(args.from_snap.as_deref(), spec.snap.as_deref())
        .await?;

    let mut out = open_output(&args.path)?;
    diff::write_stream(&mut out, &records)?;
    out.flush()?;
    info!(image = %spec, records = records.len(), "exported diff");
    Ok(())
}

pub async fn handle_import_diff(
    store: &MemStore,
    global: &GlobalArgs,
    args: &PathImageArgs,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    no_snap(&spec)?;
    let mut input = open_input(&args.path)?;
    let records = diff::read_stream(&mut input)?;
    let mut ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    ctx.import_diff(records).await
}

pub async fn handle_merge_diff(args: &MergeDiffArgs) -> Result<()> {
    let first = diff::read_stream(&mut open_input(&args.first)?)?;
    let second = diff::read_stream(&mut open_input(&args.second)?)?;
    let merged = diff::merge(first, second)?;
    let mut out = open_output(&args.path)?;
    diff::write_stream(&mut out, &merged)?;
    out.flush()?;
    Ok(())
}

pub async fn handle_snap_ls(store: &MemStore, global: &GlobalArgs, args: &ImageArg) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    match global.format {
        OutputFormat::Json => print_json(global, &ctx.snaps())?,
        OutputFormat::Plain => {
            for snap in ctx.snaps() {
                let protected = if snap.protected { " (protected)" } else { "" };
                println!("{}\t{}\t{}{}", snap.id, snap.name, fmt_size(snap.size), protected);
            }
        }
    }
    Ok(())
}

pub async fn handle_snap_op(
    store: &MemStore,
    global: &GlobalArgs,
    args: &ImageArg,
    op: SnapOp,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let mut ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    match op {
        SnapOp::Purge => {
            no_snap(&spec)?;
            ctx.snap_purge().await
        }
        _ => {
            let snap = need_snap(&spec)?;
            match op {
                SnapOp::Create => ctx.snap_create(snap).await,
                SnapOp::Rollback => ctx.snap_rollback(snap).await,
                SnapOp::Rm => ctx.snap_rm(snap).await,
                SnapOp::Protect => ctx.snap_protect(snap).await,
                SnapOp::Unprotect => ctx.snap_unprotect(snap).await,
                SnapOp::Purge => unreachable!("handled above"),
            }
        }
    }
}

/// Snapshot operations sharing the `image@snap` argument shape.
#[derive(Clone, Copy)]
pub enum SnapOp {
    /// Create a snapshot.
    Create,
    /// Roll back to a snapshot.
    Rollback,
    /// Remove a snapshot.
    Rm,
    /// Remove all unprotected snapshots.
    Purge,
    /// Protect a snapshot.
    Protect,
    /// Unprotect a snapshot.
    Unprotect,
}

pub async fn handle_lock_ls(store: &MemStore, global: &GlobalArgs, args: &ImageArg) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    let locks = ctx.lock_ls().await?;
    match global.format {
        OutputFormat::Json => print_json(global, &locks)?,
        OutputFormat::Plain => {
            let kind = if locks.exclusive { "exclusive" } else { "shared" };
            for holder in &locks.holders {
                println!("{}\t{}\t{kind}", holder.owner, holder.cookie);
            }
        }
    }
    Ok(())
}

pub async fn handle_lock_add(
    store: &MemStore,
    global: &GlobalArgs,
    args: &LockAddArgs,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    ctx.lock_add(&args.lock_id, &client_name(global), !args.shared).await
}

pub async fn handle_lock_rm(
    store: &MemStore,
    global: &GlobalArgs,
    args: &LockAddArgs,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    ctx.lock_rm(&args.lock_id, &client_name(global)).await
}

fn client_name(global: &GlobalArgs) -> String {
    format!("client.{}", global.id)
}

pub async fn handle_status(store: &MemStore, global: &GlobalArgs, args: &ImageArg) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    let watchers = ctx.watchers().await?;
    match global.format {
        OutputFormat::Json => print_json(global, &watchers)?,
        OutputFormat::Plain => {
            if watchers.is_empty() {
                println!("Watchers: none");
            } else {
                println!("Watchers:");
                for id in watchers {
                    println!("\twatcher {id}");
                }
            }
        }
    }
    Ok(())
}

pub async fn handle_watch(store: &MemStore, global: &GlobalArgs, args: &ImageArg) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    let ctx = ImageCtx::open(store, &spec.pool, &spec.image).await?;
    let mut handle = ctx.watch().await?;
    let watch_id = handle.id;
    println!("watching {spec} (press ctrl-c to stop)");

    loop {
        tokio::select! {
            notification = handle.recv() => {
                match notification {
                    Some(n) => {
                        println!("notify id {} payload {} bytes", n.notify_id, n.payload.len());
                        n.ack(watch_id, Bytes::new());
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    ctx.unwatch(watch_id).await
}

pub async fn handle_bench_write(
    store: &Arc<MemStore>,
    global: &GlobalArgs,
    args: &BenchWriteArgs,
) -> Result<()> {
    let spec = parse_spec(global, &args.image)?;
    no_snap(&spec)?;
    let io_size = size_arg(&args.io_size)?.max(1);
    let io_total = size_arg(&args.io_total)?;
    let threads = args.io_threads.max(1);
    let per_thread_ops = io_total / io_size / threads as u64;
    if per_thread_ops == 0 {
        return Err(Error::invalid("io-total too small for io-size and io-threads"));
    }

    // Validate the image before spawning workers.
    let image_size = {
        let ctx = ImageCtx::open(store.as_ref(), &spec.pool, &spec.image).await?;
        ctx.header().size
    };
    if image_size < io_size {
        return Err(Error::invalid("image smaller than io-size"));
    }

    let start = Instant::now();
    let mut tasks = tokio::task::JoinSet::new();
    for thread in 0..threads {
        let store = Arc::clone(store);
        let pool = spec.pool.clone();
        let image_name = spec.image.clone();
        let pattern = args.io_pattern;
        tasks.spawn(async move {
            let ctx = ImageCtx::open(store.as_ref(), &pool, &image_name).await?;
            let mut rng = rand::rngs::StdRng::seed_from_u64(thread as u64);
            let span = image_size - io_size;
            let payload = Bytes::from(vec![0x5a; io_size as usize]);

            for op in 0..per_thread_ops {
                let off = match pattern {
                    IoPattern::Seq => {
                        (thread as u64 * per_thread_ops + op) * io_size % (span + 1)
                    }
                    IoPattern::Rand => rng.gen_range(0..=span),
                };
                ctx.write(off, payload.clone()).await?;
            }
            Ok::<u64, Error>(per_thread_ops * io_size)
        });
    }

    let mut written = 0u64;
    while let Some(joined) = tasks.join_next().await {
        written += joined.map_err(|e| Error::new(ErrorCode::Io, e.to_string()))??;
    }

    let elapsed = start.elapsed().as_secs_f64().max(1e-9);
    debug!(written, elapsed, "bench-write finished");
    println!(
        "elapsed: {elapsed:.2}s  ops: {}  bytes: {written}  throughput: {:.1} MiB/s",
        written / io_size,
        written as f64 / elapsed / (1 << 20) as f64
    );
    Ok(())
}
