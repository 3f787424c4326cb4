//! SnapshotWriter: one backup run, from dump order to committed artifact.
//!
//! Sequence: resolve order → serialize tables in order → walk media →
//! aggregate checksum → manifest → rename-commit. Everything happens in a
//! hidden temp directory; on any failure the temp directory is deleted, so
//! a half-written snapshot is never selectable for restore. Exactly one
//! snapshot record (directory) per run.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::ArchiveWriter;
use crate::checksum;
use crate::config::VaultConfig;
use crate::deps;
use crate::errors::ValidationError;
use crate::manifest::{
    generate_id, now_unix_ms, write_manifest, Compression, Manifest, MediaAsset, TableEntry,
    SCHEMA_VERSION,
};
use crate::progress::{Phase, ProgressTracker};
use crate::schema::{SchemaDescriptor, StateStore};
use crate::serializer::serialize_rows;

use super::{snapshot_dir, snapshots_dir, ARCHIVE_FILE, MANIFEST_FILE};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub include_media: bool,
    /// None means "use the configured default".
    pub compress: Option<Compression>,
    pub exclude_tables: Vec<String>,
    /// Overrides VaultConfig::op_timeout when set.
    pub timeout: Option<Duration>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include_media: true,
            compress: None,
            exclude_tables: Vec::new(),
            timeout: None,
        }
    }
}

pub struct SnapshotWriter<'a> {
    root: &'a Path,
    cfg: &'a VaultConfig,
    schema: &'a SchemaDescriptor,
}

impl<'a> SnapshotWriter<'a> {
    pub fn new(root: &'a Path, cfg: &'a VaultConfig, schema: &'a SchemaDescriptor) -> Self {
        Self { root, cfg, schema }
    }

    /// Run one backup with a fresh id. The caller holds the target's
    /// exclusive lock. Returns the committed manifest.
    pub fn run(
        &self,
        store: &dyn StateStore,
        opts: &BackupOptions,
        tracker: &ProgressTracker,
    ) -> Result<Manifest> {
        self.run_with_id(store, opts, tracker, &generate_id())
    }

    /// Same as run(), but the caller picks the snapshot id. The vault uses
    /// this so it can hand the id back before the worker thread finishes.
    pub fn run_with_id(
        &self,
        store: &dyn StateStore,
        opts: &BackupOptions,
        tracker: &ProgressTracker,
        snapshot_id: &str,
    ) -> Result<Manifest> {
        let tmp_dir = snapshots_dir(self.root).join(format!(".tmp-{snapshot_id}"));
        fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("create snapshot temp dir {}", tmp_dir.display()))?;

        let result = self.run_inner(store, opts, tracker, snapshot_id, &tmp_dir);
        if result.is_err() {
            // Failed runs leave nothing selectable behind.
            if let Err(e) = fs::remove_dir_all(&tmp_dir) {
                warn!("backup: cleanup of {} failed: {e}", tmp_dir.display());
            }
        }
        result
    }

    fn run_inner(
        &self,
        store: &dyn StateStore,
        opts: &BackupOptions,
        tracker: &ProgressTracker,
        snapshot_id: &str,
        tmp_dir: &Path,
    ) -> Result<Manifest> {
        let compression = opts.compress.unwrap_or(self.cfg.compression);
        info!(
            "backup: start, root={}, id={}, compression={:?}, include_media={}",
            self.root.display(),
            snapshot_id,
            compression,
            opts.include_media
        );

        // Dump order over the full schema, then drop exclusions.
        tracker.set_phase(Phase::ResolvingOrder);
        for ex in &opts.exclude_tables {
            if self.schema.table(ex).is_none() {
                return Err(ValidationError(format!("exclude_tables names unknown table {ex}")).into());
            }
        }
        let order = deps::resolve(self.schema)?;
        let tables: Vec<String> = order
            .tables
            .iter()
            .filter(|t| !opts.exclude_tables.contains(t))
            .cloned()
            .collect();
        debug!("backup: dump order {:?}, deferred={:?}", tables, order.deferred);

        // Media list first so progress units cover tables + files.
        let media_files = if opts.include_media {
            self.collect_media_files()?
        } else {
            Vec::new()
        };
        tracker.begin_units(tables.len() as u64 + media_files.len() as u64);

        let archive_file = tmp_dir.join(ARCHIVE_FILE);
        let mut archive = ArchiveWriter::create(&archive_file, compression, self.cfg.gzip_level)?;

        // Tables, in dump order.
        tracker.set_phase(Phase::DumpingTables);
        let mut table_list = Vec::with_capacity(tables.len());
        let mut total_record_count: u64 = 0;
        for table in &tables {
            tracker.checkpoint(&format!("table {table}"))?;
            let member = format!("tables/{table}.dat");
            let mut mw = archive.begin_member(&member)?;
            let rows = store.scan(table)?;
            let record_count = serialize_rows(table, rows, &mut mw)
                .with_context(|| format!("serialize table {table}"))?;
            let stats = mw.finish()?;
            debug!(
                "backup: table {} rows={} stored_bytes={}",
                table, record_count, stats.stored_bytes
            );
            total_record_count += record_count;
            table_list.push(TableEntry {
                table_name: table.clone(),
                record_count,
                member,
                checksum: stats.checksum,
            });
            tracker.unit_done();
        }

        // Media files, path-sorted.
        let mut media_list = Vec::with_capacity(media_files.len());
        if !media_files.is_empty() {
            tracker.set_phase(Phase::CopyingMedia);
            for (rel, abs) in &media_files {
                tracker.checkpoint(&format!("media file {rel}"))?;
                let meta = fs::metadata(abs)
                    .with_context(|| format!("stat media file {}", abs.display()))?;
                let mut f = fs::File::open(abs)
                    .with_context(|| format!("open media file {}", abs.display()))?;
                let mut mw = archive.begin_member(&format!("media/{rel}"))?;
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = f.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    std::io::Write::write_all(&mut mw, &buf[..n])?;
                }
                let stats = mw.finish()?;
                media_list.push(MediaAsset {
                    relative_path: rel.clone(),
                    byte_size: meta.len(),
                    checksum: stats.checksum,
                    mode: file_mode(&meta),
                });
                tracker.unit_done();
            }
            debug!("backup: media copied, files={}", media_list.len());
        }

        // All members are on disk before any aggregate math happens.
        tracker.set_phase(Phase::Finalizing);
        archive.finish()?;
        let total_byte_size = fs::metadata(&archive_file)?.len();

        let member_hashes: Vec<String> = table_list
            .iter()
            .map(|t| t.checksum.clone())
            .chain(media_list.iter().map(|m| m.checksum.clone()))
            .collect();
        let aggregate = checksum::aggregate(&member_hashes);

        let manifest = Manifest {
            snapshot_id: snapshot_id.to_string(),
            created_unix_ms: now_unix_ms(),
            schema_version: SCHEMA_VERSION,
            table_list,
            media_list,
            total_record_count,
            total_byte_size,
            compression,
            checksum: aggregate,
        };
        write_manifest(&tmp_dir.join(MANIFEST_FILE), &manifest)?;

        // Commit point: the snapshot becomes visible in one rename.
        let final_dir = snapshot_dir(self.root, snapshot_id);
        fs::rename(tmp_dir, &final_dir).with_context(|| {
            format!("commit snapshot {} -> {}", tmp_dir.display(), final_dir.display())
        })?;

        info!(
            "backup: done, id={}, tables={}, media={}, records={}, bytes={}",
            snapshot_id,
            manifest.table_list.len(),
            manifest.media_list.len(),
            manifest.total_record_count,
            manifest.total_byte_size
        );
        Ok(manifest)
    }

    /// Walk the configured media directory; (relative_path, absolute_path),
    /// sorted by relative path for deterministic member order.
    fn collect_media_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let media_root = match &self.cfg.media_dir {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        if !media_root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(media_root).follow_links(false) {
            let entry = entry.with_context(|| format!("walk {}", media_root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(media_root)
                .with_context(|| format!("media path outside {}", media_root.display()))?
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, entry.path().to_path_buf()));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0
}
