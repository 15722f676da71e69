//! The store: RAM flush window, size/day rotation with sealing, priority
//! pruning with critical carry-forward, and the acknowledgment cursor the
//! sync client drives. All durability ordering lives here: sync before
//! seal, cursor meta persisted before segment deletion.

use crate::compress::compress_block;
use crate::error::{StoreError, StoreResult};
use crate::fs::Volume;
use crate::record::{frame_into, unframe, Priority, Record, Unframed};
use crate::segment::{self, SegmentKind};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use flint::logging::{self, Logger};
use hashbrown::HashMap;
use sha2::{Digest, Sha256};

const CURSOR_META: &str = "meta/cursor.dat";

const SECONDS_PER_DAY: u64 = 86_400;

// Operational state segments are never pruned for capacity
const PRUNABLE: [SegmentKind; 3] = [SegmentKind::Data, SegmentKind::Event, SegmentKind::Log];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub capacity_bytes: u64,
    pub max_file_size_bytes: u32,
    pub flush_buffer_bytes: u32,
    pub enable_compression: bool,
    pub compression_level: u32,
    pub cleanup_threshold_percent: u8,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            capacity_bytes: 64 * 1024 * 1024,
            max_file_size_bytes: 1024 * 1024,
            flush_buffer_bytes: 32 * 1024,
            enable_compression: true,
            compression_level: 3,
            cleanup_threshold_percent: 90,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> StoreResult<()> {
        let level_ok = (crate::compress::MIN_LEVEL..=crate::compress::MAX_LEVEL)
            .contains(&self.compression_level);

        if !level_ok
            || self.cleanup_threshold_percent > 100
            || self.max_file_size_bytes == 0
            || self.flush_buffer_bytes == 0
            || u64::from(self.max_file_size_bytes) > self.capacity_bytes
        {
            return Err(StoreError::Config);
        }

        Ok(())
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct StoreStats {
    pub records_appended: u64,
    pub records_rejected: u64,
    pub bytes_flushed: u64,
    pub segments_sealed: u64,
    pub segments_pruned: u64,
    pub records_carried_forward: u64,
    pub torn_tails_recovered: u64,
    pub batches_committed: u64,
}

/// An ordered slice of acknowledged-on-commit records with a never-reused
/// id and a fingerprint over the exact record sequence.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Batch {
    pub batch_id: u64,
    pub kind: SegmentKind,
    pub records: Vec<Record>,
    pub fingerprint: [u8; 32],
}

struct Active {
    name: String,
    created: u64,
    day: u64,
    disk_len: u64,
    buffer: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SealedSegment {
    name: String,
    kind: SegmentKind,
    created: u64,
    size: u64,
}

struct Outstanding {
    batch: Batch,
    /// Segment name, consumed-record count after commit, and whether the
    /// segment is fully covered (deletable on commit).
    covers: Vec<(String, u32, bool)>,
}

pub struct Store<V> {
    volume: V,
    config: StoreConfig,
    active: HashMap<SegmentKind, Active>,
    sealed: Vec<SealedSegment>,
    consumed: HashMap<String, u32>,
    next_batch_id: u64,
    outstanding: Option<Outstanding>,
    full: bool,
    stats: StoreStats,
    log: Logger,
}

impl<V: Volume> Store<V> {
    /// Opens the store, recovering from whatever the last power cycle left
    /// behind: torn tails are truncated, unsealed leftovers are sealed, and
    /// the cursor meta is reloaded.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(
        volume: V,
        config: StoreConfig,
        now: u64,
        log: L,
    ) -> StoreResult<Store<V>> {
        config.validate()?;

        let mut store = Store {
            volume,
            config,
            active: HashMap::new(),
            sealed: Vec::new(),
            consumed: HashMap::new(),
            next_batch_id: 0,
            outstanding: None,
            full: false,
            stats: StoreStats::default(),
            log: logging::branch(log),
        };

        store.load_cursor_meta(now)?;

        for &kind in &SegmentKind::ALL {
            store.adopt_kind(kind)?;
        }

        store
            .sealed
            .sort_by(|a, b| (a.created, &a.name).cmp(&(b.created, &b.name)));

        // Forget cursor positions for segments that no longer exist
        let live: Vec<String> = store.sealed.iter().map(|seg| seg.name.clone()).collect();
        store.consumed.retain(|name, _| live.contains(name));

        store.full = store.used_bytes() >= store.config.capacity_bytes;

        logging::info!(store.log, "store opened";
                       "context" => "open",
                       "sealed_segments" => store.sealed.len(),
                       "used_bytes" => store.used_bytes(),
                       "torn_tails" => store.stats.torn_tails_recovered);

        Ok(store)
    }

    fn adopt_kind(&mut self, kind: SegmentKind) -> StoreResult<()> {
        let names = self.volume.list(kind.dir())?;

        let mut files: Vec<(u64, String)> = names
            .into_iter()
            .filter_map(|name| segment::parse_name(kind, &name).map(|created| (created, name)))
            .collect();
        files.sort();

        let mut unsealed: Vec<(u64, String)> = Vec::new();

        for (created, name) in files {
            if segment::is_sealed(&self.volume, &name) {
                let size = self.volume.len(&name)?;
                self.sealed.push(SealedSegment {
                    name,
                    kind,
                    created,
                    size,
                });
            } else {
                unsealed.push((created, name));
            }
        }

        // Only the newest unsealed file stays active; older leftovers from
        // a crash mid-rotation are sealed as they are
        for (index, (created, name)) in unsealed.iter().enumerate() {
            let scan = segment::scan(&self.volume, name)?;

            if scan.torn {
                self.volume.truncate(name, scan.good_len)?;
                self.volume.sync(name)?;
                self.stats.torn_tails_recovered += 1;

                logging::warn!(self.log, "truncated torn tail";
                               "context" => "open",
                               "segment" => name,
                               "good_len" => scan.good_len);
            }

            if index + 1 == unsealed.len() {
                self.active.insert(
                    kind,
                    Active {
                        name: name.clone(),
                        created: *created,
                        day: created / SECONDS_PER_DAY,
                        disk_len: scan.good_len,
                        buffer: Vec::new(),
                    },
                );
            } else if scan.good_len == 0 {
                self.volume.delete(name)?;
            } else {
                segment::seal(&mut self.volume, name)?;
                self.sealed.push(SealedSegment {
                    name: name.clone(),
                    kind,
                    created: *created,
                    size: scan.good_len,
                });
                self.stats.segments_sealed += 1;
            }
        }

        Ok(())
    }

    #[inline]
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Whether the store is down to protecting critical data only.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn used_bytes(&self) -> u64 {
        let sealed: u64 = self.sealed.iter().map(|seg| seg.size).sum();
        let active: u64 = self
            .active
            .values()
            .map(|active| active.disk_len + active.buffer.len() as u64)
            .sum();

        sealed + active
    }

    /// Number of sealed segments of this kind awaiting upload. Fully
    /// consumed segments disappear at commit, so anything counted here
    /// still holds work.
    pub fn upload_backlog(&self, kind: SegmentKind) -> usize {
        self.sealed.iter().filter(|seg| seg.kind == kind).count()
    }

    /// Appends one record. Everything is accepted until the store is full;
    /// from then on only critical records get through.
    pub fn append(&mut self, kind: SegmentKind, record: &Record, now: u64) -> StoreResult<()> {
        if self.full && record.priority != Priority::Critical {
            self.stats.records_rejected += 1;
            return Err(StoreError::Full);
        }

        self.roll_if_needed(kind, now)?;
        self.stage(kind, record, now)?;
        self.stats.records_appended += 1;

        let flush_due = self
            .active
            .get(&kind)
            .map(|active| active.buffer.len() >= self.config.flush_buffer_bytes as usize)
            .unwrap_or(false);

        if flush_due {
            self.flush(kind)?;
        }

        self.enforce_capacity(now)?;

        Ok(())
    }

    /// Stages a record into the active file's RAM window, creating the
    /// active file if there is none. No capacity enforcement here, so the
    /// prune path can use it for carry-forward.
    fn stage(&mut self, kind: SegmentKind, record: &Record, now: u64) -> StoreResult<()> {
        if !self.active.contains_key(&kind) {
            let created = self.next_file_timestamp(kind, now);

            self.active.insert(
                kind,
                Active {
                    name: segment::file_name(kind, created),
                    created,
                    day: created / SECONDS_PER_DAY,
                    disk_len: 0,
                    buffer: Vec::new(),
                },
            );
        }

        let active = self.active.get_mut(&kind).expect("Active file just ensured");
        segment::encode_record_entry(&mut active.buffer, record)?;

        Ok(())
    }

    /// Timestamps in file names must be unique per kind even when several
    /// files are created within one second.
    fn next_file_timestamp(&self, kind: SegmentKind, now: u64) -> u64 {
        let newest = self
            .sealed
            .iter()
            .filter(|seg| seg.kind == kind)
            .map(|seg| seg.created)
            .max()
            .unwrap_or(0);

        now.max(newest + 1)
    }

    fn roll_if_needed(&mut self, kind: SegmentKind, now: u64) -> StoreResult<()> {
        let rotate = match self.active.get(&kind) {
            Some(active) => {
                active.day != now / SECONDS_PER_DAY
                    || active.disk_len + active.buffer.len() as u64
                        >= u64::from(self.config.max_file_size_bytes)
            }
            None => false,
        };

        if rotate {
            self.rotate(kind)?;
        }

        Ok(())
    }

    /// Flushes the RAM window in one I/O transaction, as a compressed block
    /// entry when compression is on.
    pub fn flush(&mut self, kind: SegmentKind) -> StoreResult<()> {
        let compression = if self.config.enable_compression {
            Some(self.config.compression_level)
        } else {
            None
        };

        let active = match self.active.get_mut(&kind) {
            Some(active) => active,
            None => return Ok(()),
        };

        if active.buffer.is_empty() {
            return Ok(());
        }

        let payload = match compression {
            Some(level) => {
                let packed = compress_block(&active.buffer, level)?;
                let mut entry = Vec::with_capacity(packed.len() + 16);
                segment::encode_block_entry(&mut entry, active.buffer.len() as u32, &packed);
                entry
            }
            None => std::mem::take(&mut active.buffer),
        };

        self.volume.append(&active.name, &payload)?;
        active.disk_len += payload.len() as u64;
        active.buffer.clear();
        self.stats.bytes_flushed += payload.len() as u64;

        Ok(())
    }

    pub fn flush_all(&mut self) -> StoreResult<()> {
        let kinds: Vec<SegmentKind> = self.active.keys().copied().collect();

        for kind in kinds {
            self.flush(kind)?;
        }

        Ok(())
    }

    /// Seals the active file of this kind and starts a fresh one on the
    /// next append. Sync point first; sealed files are upload-eligible.
    pub fn rotate(&mut self, kind: SegmentKind) -> StoreResult<()> {
        self.flush(kind)?;

        let active = match self.active.remove(&kind) {
            Some(active) => active,
            None => return Ok(()),
        };

        if active.disk_len == 0 {
            return Ok(());
        }

        self.volume.sync(&active.name)?;
        segment::seal(&mut self.volume, &active.name)?;

        logging::debug!(self.log, "segment sealed";
                        "context" => "rotate",
                        "segment" => &active.name,
                        "size" => active.disk_len);

        self.sealed.push(SealedSegment {
            name: active.name,
            kind,
            created: active.created,
            size: active.disk_len,
        });
        self.sealed
            .sort_by(|a, b| (a.created, &a.name).cmp(&(b.created, &b.name)));
        self.stats.segments_sealed += 1;

        Ok(())
    }

    /// Force-rotates when a sync is due but nothing sealed is waiting, so
    /// the active file itself never has to be read by the cursor.
    pub fn rotate_for_upload(&mut self, kind: SegmentKind) -> StoreResult<bool> {
        if self.upload_backlog(kind) > 0 {
            return Ok(false);
        }

        let has_data = self
            .active
            .get(&kind)
            .map(|active| active.disk_len > 0 || !active.buffer.is_empty())
            .unwrap_or(false);

        if !has_data {
            return Ok(false);
        }

        self.rotate(kind)?;
        Ok(true)
    }

    fn enforce_capacity(&mut self, now: u64) -> StoreResult<()> {
        let threshold =
            self.config.capacity_bytes / 100 * u64::from(self.config.cleanup_threshold_percent);

        while self.used_bytes() > threshold {
            if !self.prune_one(now)? {
                break;
            }
        }

        let was_full = self.full;
        self.full = self.used_bytes() >= self.config.capacity_bytes;

        if self.full && !was_full {
            logging::warn!(self.log, "storage full, accepting critical records only";
                           "context" => "capacity",
                           "used_bytes" => self.used_bytes());
        }

        Ok(())
    }

    /// Prunes the oldest sealed segment still holding anything non-critical.
    /// Critical records are carried forward into the active file before the
    /// segment dies; a segment reduced to critical-only data is skipped.
    fn prune_one(&mut self, now: u64) -> StoreResult<bool> {
        let mut target = None;

        for (index, seg) in self.sealed.iter().enumerate() {
            if !PRUNABLE.contains(&seg.kind) {
                continue;
            }

            let records = segment::read_records(&self.volume, &seg.name)?;
            let consumed = self.consumed.get(&seg.name).copied().unwrap_or(0) as usize;
            let pending = &records[consumed.min(records.len())..];

            let critical: Vec<Record> = pending
                .iter()
                .filter(|record| record.priority == Priority::Critical)
                .cloned()
                .collect();

            if !pending.is_empty() && critical.len() == pending.len() {
                continue;
            }

            target = Some((index, critical));
            break;
        }

        let (index, critical) = match target {
            Some(target) => target,
            None => return Ok(false),
        };

        let seg = self.sealed.remove(index);

        // Carried-forward records must be durable before the old copy dies
        for record in &critical {
            self.stage(seg.kind, record, now)?;
        }

        if !critical.is_empty() {
            self.flush(seg.kind)?;
            let active_name = self
                .active
                .get(&seg.kind)
                .map(|active| active.name.clone())
                .expect("Active file exists after staging");
            self.volume.sync(&active_name)?;
            self.stats.records_carried_forward += critical.len() as u64;
        }

        logging::info!(self.log, "pruned segment";
                       "context" => "capacity",
                       "segment" => &seg.name,
                       "carried_forward" => critical.len());

        self.volume.delete(&seg.name)?;
        let marker = segment::seal_name(&seg.name);
        if self.volume.exists(&marker) {
            self.volume.delete(&marker)?;
        }

        self.consumed.remove(&seg.name);

        // An in-flight batch drawn from the pruned segment can no longer
        // commit; the next peek rebuilds with a fresh id
        if let Some(out) = &self.outstanding {
            if out.covers.iter().any(|(name, _, _)| *name == seg.name) {
                self.outstanding = None;
            }
        }

        self.stats.segments_pruned += 1;

        Ok(true)
    }

    /// Builds (or re-serves) the next upload batch from the sealed backlog,
    /// oldest records first. Repeated peeks before `advance` return the
    /// identical batch under the identical id.
    pub fn peek(&mut self, kind: SegmentKind, max_records: usize) -> StoreResult<Option<Batch>> {
        if let Some(out) = &self.outstanding {
            if out.batch.kind == kind {
                return Ok(Some(out.batch.clone()));
            }
        }

        if max_records == 0 {
            return Ok(None);
        }

        let mut records: Vec<Record> = Vec::new();
        let mut covers: Vec<(String, u32, bool)> = Vec::new();

        for seg in self.sealed.iter().filter(|seg| seg.kind == kind) {
            if records.len() >= max_records {
                break;
            }

            let all = segment::read_records(&self.volume, &seg.name)?;
            let consumed = self.consumed.get(&seg.name).copied().unwrap_or(0) as usize;

            if consumed >= all.len() {
                covers.push((seg.name.clone(), all.len() as u32, true));
                continue;
            }

            let take = (max_records - records.len()).min(all.len() - consumed);
            records.extend_from_slice(&all[consumed..consumed + take]);

            let new_consumed = consumed + take;
            covers.push((seg.name.clone(), new_consumed as u32, new_consumed == all.len()));
        }

        if records.is_empty() {
            return Ok(None);
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        // The id is burned even if the batch never commits
        self.persist_cursor_meta()?;

        let batch = Batch {
            batch_id,
            kind,
            fingerprint: fingerprint(&records)?,
            records,
        };

        self.outstanding = Some(Outstanding {
            batch: batch.clone(),
            covers,
        });

        Ok(Some(batch))
    }

    /// Commits the acknowledged batch: cursor positions advance, fully
    /// consumed segments are deleted. Idempotent; re-advancing past a
    /// committed point is a no-op and reports false.
    pub fn advance(&mut self, batch_id: u64) -> StoreResult<bool> {
        let matches = self
            .outstanding
            .as_ref()
            .map(|out| out.batch.batch_id == batch_id)
            .unwrap_or(false);

        if !matches {
            return Ok(false);
        }

        let out = self.outstanding.take().expect("Outstanding batch checked above");

        let mut doomed = Vec::new();

        for (name, new_consumed, complete) in out.covers {
            if complete {
                self.consumed.remove(&name);
                doomed.push(name);
            } else {
                self.consumed.insert(name, new_consumed);
            }
        }

        // Positions become durable before anything is deleted, so a crash
        // in between re-offers nothing that was acknowledged
        self.persist_cursor_meta()?;

        for name in doomed {
            self.volume.delete(&name)?;

            let marker = segment::seal_name(&name);
            if self.volume.exists(&marker) {
                self.volume.delete(&marker)?;
            }

            self.sealed.retain(|seg| seg.name != name);

            logging::debug!(self.log, "acknowledged segment deleted";
                            "context" => "advance", "segment" => &name);
        }

        self.stats.batches_committed += 1;
        self.full = self.used_bytes() >= self.config.capacity_bytes;

        Ok(true)
    }

    /// Serializes a batch into the upload body: framed records, compressed
    /// as one zstd block at the configured level.
    pub fn encode_batch(&self, batch: &Batch) -> StoreResult<Vec<u8>> {
        let mut plain = Vec::new();

        for record in &batch.records {
            segment::encode_record_entry(&mut plain, record)?;
        }

        compress_block(&plain, self.config.compression_level)
    }

    fn load_cursor_meta(&mut self, now: u64) -> StoreResult<()> {
        // Fallback floor keeps ids monotonic even when the meta is lost
        let fallback = now << 16;

        if !self.volume.exists(CURSOR_META) {
            self.next_batch_id = fallback;
            return Ok(());
        }

        let data = self.volume.read(CURSOR_META)?;

        let body = match unframe(&data) {
            Unframed::Entry { body, .. } => body,
            _ => {
                logging::warn!(self.log, "cursor meta unreadable, resetting";
                               "context" => "open");
                self.next_batch_id = fallback;
                return Ok(());
            }
        };

        let mut stream = body;
        let stored = stream.read_u64::<LittleEndian>()?;
        let count = stream.read_u16::<LittleEndian>()?;

        for _ in 0..count {
            let name_len = stream.read_u16::<LittleEndian>()? as usize;

            if stream.len() < name_len + 4 {
                return Err(StoreError::Corrupt("cursor meta entry truncated"));
            }

            let name = String::from_utf8(stream[..name_len].to_vec())
                .map_err(|_| StoreError::Corrupt("cursor meta name is not utf-8"))?;
            stream = &stream[name_len..];
            let consumed = stream.read_u32::<LittleEndian>()?;

            self.consumed.insert(name, consumed);
        }

        self.next_batch_id = stored;

        Ok(())
    }

    fn persist_cursor_meta(&mut self) -> StoreResult<()> {
        let mut body = Vec::new();

        let mut id = [0u8; 8];
        LittleEndian::write_u64(&mut id, self.next_batch_id);
        body.extend_from_slice(&id);

        let mut count = [0u8; 2];
        LittleEndian::write_u16(&mut count, self.consumed.len() as u16);
        body.extend_from_slice(&count);

        let mut positions: Vec<(&String, &u32)> = self.consumed.iter().collect();
        positions.sort();

        for (name, consumed) in positions {
            let mut name_len = [0u8; 2];
            LittleEndian::write_u16(&mut name_len, name.len() as u16);
            body.extend_from_slice(&name_len);
            body.extend_from_slice(name.as_bytes());

            let mut value = [0u8; 4];
            LittleEndian::write_u32(&mut value, *consumed);
            body.extend_from_slice(&value);
        }

        let mut entry = Vec::new();
        frame_into(&mut entry, &body);

        if self.volume.exists(CURSOR_META) {
            self.volume.delete(CURSOR_META)?;
        }

        self.volume.append(CURSOR_META, &entry)?;
        self.volume.sync(CURSOR_META)?;

        Ok(())
    }
}

fn fingerprint(records: &[Record]) -> StoreResult<[u8; 32]> {
    let mut hasher = Sha256::new();

    for record in records {
        let mut body = Vec::with_capacity(record.body_size());
        record.write_body(&mut body)?;
        hasher.update(&body);
    }

    Ok(hasher.finalize().into())
}
