use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::limits::*;
use crate::model::*;
use crate::store::{AppointmentStore, AppointmentTable, StoreError};

/// Encode a single record to [len][bincode][crc32] format. Returns the bytes written.
fn encode_record(writer: &mut impl Write, record: &Appointment) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    // Replay stops at the first oversized entry, which would hide everything after it.
    if payload.len() > MAX_WAL_RECORD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record of {} bytes exceeds WAL limit", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + len as u64)
}

/// Append-only Write-Ahead Log of appointment snapshots. Last record per id wins.
///
/// Format per entry: `[u32: len][bincode: Appointment][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    synced_len: u64,
    unsynced_bytes: u64,
    unsynced_appends: u64,
}

/// Result of scanning a WAL file.
pub struct Replay {
    pub records: Vec<Appointment>,
    /// Byte length of the valid prefix.
    pub valid_len: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced_bytes: 0,
            unsynced_appends: 0,
        })
    }

    /// Append a single record and fsync. Used by tests only;
    /// production code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, record: &Appointment) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Append a single record to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, record: &Appointment) -> io::Result<()> {
        self.unsynced_bytes += encode_record(&mut self.writer, record)?;
        self.unsynced_appends += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.unsynced_bytes;
        self.appends_since_compact += self.unsynced_appends;
        self.unsynced_bytes = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Throw away everything appended since the last successful `flush_sync`,
    /// both still-buffered bytes and any the BufWriter already spilled to disk.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let spilled = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        let (file, _buffered) = spilled.into_parts();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.unsynced_bytes = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync.
    pub fn write_compact_file(path: &Path, records: &[Appointment]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced_bytes = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[Appointment]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid records in write order.
    /// Truncated/corrupt trailing entries are discarded.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay { records: Vec::new(), valid_len: 0 });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_WAL_RECORD_BYTES {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Appointment>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            valid_len += 8 + len as u64;
        }

        Ok(Replay { records, valid_len })
    }
}

// ── Group-commit writer ──────────────────────────────────

enum WalCommand {
    Append {
        record: Appointment,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Apply the batch to the table, then respond to all senders.
///
/// The table is only touched here, so it always mirrors what is durable.
async fn wal_writer_loop(mut wal: Wal, table: Arc<AppointmentTable>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            commit_batch(&mut wal, &table, &mut batch);
                            handle_non_append(&mut wal, &table, other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                if !batch.is_empty() {
                    commit_batch(&mut wal, &table, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, &table, other),
        }
    }
}

fn commit_batch(
    wal: &mut Wal,
    table: &AppointmentTable,
    batch: &mut Vec<(Appointment, oneshot::Sender<io::Result<()>>)>,
) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if result.is_ok() {
        for (record, _) in batch.iter() {
            table.upsert(record.clone());
        }
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Appointment, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        // Every caller in the batch is told it failed, so none of it may replay.
        if let Err(undo) = wal.discard_unsynced() {
            error!("cannot discard failed batch in {}: {undo}", wal.path().display());
        }
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, table: &AppointmentTable, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let records = table.snapshot();
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file())
                .map(|()| records.len());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Durable appointment store: an in-memory table fronted by a group-commit WAL.
///
/// Must be opened inside a Tokio runtime; the writer runs as a spawned task and
/// stops when the store is dropped.
pub struct WalStore {
    table: Arc<AppointmentTable>,
    tx: mpsc::Sender<WalCommand>,
    path: PathBuf,
}

impl WalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let replay = Wal::replay(&path)?;
        if let Ok(meta) = fs::metadata(&path)
            && meta.len() > replay.valid_len
        {
            warn!(
                "discarding {} trailing bytes of {}",
                meta.len() - replay.valid_len,
                path.display()
            );
            OpenOptions::new().write(true).open(&path)?.set_len(replay.valid_len)?;
        }

        let table = Arc::new(AppointmentTable::new());
        let replayed = replay.records.len();
        for record in replay.records {
            table.upsert(record);
        }
        info!(
            "opened {}: {replayed} records, {} appointments",
            path.display(),
            table.len()
        );

        let wal = Wal::open(&path)?;
        let (tx, rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, table.clone(), rx));
        Ok(Self { table, tx, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    async fn append(&self, record: &Appointment) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)??;
        Ok(())
    }

    /// Rewrite the log as one record per appointment. Returns the record count.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        Ok(rx.await.map_err(|_| StoreError::Closed)??)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl AppointmentStore for WalStore {
    async fn load(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError> {
        Ok(self.table.get(&id))
    }

    async fn save(&self, appointment: &Appointment) -> Result<(), StoreError> {
        self.append(appointment).await
    }

    async fn list_active_by_resource(
        &self,
        resource: &ResourceKey,
    ) -> Result<Vec<Appointment>, StoreError> {
        Ok(self.table.active_by_resource(resource))
    }

    async fn resource_keys(&self) -> Result<Vec<ResourceKey>, StoreError> {
        Ok(self.table.resource_keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("petcare_scheduler_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn record(h: u32, status: AppointmentStatus) -> Appointment {
        let at = NaiveDate::from_ymd_opt(2025, 6, 2)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap();
        Appointment {
            id: Ulid::new(),
            resource_key: "svc-1".into(),
            scheduled_at: at,
            status,
            payload: AppointmentPayload {
                client_ref: "client-1".into(),
                service_ref: "svc-1".into(),
                ..Default::default()
            },
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let records = vec![
            record(10, AppointmentStatus::Scheduled),
            record(11, AppointmentStatus::Cancelled),
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, records);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let r = record(10, AppointmentStatus::Scheduled);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&r).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, vec![r]);
        assert_eq!(replay.valid_len, good_len);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&record(10, AppointmentStatus::Scheduled)).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.records.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let mut r = record(10, AppointmentStatus::Scheduled);
        let mut wal = Wal::open(&path).unwrap();
        for h in [11, 12, 13] {
            r.scheduled_at = r.scheduled_at.date().and_hms_opt(h, 0, 0).unwrap();
            wal.append(&r).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        wal.compact(std::slice::from_ref(&r)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let other = record(15, AppointmentStatus::Scheduled);
        wal.append(&other).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, vec![r, other]);

        let _ = fs::remove_file(&path);
    }

    fn oversized(h: u32) -> Appointment {
        let mut r = record(h, AppointmentStatus::Scheduled);
        r.payload.notes = Some("x".repeat(MAX_WAL_RECORD_BYTES));
        r
    }

    #[test]
    fn oversized_record_rejected_on_write() {
        let path = tmp_path("oversized.wal");
        let _ = fs::remove_file(&path);

        let mut wal = Wal::open(&path).unwrap();
        let err = wal.append(&oversized(10)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn failed_batch_leaves_nothing_to_replay() {
        let path = tmp_path("failed_batch.wal");
        let _ = fs::remove_file(&path);

        let kept = record(10, AppointmentStatus::Scheduled);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        // Large enough to spill past the BufWriter before the bad record is seen.
        let mut spilled = record(11, AppointmentStatus::Scheduled);
        spilled.payload.notes = Some("y".repeat(64 * 1024));
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let batch = vec![(spilled, tx1), (oversized(12), tx2)];

        assert!(flush_batch(&mut wal, &batch).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        assert_eq!(wal.appends_since_compact(), 1);

        let after = record(13, AppointmentStatus::Scheduled);
        wal.append(&after).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, vec![kept, after]);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn rejected_save_does_not_survive_reopen() {
        let path = tmp_path("store_rejected.wal");
        let _ = fs::remove_file(&path);

        let a = record(10, AppointmentStatus::Scheduled);
        let big = oversized(11);
        {
            let store = WalStore::open(&path).unwrap();
            store.save(&a).await.unwrap();
            assert!(matches!(store.save(&big).await, Err(StoreError::Io(_))));
            assert!(store.load(big.id).await.unwrap().is_none());
        }

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.load(big.id).await.unwrap().is_none());
        assert_eq!(store.appends_since_compact().await, 0);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let path = tmp_path("store_reopen.wal");
        let _ = fs::remove_file(&path);

        let mut a = record(10, AppointmentStatus::Scheduled);
        let b = record(11, AppointmentStatus::Scheduled);
        {
            let store = WalStore::open(&path).unwrap();
            store.save(&a).await.unwrap();
            store.save(&b).await.unwrap();
            a.status = AppointmentStatus::Completed;
            store.save(&a).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 3);
        }

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.load(a.id).await.unwrap().unwrap().status, AppointmentStatus::Completed);
        let active = store.list_active_by_resource(&"svc-1".into()).await.unwrap();
        assert_eq!(active, vec![b]);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn store_truncates_garbage_tail_on_open() {
        let path = tmp_path("store_tail.wal");
        let _ = fs::remove_file(&path);

        let a = record(10, AppointmentStatus::Scheduled);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&a).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 5]).unwrap();
        }

        let b = record(11, AppointmentStatus::Scheduled);
        {
            let store = WalStore::open(&path).unwrap();
            store.save(&b).await.unwrap();
        }

        // Without truncation the new record would sit behind the garbage and be lost.
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, vec![a, b]);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn store_compaction_keeps_latest() {
        let path = tmp_path("store_compact.wal");
        let _ = fs::remove_file(&path);

        let mut a = record(10, AppointmentStatus::Scheduled);
        {
            let store = WalStore::open(&path).unwrap();
            for h in [11, 12, 13, 14] {
                a.scheduled_at = a.scheduled_at.date().and_hms_opt(h, 0, 0).unwrap();
                store.save(&a).await.unwrap();
            }
            assert_eq!(store.compact().await.unwrap(), 1);
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, vec![a]);

        let _ = fs::remove_file(&path);
    }
}
