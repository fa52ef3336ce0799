//! The crash-safe, single-writer record store for one replica.
//!
//! A [FileLog] is an append-only file of framed records plus an
//! in-memory index.  Every record is `len(u32) || checksum(u32) ||
//! position(u64) || ballot(u64, u64) || tag(u8) || payload`.  A
//! trailing record that is too short to have been fully written is
//! discarded on recovery; a complete record whose checksum fails is
//! never silently healed — [FileLog::open] aborts the process.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use biometrics::Counter;

use synod_pb::{Accepted, Ballot, Entry, EntryKind, Position};

use zerror_core::ErrorCore;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static RECORDS_WRITTEN: Counter = Counter::new("synod.storage.records_written");
static RECORDS_FSYNCED: Counter = Counter::new("synod.storage.records_fsynced");
static RECORDS_SKIPPED_IDEMPOTENT: Counter = Counter::new("synod.storage.records_skipped");
static RECOVERY_RECORDS_APPLIED: Counter = Counter::new("synod.storage.recovery.records_applied");
static RECOVERY_TRAILING_PARTIAL_DISCARDED: Counter =
    Counter::new("synod.storage.recovery.trailing_partial_discarded");
static COMPACTIONS: Counter = Counter::new("synod.storage.compactions");

/// Register this crate's biometrics with `collector`.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&RECORDS_WRITTEN);
    collector.register_counter(&RECORDS_FSYNCED);
    collector.register_counter(&RECORDS_SKIPPED_IDEMPOTENT);
    collector.register_counter(&RECOVERY_RECORDS_APPLIED);
    collector.register_counter(&RECOVERY_TRAILING_PARTIAL_DISCARDED);
    collector.register_counter(&COMPACTIONS);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

const TAG_APPEND: u8 = 1;
const TAG_TRUNCATE: u8 = 2;
const TAG_NOP: u8 = 3;
const TAG_PROMISE_ONLY: u8 = 4;
const TAG_COMPACTION_MARKER: u8 = 5;

const FRAME_PREFIX: usize = 4 /* len */ + 4 /* checksum */;
const BODY_FIXED_PREFIX: usize = 8 /* position */ + 8 /* proposal_number */ + 8 /* proposer */ + 1 /* tag */;

/// Records below this many reclaimable bytes are left in place; a
/// truncate that reclaims more than this triggers a compaction.
pub const COMPACTION_THRESHOLD: u64 = 1 << 20;

///////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(zerror_derive::Z)]
pub enum Error {
    Truncated {
        core: ErrorCore,
        begin: Position,
    },
    NotYetLearned {
        core: ErrorCore,
        end: Position,
    },
    Io {
        core: ErrorCore,
        what: String,
    },
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Self {
        Error::Io {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

///////////////////////////////////////////// SlotInfo /////////////////////////////////////////////

#[derive(Clone, Debug)]
struct SlotInfo {
    offset: u64,
    framed_len: u64,
    accepted: Accepted,
}

////////////////////////////////////////////// Snapshot /////////////////////////////////////////////

/// A cheap, in-memory view of a replica's durable state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Snapshot {
    pub begin: Position,
    pub end: Position,
    pub promised: Ballot,
}

////////////////////////////////////////////// FileLog /////////////////////////////////////////////

/// The durable, crash-safe store for one replica.
///
/// `FileLog` is exclusively owned by the `Replica` actor that opens it;
/// all disk writes serialize through whatever thread drives that actor.
pub struct FileLog {
    path: PathBuf,
    file: File,
    write_offset: u64,
    slots: BTreeMap<u64, SlotInfo>,
    begin: Position,
    end: Position,
    promised: Ballot,
    stale_bytes: u64,
}

impl FileLog {
    /// Open (creating if necessary) the backing file at `path` and
    /// recover its state by scanning forward.  Aborts the process if a
    /// complete record fails its checksum.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut log = FileLog {
            path,
            file: file.try_clone()?,
            write_offset: 0,
            slots: BTreeMap::new(),
            begin: Position::BEFORE_BEGINNING,
            end: Position::BEFORE_BEGINNING,
            promised: Ballot::BOTTOM,
            stale_bytes: 0,
        };
        log.recover(&mut file)?;
        Ok(log)
    }

    fn recover(&mut self, file: &mut File) -> Result<(), Error> {
        file.seek(SeekFrom::Start(0))?;
        let mut offset: u64 = 0;
        loop {
            let mut len_buf = [0u8; 4];
            match read_exact_or_eof(file, &mut len_buf)? {
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => {
                    RECOVERY_TRAILING_PARTIAL_DISCARDED.click();
                    break;
                }
                ReadOutcome::Full => {}
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len < 4 + BODY_FIXED_PREFIX {
                // A well-formed record is never this short; treat as a
                // torn write at the tail rather than trust it.
                RECOVERY_TRAILING_PARTIAL_DISCARDED.click();
                break;
            }
            let mut body = vec![0u8; len];
            match read_exact_or_eof(file, &mut body)? {
                ReadOutcome::Full => {}
                ReadOutcome::Eof | ReadOutcome::Partial => {
                    RECOVERY_TRAILING_PARTIAL_DISCARDED.click();
                    break;
                }
            }
            let checksum = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            let payload_region = &body[4..];
            let computed = crc32c::crc32c(payload_region);
            if checksum != computed {
                eprintln!(
                    "synod_storage: checksum mismatch recovering {:?} at offset {}: stored {:08x}, computed {:08x}",
                    self.path, offset, checksum, computed
                );
                std::process::abort();
            }
            let record_len = (4 + len) as u64;
            self.apply_recovered_record(payload_region, offset, record_len);
            RECOVERY_RECORDS_APPLIED.click();
            offset += record_len;
        }
        self.write_offset = offset;
        Ok(())
    }

    fn apply_recovered_record(&mut self, body: &[u8], offset: u64, framed_len: u64) {
        let position = Position::new(u64::from_be_bytes(body[0..8].try_into().unwrap()));
        let proposal_number = u64::from_be_bytes(body[8..16].try_into().unwrap());
        let proposer = synod_pb::ReplicaId::new(u64::from_be_bytes(body[16..24].try_into().unwrap()));
        let ballot = Ballot::new(proposal_number, proposer);
        let tag = body[24];
        let payload = &body[25..];
        match tag {
            TAG_PROMISE_ONLY => {
                self.promised = ballot.max(self.promised);
            }
            TAG_COMPACTION_MARKER => {
                let begin = Position::new(u64::from_be_bytes(payload[0..8].try_into().unwrap()));
                self.begin = begin;
                self.promised = ballot.max(self.promised);
                self.slots.retain(|p, _| *p >= begin.value);
                self.stale_bytes = 0;
            }
            TAG_APPEND | TAG_TRUNCATE | TAG_NOP => {
                let kind = decode_kind(tag, payload);
                let learned = true; // compaction only ever keeps learned state on disk for Append/Truncate/Nop tags written by write()
                self.install_slot(position, ballot, kind, learned, offset, framed_len);
            }
            _ => {
                eprintln!("synod_storage: unknown record tag {tag} in {:?}", self.path);
                std::process::abort();
            }
        }
    }

    fn install_slot(
        &mut self,
        position: Position,
        ballot: Ballot,
        kind: EntryKind,
        learned: bool,
        offset: u64,
        framed_len: u64,
    ) {
        if let EntryKind::Truncate { to } = &kind {
            if learned {
                self.begin = self.begin.max(*to);
            }
        }
        if learned {
            self.end = self.end.max(position);
        }
        self.slots.insert(
            position.value,
            SlotInfo {
                offset,
                framed_len,
                accepted: Accepted {
                    ballot,
                    kind,
                    learned,
                },
            },
        );
    }

    /// Records a new promised ballot.  Durable (fsynced) before return.
    pub fn persist_metadata(&mut self, promised: Ballot) -> Result<(), Error> {
        let record = encode_record(Position::BEFORE_BEGINNING, promised, TAG_PROMISE_ONLY, &[]);
        self.append_and_sync(&record)?;
        self.promised = promised;
        Ok(())
    }

    /// Idempotent upsert of a slot's record.  Returns `Ok(())` whether
    /// or not the call actually changed anything on disk.
    pub fn write(
        &mut self,
        position: Position,
        ballot: Ballot,
        kind: EntryKind,
        learned: bool,
    ) -> Result<(), Error> {
        let was_learned = self
            .slots
            .get(&position.value)
            .map(|s| s.accepted.learned)
            .unwrap_or(false);
        if let Some(existing) = self.slots.get(&position.value) {
            if existing.accepted.ballot == ballot
                && existing.accepted.kind == kind
                && existing.accepted.learned == learned
            {
                RECORDS_SKIPPED_IDEMPOTENT.click();
                return Ok(());
            }
        }
        // Learned is final: once a slot is learned, never write it back
        // as unlearned, even under a higher ballot.
        if was_learned && !learned {
            RECORDS_SKIPPED_IDEMPOTENT.click();
            return Ok(());
        }
        let tag = kind.tag();
        let payload = encode_kind_payload(&kind);
        let record = encode_record(position, ballot, tag, &payload);
        let offset = self.write_offset;
        let framed_len = record.len() as u64;
        if learned && !was_learned {
            self.append_and_sync(&record)?;
        } else {
            self.append(&record)?;
        }
        if let Some(old) = self.slots.get(&position.value) {
            if old.accepted.learned {
                self.stale_bytes = self.stale_bytes.saturating_add(old.framed_len);
            }
        }
        self.install_slot(position, ballot, kind, learned, offset, framed_len);
        RECORDS_WRITTEN.click();
        Ok(())
    }

    fn append(&mut self, record: &[u8]) -> Result<(), Error> {
        self.file.write_all(record)?;
        self.write_offset += record.len() as u64;
        Ok(())
    }

    fn append_and_sync(&mut self, record: &[u8]) -> Result<(), Error> {
        self.append(record)?;
        self.file.sync_data()?;
        RECORDS_FSYNCED.click();
        Ok(())
    }

    /// The slot record for `position`, if any (learned or not).
    pub fn slot(&self, position: Position) -> Option<Accepted> {
        self.slots.get(&position.value).map(|s| s.accepted.clone())
    }

    /// All learned entries in `[from, to]`, sorted by position.
    pub fn read(&self, from: Position, to: Position) -> Result<Vec<Entry>, Error> {
        if from.value > 0 && from.value < self.begin.value {
            return Err(Error::Truncated {
                core: ErrorCore::default(),
                begin: self.begin,
            });
        }
        if to.value > self.end.value {
            return Err(Error::NotYetLearned {
                core: ErrorCore::default(),
                end: self.end,
            });
        }
        let mut out = Vec::new();
        for (&pos, slot) in self.slots.range(from.value..=to.value) {
            if slot.accepted.learned {
                out.push(Entry {
                    position: Position::new(pos),
                    kind: slot.accepted.kind.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Reclaims storage strictly below `to` and durably advances
    /// `begin`.  Triggers compaction once enough bytes are reclaimable.
    pub fn truncate_prefix(&mut self, to: Position) -> Result<(), Error> {
        if to.value <= self.begin.value {
            return Ok(());
        }
        let stale: Vec<u64> = self
            .slots
            .range(..to.value)
            .map(|(&p, _)| p)
            .collect();
        for pos in stale {
            if let Some(slot) = self.slots.remove(&pos) {
                if slot.accepted.learned {
                    self.stale_bytes = self.stale_bytes.saturating_add(slot.framed_len);
                }
            }
        }
        self.begin = to;
        if self.stale_bytes >= COMPACTION_THRESHOLD {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrites the backing file to contain only records at or after
    /// `begin`, preceded by a [TAG_COMPACTION_MARKER] record so
    /// recovery need not rescan discarded history.
    pub fn compact(&mut self) -> Result<(), Error> {
        let tmp_path = self.path.with_extension("compact.tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let marker_payload = self.begin.value.to_be_bytes();
        let marker = encode_record(
            Position::BEFORE_BEGINNING,
            self.promised,
            TAG_COMPACTION_MARKER,
            &marker_payload,
        );
        tmp.write_all(&marker)?;
        let mut offset = marker.len() as u64;

        let mut rewritten = BTreeMap::new();
        for (&pos, slot) in self.slots.iter() {
            let payload = encode_kind_payload(&slot.accepted.kind);
            let record = encode_record(
                Position::new(pos),
                slot.accepted.ballot,
                slot.accepted.kind.tag(),
                &payload,
            );
            let framed_len = record.len() as u64;
            tmp.write_all(&record)?;
            rewritten.insert(
                pos,
                SlotInfo {
                    offset,
                    framed_len,
                    accepted: slot.accepted.clone(),
                },
            );
            offset += framed_len;
        }
        tmp.sync_data()?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.slots = rewritten;
        self.write_offset = offset;
        self.stale_bytes = 0;
        COMPACTIONS.click();
        Ok(())
    }

    /// A cheap, in-memory snapshot of `(begin, end, promised)`.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            begin: self.begin,
            end: self.end,
            promised: self.promised,
        }
    }
}

///////////////////////////////////////// record encoding //////////////////////////////////////////

fn encode_kind_payload(kind: &EntryKind) -> Vec<u8> {
    match kind {
        EntryKind::Nop => Vec::new(),
        EntryKind::Append { payload } => payload.clone(),
        EntryKind::Truncate { to } => to.value.to_be_bytes().to_vec(),
    }
}

fn decode_kind(tag: u8, payload: &[u8]) -> EntryKind {
    match tag {
        TAG_APPEND => EntryKind::Append {
            payload: payload.to_vec(),
        },
        TAG_TRUNCATE => EntryKind::Truncate {
            to: Position::new(u64::from_be_bytes(payload[0..8].try_into().unwrap())),
        },
        TAG_NOP => EntryKind::Nop,
        _ => unreachable!("decode_kind only called for entry tags"),
    }
}

fn encode_record(position: Position, ballot: Ballot, tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(BODY_FIXED_PREFIX + payload.len());
    body.extend_from_slice(&position.value.to_be_bytes());
    body.extend_from_slice(&ballot.proposal_number.to_be_bytes());
    body.extend_from_slice(&ballot.proposer.value.to_be_bytes());
    body.push(tag);
    body.extend_from_slice(payload);

    let checksum = crc32c::crc32c(&body);
    let len = (4 + body.len()) as u32;

    let mut out = Vec::with_capacity(FRAME_PREFIX + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&checksum.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<ReadOutcome, Error> {
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            return Ok(if read == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        read += n;
    }
    Ok(ReadOutcome::Full)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use synod_pb::ReplicaId;

    fn ballot(n: u64) -> Ballot {
        Ballot::new(n, ReplicaId::new(1))
    }

    #[test]
    fn write_then_read_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut log = FileLog::open(&path).unwrap();
        log.write(
            Position::new(1),
            ballot(1),
            EntryKind::Append {
                payload: b"a".to_vec(),
            },
            true,
        )
        .unwrap();
        log.write(
            Position::new(2),
            ballot(1),
            EntryKind::Append {
                payload: b"b".to_vec(),
            },
            true,
        )
        .unwrap();
        let entries = log.read(Position::new(1), Position::new(2)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].position, Position::new(1));
        assert_eq!(
            entries[0].kind,
            EntryKind::Append {
                payload: b"a".to_vec()
            }
        );
    }

    #[test]
    fn read_below_begin_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut log = FileLog::open(&path).unwrap();
        log.write(
            Position::new(1),
            ballot(1),
            EntryKind::Append {
                payload: b"a".to_vec(),
            },
            true,
        )
        .unwrap();
        log.write(
            Position::new(2),
            ballot(1),
            EntryKind::Truncate {
                to: Position::new(2),
            },
            true,
        )
        .unwrap();
        match log.read(Position::new(1), Position::new(2)) {
            Err(Error::Truncated { begin, .. }) => assert_eq!(begin, Position::new(2)),
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn read_above_end_is_not_yet_learned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let log = FileLog::open(&path).unwrap();
        match log.read(Position::new(1), Position::new(1)) {
            Err(Error::NotYetLearned { end, .. }) => assert_eq!(end, Position::BEFORE_BEGINNING),
            other => panic!("expected NotYetLearned, got {other:?}"),
        }
    }

    #[test]
    fn recovery_round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let mut log = FileLog::open(&path).unwrap();
            log.persist_metadata(ballot(7)).unwrap();
            log.write(
                Position::new(1),
                ballot(7),
                EntryKind::Append {
                    payload: b"hello".to_vec(),
                },
                true,
            )
            .unwrap();
        }
        let log = FileLog::open(&path).unwrap();
        let snap = log.snapshot();
        assert_eq!(snap.promised, ballot(7));
        assert_eq!(snap.end, Position::new(1));
        let entries = log.read(Position::new(1), Position::new(1)).unwrap();
        assert_eq!(
            entries[0].kind,
            EntryKind::Append {
                payload: b"hello".to_vec()
            }
        );
    }

    #[test]
    fn trailing_partial_write_is_discarded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let mut log = FileLog::open(&path).unwrap();
            log.write(
                Position::new(1),
                ballot(1),
                EntryKind::Append {
                    payload: b"a".to_vec(),
                },
                true,
            )
            .unwrap();
        }
        // Simulate a torn write: append a truncated frame header.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 0, 100]).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.snapshot().end, Position::new(1));
    }

    #[test]
    fn idempotent_write_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut log = FileLog::open(&path).unwrap();
        let kind = EntryKind::Append {
            payload: b"a".to_vec(),
        };
        log.write(Position::new(1), ballot(1), kind.clone(), true)
            .unwrap();
        let offset_before = log.write_offset;
        log.write(Position::new(1), ballot(1), kind, true).unwrap();
        assert_eq!(offset_before, log.write_offset);
    }

    #[test]
    fn truncate_prefix_advances_begin_and_triggers_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut log = FileLog::open(&path).unwrap();
        for i in 1..=4u64 {
            log.write(
                Position::new(i),
                ballot(1),
                EntryKind::Append {
                    payload: vec![0u8; 16],
                },
                true,
            )
            .unwrap();
        }
        log.stale_bytes = COMPACTION_THRESHOLD; // force compaction path
        log.truncate_prefix(Position::new(3)).unwrap();
        assert_eq!(log.snapshot().begin, Position::new(3));
        assert!(log.read(Position::new(1), Position::new(2)).is_err());
        let entries = log.read(Position::new(3), Position::new(4)).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
