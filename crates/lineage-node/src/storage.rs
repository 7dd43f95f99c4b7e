//! RocksDB-backed persistent ledger storage.
//!
//! Implements [`PersonStore`] and [`ObligationRepository`] using RocksDB
//! column families for people, edges, runs, obligation records, payments,
//! and their secondary indexes. Every mutation is a single atomic
//! [`WriteBatch`]. Mutations that must read before writing (run claims,
//! finishes and voids, record inserts, payment commits) additionally hold a
//! store-wide mutex so that check and write cannot interleave.

use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, SliceTransform, WriteBatch, DB};

use lineage_core::error::StorageError;
use lineage_core::traits::{ObligationRepository, PersonStore, RunClaim};
use lineage_core::types::{
    DistributionRun, ObligationKind, ObligationRecord, PaymentCommit, PaymentId, PaymentRecord,
    PersonId, RecordKey, RunId, RunStatus,
};

// --- Column family names ---

const CF_PEOPLE: &str = "people";
const CF_EDGES: &str = "edges";
const CF_RUNS: &str = "runs";
const CF_ROOT_RUNS: &str = "root_runs";
const CF_RECORDS: &str = "records";
const CF_PERSON_RECORDS: &str = "person_records";
const CF_PAYMENTS: &str = "payments";
const CF_PERSON_PAYMENTS: &str = "person_payments";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_PEOPLE,
    CF_EDGES,
    CF_RUNS,
    CF_ROOT_RUNS,
    CF_RECORDS,
    CF_PERSON_RECORDS,
    CF_PAYMENTS,
    CF_PERSON_PAYMENTS,
    CF_METADATA,
];

// --- Metadata keys ---

const META_SCHEMA_VERSION: &[u8] = b"schema_version";
const META_RECORD_COUNT: &[u8] = b"record_count";
const META_PAYMENT_COUNT: &[u8] = b"payment_count";

const SCHEMA_VERSION: u64 = 1;

/// Fixed prefix length used by each indexed column family.
fn prefix_len(cf_name: &str) -> Option<usize> {
    match cf_name {
        CF_EDGES => Some(8),
        CF_ROOT_RUNS => Some(9),
        CF_RECORDS => Some(32),
        CF_PERSON_RECORDS => Some(9),
        CF_PERSON_PAYMENTS => Some(8),
        _ => None,
    }
}

fn backend(e: rocksdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::Codec(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StorageError::Codec(e.to_string()))
}

/// RocksDB-backed ledger storage.
pub struct RocksStore {
    db: DB,
    /// Serialises read-check-write mutations.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist and stamps the
    /// schema version on first open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                if let Some(len) = prefix_len(name) {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(len));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(backend)?;
        let store = Self {
            db,
            write_lock: Mutex::new(()),
        };

        let cf_meta = store.cf_handle(CF_METADATA)?;
        if store.db.get_cf(cf_meta, META_SCHEMA_VERSION).map_err(backend)?.is_none() {
            store
                .db
                .put_cf(cf_meta, META_SCHEMA_VERSION, SCHEMA_VERSION.to_le_bytes())
                .map_err(backend)?;
        }
        Ok(store)
    }

    /// Register a person. Returns `false` if already known.
    pub fn add_person(&self, id: PersonId) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock();
        if self.person_exists(id)? {
            return Ok(false);
        }
        let cf = self.cf_handle(CF_PEOPLE)?;
        self.db.put_cf(cf, id.to_be_bytes(), b"").map_err(backend)?;
        Ok(true)
    }

    /// Add a parent→child edge, registering both ends. Repeated edges
    /// collapse onto the same key.
    pub fn add_edge(&self, parent: PersonId, child: PersonId) -> Result<(), StorageError> {
        let cf_people = self.cf_handle(CF_PEOPLE)?;
        let cf_edges = self.cf_handle(CF_EDGES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_people, parent.to_be_bytes(), b"");
        batch.put_cf(cf_people, child.to_be_bytes(), b"");
        batch.put_cf(cf_edges, Self::edge_key(parent, child), b"");
        self.db.write(batch).map_err(backend)
    }

    /// Total obligation records stored, across all runs.
    pub fn record_count(&self) -> Result<u64, StorageError> {
        self.get_meta_u64(META_RECORD_COUNT)
    }

    /// Total payments stored.
    pub fn payment_count(&self) -> Result<u64, StorageError> {
        self.get_meta_u64(META_PAYMENT_COUNT)
    }

    pub fn schema_version(&self) -> Result<u64, StorageError> {
        self.get_meta_u64(META_SCHEMA_VERSION)
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            self.db.flush_cf(cf).map_err(backend)?;
        }
        Ok(())
    }

    /// Trigger manual compaction across all column families.
    pub fn compact(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    // --- Private helpers ---

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::MissingColumnFamily(name.to_string()))
    }

    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, StorageError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, key).map_err(backend)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Codec("invalid metadata length".into()))?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// `parent(BE) || child(BE)`.
    fn edge_key(parent: PersonId, child: PersonId) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[0..8].copy_from_slice(&parent.to_be_bytes());
        key[8..16].copy_from_slice(&child.to_be_bytes());
        key
    }

    /// `root(BE) || kind || sequence(BE)`.
    fn root_run_key(root_id: PersonId, kind: ObligationKind, sequence: u32) -> [u8; 13] {
        let mut key = [0u8; 13];
        key[0..8].copy_from_slice(&root_id.to_be_bytes());
        key[8] = kind.tag();
        key[9..13].copy_from_slice(&sequence.to_be_bytes());
        key
    }

    /// `kind || descendant(BE)`, the prefix of a person's record index.
    fn person_records_prefix(person: PersonId, kind: ObligationKind) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = kind.tag();
        key[1..9].copy_from_slice(&person.to_be_bytes());
        key
    }

    fn person_record_key(record: &ObligationRecord) -> Vec<u8> {
        let mut key = Self::person_records_prefix(record.descendant_id, record.kind).to_vec();
        key.extend_from_slice(&record.key().encode());
        key
    }

    /// `person(BE) || timestamp(sortable BE) || payment_id`.
    fn person_payment_key(person: PersonId, timestamp: i64, payment_id: &PaymentId) -> [u8; 48] {
        let mut key = [0u8; 48];
        key[0..8].copy_from_slice(&person.to_be_bytes());
        // Flip the sign bit so negative timestamps sort before positive ones.
        key[8..16].copy_from_slice(&((timestamp as u64) ^ (1 << 63)).to_be_bytes());
        key[16..48].copy_from_slice(payment_id.as_bytes());
        key
    }

    /// All `(key, value)` pairs in `cf_name` whose key starts with `prefix`.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StorageError> {
        let cf = self.cf_handle(cf_name)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(backend)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    /// Overwrite a run row. Callers hold `write_lock`.
    fn put_run(&self, run: &DistributionRun) -> Result<(), StorageError> {
        let cf = self.cf_handle(CF_RUNS)?;
        self.db
            .put_cf(cf, run.run_id.as_bytes(), encode(run)?)
            .map_err(backend)
    }

    fn load_record(&self, key_bytes: &[u8]) -> Result<Option<ObligationRecord>, StorageError> {
        let cf = self.cf_handle(CF_RECORDS)?;
        self.db
            .get_cf(cf, key_bytes)
            .map_err(backend)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

impl PersonStore for RocksStore {
    fn person_exists(&self, id: PersonId) -> Result<bool, StorageError> {
        let cf = self.cf_handle(CF_PEOPLE)?;
        Ok(self.db.get_cf(cf, id.to_be_bytes()).map_err(backend)?.is_some())
    }

    fn children(&self, id: PersonId) -> Result<Vec<PersonId>, StorageError> {
        self.scan_prefix(CF_EDGES, &id.to_be_bytes())?
            .into_iter()
            .map(|(key, _)| {
                let raw: [u8; 8] = key
                    .get(8..16)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| StorageError::Codec("invalid edge key".into()))?;
                Ok(PersonId(u64::from_be_bytes(raw)))
            })
            .collect()
    }
}

impl ObligationRepository for RocksStore {
    fn claim_run(&self, candidate: &DistributionRun) -> Result<RunClaim, StorageError> {
        let _guard = self.write_lock.lock();
        let runs = self.runs_for_root(candidate.root_id, candidate.kind)?;
        if let Some(active) = runs.into_iter().rev().find(DistributionRun::is_active) {
            return Ok(RunClaim::Existing(active));
        }

        let cf_runs = self.cf_handle(CF_RUNS)?;
        let cf_root_runs = self.cf_handle(CF_ROOT_RUNS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_runs, candidate.run_id.as_bytes(), encode(candidate)?);
        batch.put_cf(
            cf_root_runs,
            Self::root_run_key(candidate.root_id, candidate.kind, candidate.sequence),
            candidate.run_id.as_bytes(),
        );
        self.db.write(batch).map_err(backend)?;
        Ok(RunClaim::Created(candidate.clone()))
    }

    fn finish_run(&self, run: &DistributionRun) -> Result<DistributionRun, StorageError> {
        let _guard = self.write_lock.lock();
        let mut stored = self
            .get_run(&run.run_id)?
            .ok_or_else(|| StorageError::RecordNotFound(format!("run {}", run.run_id)))?;
        if stored.status == RunStatus::Voided {
            return Ok(stored);
        }
        stored.finish_from(run);
        self.put_run(&stored)?;
        Ok(stored)
    }

    fn void_run(&self, run_id: &RunId) -> Result<Option<DistributionRun>, StorageError> {
        let _guard = self.write_lock.lock();
        let Some(mut stored) = self.get_run(run_id)? else {
            return Ok(None);
        };
        if stored.status != RunStatus::Voided {
            stored.status = RunStatus::Voided;
            self.put_run(&stored)?;
        }
        Ok(Some(stored))
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<DistributionRun>, StorageError> {
        let cf = self.cf_handle(CF_RUNS)?;
        self.db
            .get_cf(cf, run_id.as_bytes())
            .map_err(backend)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn runs_for_root(
        &self,
        root_id: PersonId,
        kind: ObligationKind,
    ) -> Result<Vec<DistributionRun>, StorageError> {
        let mut prefix = [0u8; 9];
        prefix[0..8].copy_from_slice(&root_id.to_be_bytes());
        prefix[8] = kind.tag();

        let mut runs = Vec::new();
        for (_, value) in self.scan_prefix(CF_ROOT_RUNS, &prefix)? {
            let raw: [u8; 32] = value
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Codec("invalid run id in root index".into()))?;
            let run_id = RunId(raw);
            let run = self
                .get_run(&run_id)?
                .ok_or_else(|| StorageError::RecordNotFound(format!("run {run_id}")))?;
            runs.push(run);
        }
        Ok(runs)
    }

    fn insert_records_if_absent(&self, records: &[ObligationRecord]) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock();
        let cf_records = self.cf_handle(CF_RECORDS)?;
        let cf_person = self.cf_handle(CF_PERSON_RECORDS)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        let mut inserted = 0usize;
        for record in records {
            let key = record.key().encode();
            if self.db.get_cf(cf_records, key).map_err(backend)?.is_some() {
                continue;
            }
            batch.put_cf(cf_records, key, encode(record)?);
            batch.put_cf(cf_person, Self::person_record_key(record), b"");
            inserted += 1;
        }
        if inserted == 0 {
            return Ok(0);
        }
        let total = self.get_meta_u64(META_RECORD_COUNT)? + inserted as u64;
        batch.put_cf(cf_meta, META_RECORD_COUNT, total.to_le_bytes());
        self.db.write(batch).map_err(backend)?;
        Ok(inserted)
    }

    fn get_record(&self, key: &RecordKey) -> Result<Option<ObligationRecord>, StorageError> {
        self.load_record(&key.encode())
    }

    fn records_for_run(&self, run_id: &RunId) -> Result<Vec<ObligationRecord>, StorageError> {
        self.scan_prefix(CF_RECORDS, run_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    fn records_for_person(
        &self,
        person: PersonId,
        kind: ObligationKind,
    ) -> Result<Vec<ObligationRecord>, StorageError> {
        let prefix = Self::person_records_prefix(person, kind);
        let mut records = Vec::new();
        for (key, _) in self.scan_prefix(CF_PERSON_RECORDS, &prefix)? {
            let record_key = &key[prefix.len()..];
            let record = self
                .load_record(record_key)?
                .ok_or_else(|| StorageError::RecordNotFound(hex::encode(record_key)))?;
            records.push(record);
        }
        Ok(records)
    }

    fn commit_payment(&self, commit: &PaymentCommit) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let payment = &commit.payment;
        if self.get_payment(&payment.payment_id)?.is_some() {
            return Err(StorageError::DuplicatePayment(payment.external_ref.clone()));
        }

        let cf_records = self.cf_handle(CF_RECORDS)?;
        let cf_payments = self.cf_handle(CF_PAYMENTS)?;
        let cf_person = self.cf_handle(CF_PERSON_PAYMENTS)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;
        let mut batch = WriteBatch::default();

        for update in &commit.updates {
            let key = update.key.encode();
            let mut record = self
                .load_record(&key)?
                .ok_or_else(|| StorageError::RecordNotFound(update.key.to_string()))?;
            let run_active = self
                .get_run(&update.key.run_id)?
                .is_some_and(|run| run.is_active());
            if record.amount_paid != update.expected_paid || !run_active {
                return Err(StorageError::StaleRecord(update.key.to_string()));
            }
            record.amount_paid = update.amount_paid;
            record.amount_outstanding = update.amount_outstanding;
            batch.put_cf(cf_records, key, encode(&record)?);
        }

        batch.put_cf(cf_payments, payment.payment_id.as_bytes(), encode(payment)?);
        batch.put_cf(
            cf_person,
            Self::person_payment_key(payment.payer_id, payment.timestamp, &payment.payment_id),
            b"",
        );
        if payment.recipient_id != payment.payer_id {
            batch.put_cf(
                cf_person,
                Self::person_payment_key(payment.recipient_id, payment.timestamp, &payment.payment_id),
                b"",
            );
        }
        let total = self.get_meta_u64(META_PAYMENT_COUNT)? + 1;
        batch.put_cf(cf_meta, META_PAYMENT_COUNT, total.to_le_bytes());

        self.db.write(batch).map_err(backend)
    }

    fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<PaymentRecord>, StorageError> {
        let cf = self.cf_handle(CF_PAYMENTS)?;
        self.db
            .get_cf(cf, payment_id.as_bytes())
            .map_err(backend)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn payments_for_person(&self, person: PersonId) -> Result<Vec<PaymentRecord>, StorageError> {
        let mut payments = Vec::new();
        for (key, _) in self.scan_prefix(CF_PERSON_PAYMENTS, &person.to_be_bytes())?.into_iter().rev() {
            let raw: [u8; 32] = key
                .get(16..48)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| StorageError::Codec("invalid payment index key".into()))?;
            let payment_id = PaymentId(raw);
            let payment = self
                .get_payment(&payment_id)?
                .ok_or_else(|| StorageError::RecordNotFound(format!("payment {payment_id}")))?;
            payments.push(payment);
        }
        Ok(payments)
    }
}
