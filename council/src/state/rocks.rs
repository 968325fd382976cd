//! RocksDB-backed council store
//!
//! One column family per record kind. Both commits are written as a single
//! `WriteBatch`, so a crash never leaves a round or a culling half applied.
//! Values are JSON so the database stays inspectable with stock tooling.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use serde::{de::DeserializeOwned, Serialize};

use super::schema::{self, keys, ALL_CFS};
use super::store::{
    CouncilStore, PopulationCommit, RoundCommit, SharedCouncilStore, StoreError, StoreResult,
};
use super::types::*;

/// RocksDB-backed persistent council store
pub struct RocksStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl RocksStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedCouncilStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        match db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Scan `[start, end]` in key order, decoding every value. Without an
    /// end the scan stops at the first key outside the `start` prefix.
    fn scan<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        start: &str,
        end: Option<&str>,
    ) -> StoreResult<Vec<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut values = Vec::new();
        let iter = db.iterator_cf(cf, IteratorMode::From(start.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            match end {
                Some(end) if key.as_ref() > end.as_bytes() => break,
                None if !key.starts_with(start.as_bytes()) => break,
                _ => {}
            }
            values.push(Self::decode(&value)?);
        }
        Ok(values)
    }
}

fn handle<'a>(db: &'a DB, name: &str) -> StoreResult<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::ColumnFamilyNotFound(name.to_string()))
}

impl CouncilStore for RocksStore {
    fn commit_round(&self, commit: &RoundCommit) -> StoreResult<()> {
        let round_id = commit.round.round_id;
        if self
            .get::<RoundRecord>(schema::CF_ROUNDS, &keys::round(round_id))?
            .is_some()
        {
            return Err(StoreError::Conflict(format!(
                "round {} already committed",
                round_id
            )));
        }

        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let rounds = handle(&db, schema::CF_ROUNDS)?;
        let votes = handle(&db, schema::CF_VOTES)?;
        let councillors = handle(&db, schema::CF_COUNCILLORS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(rounds, keys::round(round_id), Self::encode(&commit.round)?);
        if let Some(session) = &commit.vote_session {
            batch.put_cf(votes, keys::vote(round_id), Self::encode(session)?);
        }
        for councillor in &commit.councillors {
            batch.put_cf(
                councillors,
                keys::councillor(councillor.id),
                Self::encode(councillor)?,
            );
        }

        db.write(batch)?;
        Ok(())
    }

    fn commit_population(&self, commit: &PopulationCommit) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let councillors = handle(&db, schema::CF_COUNCILLORS)?;
        let graveyard = handle(&db, schema::CF_GRAVEYARD)?;

        let mut batch = WriteBatch::default();
        let mut archived = BTreeSet::new();
        for record in &commit.retired {
            let index_key = keys::grave_index(record.id);
            if !archived.insert(record.id) || db.get_cf(graveyard, index_key.as_bytes())?.is_some()
            {
                return Err(StoreError::Conflict(format!(
                    "{} is already archived",
                    record.id
                )));
            }
            let grave_key = keys::grave(record.retirement_round, record.id);
            batch.delete_cf(councillors, keys::councillor(record.id));
            batch.put_cf(graveyard, &index_key, grave_key.as_bytes());
            batch.put_cf(graveyard, grave_key, Self::encode(record)?);
        }
        for councillor in &commit.spawned {
            batch.put_cf(
                councillors,
                keys::councillor(councillor.id),
                Self::encode(councillor)?,
            );
        }

        db.write(batch)?;
        Ok(())
    }

    fn get_councillor(&self, id: CouncillorId) -> StoreResult<Option<Councillor>> {
        self.get(schema::CF_COUNCILLORS, &keys::councillor(id))
    }

    fn list_councillors(&self) -> StoreResult<Vec<Councillor>> {
        self.scan(schema::CF_COUNCILLORS, keys::COUNCILLOR_PREFIX, None)
    }

    fn get_round(&self, round_id: RoundId) -> StoreResult<Option<RoundRecord>> {
        self.get(schema::CF_ROUNDS, &keys::round(round_id))
    }

    fn rounds_in_range(&self, start: RoundId, end: RoundId) -> StoreResult<Vec<RoundRecord>> {
        if start > end {
            return Ok(Vec::new());
        }
        self.scan(
            schema::CF_ROUNDS,
            &keys::round(start),
            Some(&keys::round(end)),
        )
    }

    fn latest_round_id(&self) -> StoreResult<Option<RoundId>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_ROUNDS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_ROUNDS.to_string()))?;

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(keys::parse_round(&key))
            }
            None => Ok(None),
        }
    }

    fn get_vote_session(&self, round_id: RoundId) -> StoreResult<Option<VoteSession>> {
        self.get(schema::CF_VOTES, &keys::vote(round_id))
    }

    fn graveyard(&self) -> StoreResult<Vec<GraveyardRecord>> {
        self.scan(schema::CF_GRAVEYARD, keys::GRAVE_PREFIX, None)
    }
}
