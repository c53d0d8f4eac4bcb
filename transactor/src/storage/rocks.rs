//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Accounts (key: account_id)
//! - `transfers` - Append-only transfer log (key: transfer_id)
//! - `indices` - Secondary indices for fast lookups
//!
//! # Index keys
//!
//! - `o|` user_id `|` ledger_code(be u32) -> account_id
//! - `t|` account_id sequence(be u64) transfer_id -> empty
//! - `s|next` -> next transfer sequence number (be u64)
//!
//! The sequence number is assigned under the write lock and persisted in
//! the same batch as the transfer, so history keys sort in recording order.

use super::{paginate, Storage};
use crate::{
    error::{Error, Result},
    types::{Account, AccountCode, CompletedTransfer, Ledger, Page, Transfer},
    Config,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_TRANSFERS: &str = "transfers";
const CF_INDICES: &str = "indices";

const OWNER_PREFIX: &[u8] = b"o|";
const ACCOUNT_TRANSFER_PREFIX: &[u8] = b"t|";
const SEQUENCE_KEY: &[u8] = b"s|next";

/// Storage wrapper for RocksDB
pub struct RocksStorage {
    db: Arc<DB>,
    /// Serializes read-modify-write sequences and holds the next transfer
    /// sequence number
    write_lock: Mutex<u64>,
}

impl RocksStorage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_open_files(config.rocksdb.max_open_files);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_accounts()),
            ColumnFamilyDescriptor::new(CF_TRANSFERS, Self::cf_options_transfers()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let next_sequence = match db.cf_handle(CF_INDICES) {
            Some(cf) => match db.get_cf(cf, SEQUENCE_KEY)? {
                Some(value) => Self::u64_from_slice(&value)?,
                None => 0,
            },
            None => return Err(Error::Persistence("Column family indices not found".to_string())),
        };

        tracing::info!(path = ?path, next_sequence, "Opened RocksDB");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(next_sequence),
        })
    }

    // Column family options

    fn cf_options_accounts() -> Options {
        let mut opts = Options::default();
        // Accounts are read on every cache miss, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_transfers() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Persistence(format!("Column family {} not found", name)))
    }

    // Account helpers

    fn load_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        match self.db.get_cf(cf, account_id.as_bytes())? {
            Some(value) => {
                let mut account: Account = bincode::deserialize(&value)?;
                account.recompute_balance();
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    fn require_account(&self, account_id: Uuid) -> Result<Account> {
        self.load_account(account_id)?
            .ok_or_else(|| Error::Persistence(format!("unknown account {}", account_id)))
    }

    fn owner_account_id(&self, user_id: &str, ledger: Ledger) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let key = Self::index_key_owner(user_id, Some(ledger));
        match self.db.get_cf(cf, &key)? {
            Some(value) => Ok(Some(Self::uuid_from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn complete(&self, transfer: &Transfer) -> Result<CompletedTransfer> {
        let debit = self.require_account(transfer.debit_account_id)?;
        let credit = self.require_account(transfer.credit_account_id)?;
        Ok(CompletedTransfer::from_transfer(
            transfer,
            &debit.user_id,
            &credit.user_id,
        ))
    }

    fn load_transfer(&self, transfer_id: Uuid) -> Result<Option<Transfer>> {
        let cf = self.cf_handle(CF_TRANSFERS)?;
        match self.db.get_cf(cf, transfer_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Collect every key under `prefix` in the indices column family
    fn scan_index(&self, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    // Index key helpers

    fn index_key_owner(user_id: &str, ledger: Option<Ledger>) -> Vec<u8> {
        let mut key = OWNER_PREFIX.to_vec();
        key.extend_from_slice(user_id.as_bytes());
        key.push(b'|');
        if let Some(ledger) = ledger {
            key.extend_from_slice(&ledger.code().to_be_bytes());
        }
        key
    }

    fn index_key_account_transfer(account_id: Uuid, entry: Option<(u64, Uuid)>) -> Vec<u8> {
        let mut key = ACCOUNT_TRANSFER_PREFIX.to_vec();
        key.extend_from_slice(account_id.as_bytes());
        if let Some((sequence, transfer_id)) = entry {
            key.extend_from_slice(&sequence.to_be_bytes());
            key.extend_from_slice(transfer_id.as_bytes());
        }
        key
    }

    fn uuid_from_slice(bytes: &[u8]) -> Result<Uuid> {
        Uuid::from_slice(bytes).map_err(|e| Error::Persistence(format!("corrupt index: {}", e)))
    }

    fn u64_from_slice(bytes: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Persistence(format!("corrupt sequence of {} bytes", bytes.len())))?;
        Ok(u64::from_be_bytes(raw))
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

#[async_trait]
impl Storage for RocksStorage {
    async fn get_all_accounts(&self) -> Result<Vec<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let mut account: Account = bincode::deserialize(&value)?;
            account.recompute_balance();
            accounts.push(account);
        }
        Ok(accounts)
    }

    async fn get_user_accounts(&self, user_id: &str) -> Result<Vec<Account>> {
        let prefix = Self::index_key_owner(user_id, None);
        let mut accounts = Vec::new();
        for (_, value) in self.scan_index(&prefix)? {
            let account_id = Self::uuid_from_slice(&value)?;
            if let Some(account) = self.load_account(account_id)? {
                // A user id containing '|' can share a prefix with another user
                if account.user_id == user_id {
                    accounts.push(account);
                }
            }
        }
        Ok(accounts)
    }

    async fn create_account(
        &self,
        user_id: &str,
        code: AccountCode,
        ledger: Ledger,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();

        if self.owner_account_id(user_id, ledger)?.is_some() {
            return Err(Error::AccountExists {
                user_id: user_id.to_string(),
                ledger,
            });
        }

        let account = Account::new(user_id, code, ledger);
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(CF_ACCOUNTS)?,
            account.id.as_bytes(),
            bincode::serialize(&account)?,
        );
        batch.put_cf(
            self.cf_handle(CF_INDICES)?,
            Self::index_key_owner(user_id, Some(ledger)),
            account.id.as_bytes(),
        );
        self.db.write(batch)?;

        tracing::debug!(account_id = %account.id, user_id, %ledger, "Account created");
        Ok(())
    }

    async fn insert_transfer(&self, transfer: &Transfer) -> Result<()> {
        let mut next_sequence = self.write_lock.lock();

        if self.load_transfer(transfer.id)?.is_some() {
            return Err(Error::DuplicateTransfer(transfer.id));
        }
        if transfer.debit_account_id == transfer.credit_account_id {
            return Err(Error::InvalidArgument(
                "debit and credit account must differ".to_string(),
            ));
        }

        let mut debit = self.require_account(transfer.debit_account_id)?;
        let mut credit = self.require_account(transfer.credit_account_id)?;
        debit.post_debit(transfer.amount)?;
        credit.post_credit(transfer.amount)?;

        let sequence = *next_sequence;

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let mut batch = WriteBatch::default();

        // 1. Transfer
        batch.put_cf(
            self.cf_handle(CF_TRANSFERS)?,
            transfer.id.as_bytes(),
            bincode::serialize(transfer)?,
        );

        // 2. Both accounts
        batch.put_cf(cf_accounts, debit.id.as_bytes(), bincode::serialize(&debit)?);
        batch.put_cf(cf_accounts, credit.id.as_bytes(), bincode::serialize(&credit)?);

        // 3. History indices and sequence
        batch.put_cf(
            cf_indices,
            Self::index_key_account_transfer(debit.id, Some((sequence, transfer.id))),
            b"",
        );
        batch.put_cf(
            cf_indices,
            Self::index_key_account_transfer(credit.id, Some((sequence, transfer.id))),
            b"",
        );
        batch.put_cf(cf_indices, SEQUENCE_KEY, (sequence + 1).to_be_bytes());

        // Atomic commit
        self.db.write(batch)?;
        *next_sequence = sequence + 1;

        tracing::debug!(
            transfer_id = %transfer.id,
            amount = %transfer.amount,
            "Transfer appended"
        );
        Ok(())
    }

    async fn get_transfer(&self, transfer_id: Uuid) -> Result<CompletedTransfer> {
        let transfer = self
            .load_transfer(transfer_id)?
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_string()))?;
        self.complete(&transfer)
    }

    async fn get_account_transfers(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> Result<(usize, Vec<CompletedTransfer>)> {
        let prefix = Self::index_key_account_transfer(account_id, None);
        let keys = self.scan_index(&prefix)?;
        let total = keys.len();

        let mut entries = Vec::with_capacity(total);
        for (key, _) in keys {
            // prefix | account_id(16) | sequence(8) | transfer_id(16)
            let id_start = prefix.len() + 8;
            if key.len() < id_start {
                return Err(Error::Persistence("corrupt history key".to_string()));
            }
            let sequence = Self::u64_from_slice(&key[prefix.len()..id_start])?;
            let transfer_id = Self::uuid_from_slice(&key[id_start..])?;
            let transfer = self
                .load_transfer(transfer_id)?
                .ok_or_else(|| Error::TransferNotFound(transfer_id.to_string()))?;
            entries.push((sequence, transfer));
        }

        let results = paginate(entries, &page)
            .iter()
            .map(|transfer| self.complete(transfer))
            .collect::<Result<Vec<_>>>()?;

        Ok((total, results))
    }
}
