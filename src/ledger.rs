// =============================================================================
// Ledger — append-only per-account monetary journal with running balance
// =============================================================================
//
// Every balance change is an entry; the cached balance always equals the sum
// of entry amounts. Mutations serialize on a per-account mutex so that
// `balance_after` is strictly consistent with the entry sequence.
//
// Funding kinds (Deposit / Withdraw / Adjustment / Bonus) are invoked by the
// admin plane; RealizedPnl / Commission / Swap only by the order engine.
//
// Durability: each entry is mirrored to an append-only
// `<data_dir>/<ACCOUNT_ID>.jsonl`. Disk failures are logged and counted; the
// in-memory journal remains authoritative. On startup the mirror is replayed
// to reconstruct balances exactly; a replay mismatch is treated as state
// corruption and aborts startup.
// =============================================================================

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::errors::RejectReason;

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryKind {
    Deposit,
    Withdraw,
    Adjustment,
    Bonus,
    RealizedPnl,
    Commission,
    Swap,
}

/// One immutable journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic per-account id, starting at 1.
    pub id: u64,
    pub account_id: String,
    pub kind: LedgerEntryKind,
    /// Signed amount; withdrawals and commissions are negative.
    pub amount: f64,
    pub balance_after: f64,
    /// Cross-reference (trade id for RealizedPnl, free-form otherwise).
    #[serde(default)]
    pub reference: Option<String>,
    /// Unix milliseconds.
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Per-account journal
// ---------------------------------------------------------------------------

struct Journal {
    entries: Vec<LedgerEntry>,
    balance: f64,
    next_id: u64,
}

impl Journal {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            balance: 0.0,
            next_id: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Thread-safe account journal store. All reads outside the order engine go
/// through value-returning accessors.
pub struct Ledger {
    journals: RwLock<HashMap<String, Arc<Mutex<Journal>>>>,
    /// Mirror directory; `None` disables durability (tests).
    data_dir: Option<PathBuf>,
    /// Mirror write failures since startup.
    pub write_errors: AtomicU64,
}

impl Ledger {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &data_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "failed to create ledger dir — mirror writes will fail");
            }
        }
        Self {
            journals: RwLock::new(HashMap::new()),
            data_dir,
            write_errors: AtomicU64::new(0),
        }
    }

    /// Ensure a journal exists for `account_id`.
    pub fn open_account(&self, account_id: &str) {
        let mut map = self.journals.write();
        map.entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Journal::new())));
    }

    fn journal(&self, account_id: &str) -> Arc<Mutex<Journal>> {
        if let Some(j) = self.journals.read().get(account_id) {
            return j.clone();
        }
        let mut map = self.journals.write();
        map.entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Journal::new())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Entry creation (single chokepoint)
    // -------------------------------------------------------------------------

    fn append(
        &self,
        account_id: &str,
        kind: LedgerEntryKind,
        amount: f64,
        reference: Option<String>,
    ) -> LedgerEntry {
        let journal = self.journal(account_id);
        let mut j = journal.lock();

        let entry = LedgerEntry {
            id: j.next_id,
            account_id: account_id.to_string(),
            kind,
            amount,
            balance_after: j.balance + amount,
            reference,
            ts: Utc::now().timestamp_millis(),
        };

        j.next_id += 1;
        j.balance = entry.balance_after;
        j.entries.push(entry.clone());

        // Mirror while still holding the account lock so the file order
        // matches the id order.
        self.mirror(&entry);

        entry
    }

    fn mirror(&self, entry: &LedgerEntry) {
        let Some(dir) = &self.data_dir else { return };
        let path = dir.join(format!("{}.jsonl", entry.account_id));

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                let line = serde_json::to_string(entry).unwrap_or_default();
                writeln!(f, "{line}")
            });

        if let Err(e) = result {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(account = %entry.account_id, error = %e, "ledger mirror write failed");
        }
    }

    // -------------------------------------------------------------------------
    // Funding operations (admin plane)
    // -------------------------------------------------------------------------

    pub fn deposit(
        &self,
        account_id: &str,
        amount: f64,
        reference: Option<String>,
    ) -> Result<LedgerEntry, RejectReason> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(RejectReason::InsufficientFunds);
        }
        let entry = self.append(account_id, LedgerEntryKind::Deposit, amount, reference);
        info!(account = %account_id, amount, balance = entry.balance_after, "deposit recorded");
        Ok(entry)
    }

    pub fn withdraw(
        &self,
        account_id: &str,
        amount: f64,
        reference: Option<String>,
    ) -> Result<LedgerEntry, RejectReason> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(RejectReason::InsufficientFunds);
        }

        let journal = self.journal(account_id);
        let entry = {
            let mut j = journal.lock();
            if amount > j.balance {
                return Err(RejectReason::InsufficientFunds);
            }
            let entry = LedgerEntry {
                id: j.next_id,
                account_id: account_id.to_string(),
                kind: LedgerEntryKind::Withdraw,
                amount: -amount,
                balance_after: j.balance - amount,
                reference,
                ts: Utc::now().timestamp_millis(),
            };
            j.next_id += 1;
            j.balance = entry.balance_after;
            j.entries.push(entry.clone());
            self.mirror(&entry);
            entry
        };

        info!(account = %account_id, amount, balance = entry.balance_after, "withdrawal recorded");
        Ok(entry)
    }

    /// Signed manual correction. Must not drive the balance below zero.
    pub fn adjustment(
        &self,
        account_id: &str,
        amount: f64,
        reference: Option<String>,
    ) -> Result<LedgerEntry, RejectReason> {
        if !amount.is_finite() {
            return Err(RejectReason::InsufficientFunds);
        }

        let journal = self.journal(account_id);
        let entry = {
            let mut j = journal.lock();
            if j.balance + amount < 0.0 {
                return Err(RejectReason::InsufficientFunds);
            }
            let entry = LedgerEntry {
                id: j.next_id,
                account_id: account_id.to_string(),
                kind: LedgerEntryKind::Adjustment,
                amount,
                balance_after: j.balance + amount,
                reference,
                ts: Utc::now().timestamp_millis(),
            };
            j.next_id += 1;
            j.balance = entry.balance_after;
            j.entries.push(entry.clone());
            self.mirror(&entry);
            entry
        };

        info!(account = %account_id, amount, balance = entry.balance_after, "adjustment recorded");
        Ok(entry)
    }

    pub fn bonus(
        &self,
        account_id: &str,
        amount: f64,
        reference: Option<String>,
    ) -> Result<LedgerEntry, RejectReason> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(RejectReason::InsufficientFunds);
        }
        let entry = self.append(account_id, LedgerEntryKind::Bonus, amount, reference);
        Ok(entry)
    }

    // -------------------------------------------------------------------------
    // Order-engine operations
    // -------------------------------------------------------------------------

    /// Record the realized P&L of a closed trade. Losses may legitimately
    /// exceed the remaining balance (gap through stop-out), so no floor check.
    pub fn record_realized_pnl(&self, account_id: &str, amount: f64, trade_id: &str) -> LedgerEntry {
        self.append(
            account_id,
            LedgerEntryKind::RealizedPnl,
            amount,
            Some(trade_id.to_string()),
        )
    }

    /// Charge a commission (stored as a negative amount).
    pub fn record_commission(&self, account_id: &str, amount: f64, reference: &str) -> LedgerEntry {
        self.append(
            account_id,
            LedgerEntryKind::Commission,
            -amount.abs(),
            Some(reference.to_string()),
        )
    }

    /// Record accrued swap (signed) against a closed trade.
    pub fn record_swap(&self, account_id: &str, amount: f64, reference: &str) -> LedgerEntry {
        self.append(
            account_id,
            LedgerEntryKind::Swap,
            amount,
            Some(reference.to_string()),
        )
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn balance(&self, account_id: &str) -> f64 {
        self.journal(account_id).lock().balance
    }

    /// Most recent `limit` entries, oldest first.
    pub fn entries(&self, account_id: &str, limit: usize) -> Vec<LedgerEntry> {
        let journal = self.journal(account_id);
        let j = journal.lock();
        let skip = j.entries.len().saturating_sub(limit);
        j.entries[skip..].to_vec()
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.journals.read().keys().cloned().collect()
    }

    /// Check the core invariant: sum of amounts == cached balance ==
    /// balance_after of the last entry.
    pub fn verify(&self, account_id: &str) -> bool {
        let journal = self.journal(account_id);
        let j = journal.lock();
        let sum: f64 = j.entries.iter().map(|e| e.amount).sum();
        let last_ok = j
            .entries
            .last()
            .map(|e| (e.balance_after - j.balance).abs() < 1e-9)
            .unwrap_or(j.balance == 0.0);
        (sum - j.balance).abs() < 1e-9 && last_ok
    }

    // -------------------------------------------------------------------------
    // Startup replay
    // -------------------------------------------------------------------------

    /// Replay every mirror file in the data directory, reconstructing each
    /// account's journal and balance. Unparseable trailing lines (torn writes)
    /// are discarded; an internal inconsistency inside a file is fatal.
    pub fn load_from_disk(&self) -> Result<usize> {
        let Some(dir) = &self.data_dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded_accounts = 0usize;
        for dirent in std::fs::read_dir(dir).context("failed to read ledger dir")? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(account_id) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };

            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read ledger mirror {}", path.display()))?;

            let mut entries: Vec<LedgerEntry> = Vec::new();
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LedgerEntry>(line) {
                    Ok(e) => entries.push(e),
                    Err(e) => {
                        // Torn trailing record from a crash mid-append.
                        warn!(account = %account_id, error = %e, "discarding unparseable ledger line");
                        break;
                    }
                }
            }

            let mut running = 0.0f64;
            for e in &entries {
                running += e.amount;
                if (e.balance_after - running).abs() > 1e-6 {
                    error!(
                        account = %account_id,
                        entry_id = e.id,
                        expected = running,
                        recorded = e.balance_after,
                        "ledger balance mismatch on replay"
                    );
                    bail!("ledger corruption in account {account_id}: entry {} balance_after {} != running sum {running}", e.id, e.balance_after);
                }
            }

            let next_id = entries.last().map(|e| e.id + 1).unwrap_or(1);
            let journal = Arc::new(Mutex::new(Journal {
                balance: running,
                entries,
                next_id,
            }));
            self.journals.write().insert(account_id.clone(), journal);
            loaded_accounts += 1;
            info!(account = %account_id, balance = running, "ledger replayed");
        }

        Ok(loaded_accounts)
    }
}
