//! Per-identity usage accounting with durable journaling.
//!
//! Counters are scoped by (identity, calendar day) and (identity, calendar
//! month). A reservation is taken before a paid call; once the real cost is
//! known the ledger is corrected with a signed delta. Request counts are
//! never decremented.
//!
//! Every mutation is appended to a JSONL journal so quota state survives
//! process restarts; on open the journal is replayed and records outside the
//! current day/month are dropped, which is how old periods get collected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{CostSample, LimitKind};

/// Errors from the usage ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A configured limit would be exceeded; the dependency must not be
    /// invoked.
    #[error("usage limits exceeded for {identity}: {exceeded:?}")]
    LimitExceeded {
        identity: String,
        exceeded: Vec<LimitKind>,
    },

    #[error("journal IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Calendar period granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Day,
    Month,
}

impl Period {
    pub fn key(&self, at: DateTime<Utc>) -> String {
        match self {
            Period::Day => at.format("%Y-%m-%d").to_string(),
            Period::Month => at.format("%Y-%m").to_string(),
        }
    }
}

/// Limits for one period (day or month).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeriodLimits {
    pub requests: u64,
    pub units: u64,
    pub cost_usd: f64,
}

/// Per-identity limits, daily and monthly.
///
/// Defaults match the platform's stock quota tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_daily_limits")]
    pub daily: PeriodLimits,

    #[serde(default = "default_monthly_limits")]
    pub monthly: PeriodLimits,
}

fn default_daily_limits() -> PeriodLimits {
    PeriodLimits {
        requests: 1_000,
        units: 1_000_000,
        cost_usd: 50.0,
    }
}

fn default_monthly_limits() -> PeriodLimits {
    PeriodLimits {
        requests: 30_000,
        units: 30_000_000,
        cost_usd: 1_000.0,
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            daily: default_daily_limits(),
            monthly: default_monthly_limits(),
        }
    }
}

/// Monotonic counters for one (identity, period).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageCounter {
    pub requests: u64,
    pub units: u64,
    pub cost_usd: f64,
}

impl UsageCounter {
    fn reserve(&mut self, estimate: CostSample) {
        self.requests += 1;
        self.units += estimate.units;
        self.cost_usd += estimate.cost_usd;
    }

    /// Apply a signed estimate-to-actual correction. Requests are never
    /// adjusted; units and cost clamp at zero.
    fn adjust(&mut self, units_delta: i64, cost_delta: f64) {
        if units_delta >= 0 {
            self.units += units_delta as u64;
        } else {
            self.units = self.units.saturating_sub(units_delta.unsigned_abs());
        }
        self.cost_usd = (self.cost_usd + cost_delta).max(0.0);
    }
}

/// One journal line. Reservations carry the estimate; commits carry the
/// signed correction delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageRecord {
    timestamp: DateTime<Utc>,
    identity: String,
    day_key: String,
    month_key: String,
    kind: UsageRecordKind,
    requests: u64,
    units: i64,
    cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum UsageRecordKind {
    Reserved,
    Committed,
}

/// In-memory counters for one identity, current day and month only.
#[derive(Debug, Default)]
struct IdentityUsage {
    day_key: String,
    day: UsageCounter,
    month_key: String,
    month: UsageCounter,
}

impl IdentityUsage {
    /// Reset counters whose period key has moved on. Rollover is atomic
    /// with respect to the identity's lock: any call observing the new
    /// period sees zeroed counters.
    fn roll_over(&mut self, now: DateTime<Utc>) {
        let day_key = Period::Day.key(now);
        if self.day_key != day_key {
            if !self.day_key.is_empty() {
                debug!(old = %self.day_key, new = %day_key, "daily usage counter rolled over");
            }
            self.day_key = day_key;
            self.day = UsageCounter::default();
        }

        let month_key = Period::Month.key(now);
        if self.month_key != month_key {
            self.month_key = month_key;
            self.month = UsageCounter::default();
        }
    }
}

/// A successful reservation, used to correct the ledger once the actual
/// cost is known. Period attribution follows the reservation time, so a
/// call straddling midnight is accounted to the day it was reserved in.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub identity: String,
    pub day_key: String,
    pub month_key: String,
    pub estimate: CostSample,
}

/// Usage summary for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub identity: String,
    pub period: Period,
    pub period_key: String,
    pub requests: u64,
    pub units: u64,
    pub cost_usd: f64,
    pub limits: PeriodLimits,
    pub remaining_requests: u64,
    pub remaining_units: u64,
    pub remaining_cost_usd: f64,
}

/// Durable per-identity quota and cost ledger.
///
/// The accounts map lock is held only for lookup/insert; counter math runs
/// under the individual identity's async lock, and journal appends are
/// serialized separately.
pub struct UsageLedger {
    journal_path: PathBuf,
    limits: LimitSettings,
    accounts: StdMutex<HashMap<String, Arc<Mutex<IdentityUsage>>>>,
    journal: Mutex<()>,
}

impl UsageLedger {
    /// Open a ledger, replaying the journal to rebuild current-period
    /// counters. Records from past periods are dropped.
    pub async fn open(journal_path: PathBuf, limits: LimitSettings) -> Result<Self, LedgerError> {
        if let Some(parent) = journal_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let ledger = Self {
            journal_path,
            limits,
            accounts: StdMutex::new(HashMap::new()),
            journal: Mutex::new(()),
        };
        ledger.replay().await?;
        Ok(ledger)
    }

    pub fn limits(&self) -> &LimitSettings {
        &self.limits
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    async fn replay(&self) -> Result<(), LedgerError> {
        if !self.journal_path.exists() {
            return Ok(());
        }

        let now = Utc::now();
        let today = Period::Day.key(now);
        let this_month = Period::Month.key(now);

        let file = File::open(&self.journal_path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut replayed = 0usize;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let record: UsageRecord = serde_json::from_str(&line)?;
            if record.month_key != this_month && record.day_key != today {
                continue;
            }

            let account = self.account(&record.identity);
            let mut usage = account.lock().await;
            usage.roll_over(now);

            let in_day = record.day_key == today;
            let in_month = record.month_key == this_month;

            match record.kind {
                UsageRecordKind::Reserved => {
                    let estimate = CostSample::new(record.units.max(0) as u64, record.cost_usd);
                    if in_day {
                        usage.day.reserve(estimate);
                    }
                    if in_month {
                        usage.month.reserve(estimate);
                    }
                }
                UsageRecordKind::Committed => {
                    if in_day {
                        usage.day.adjust(record.units, record.cost_usd);
                    }
                    if in_month {
                        usage.month.adjust(record.units, record.cost_usd);
                    }
                }
            }
            replayed += 1;
        }

        if replayed > 0 {
            info!(records = replayed, "usage journal replayed");
        }
        Ok(())
    }

    fn account(&self, identity: &str) -> Arc<Mutex<IdentityUsage>> {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        accounts
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(IdentityUsage::default())))
            .clone()
    }

    async fn append(&self, record: &UsageRecord) -> Result<(), LedgerError> {
        let _guard = self.journal.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .await?;

        let json = serde_json::to_string(record)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Check limits and reserve the estimated cost, rejecting before the
    /// dependency is invoked if any daily or monthly limit would be
    /// exceeded.
    pub async fn check_and_reserve(
        &self,
        identity: &str,
        estimate: CostSample,
    ) -> Result<Reservation, LedgerError> {
        self.check_and_reserve_at(identity, estimate, Utc::now())
            .await
    }

    async fn check_and_reserve_at(
        &self,
        identity: &str,
        estimate: CostSample,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        let account = self.account(identity);
        let mut usage = account.lock().await;
        usage.roll_over(now);

        let mut exceeded = Vec::new();
        check_period(
            &usage.day,
            estimate,
            &self.limits.daily,
            [
                LimitKind::DailyRequests,
                LimitKind::DailyUnits,
                LimitKind::DailyCost,
            ],
            &mut exceeded,
        );
        check_period(
            &usage.month,
            estimate,
            &self.limits.monthly,
            [
                LimitKind::MonthlyRequests,
                LimitKind::MonthlyUnits,
                LimitKind::MonthlyCost,
            ],
            &mut exceeded,
        );

        if !exceeded.is_empty() {
            warn!(identity, ?exceeded, "usage limit exceeded, call rejected");
            return Err(LedgerError::LimitExceeded {
                identity: identity.to_string(),
                exceeded,
            });
        }

        usage.day.reserve(estimate);
        usage.month.reserve(estimate);

        let reservation = Reservation {
            identity: identity.to_string(),
            day_key: usage.day_key.clone(),
            month_key: usage.month_key.clone(),
            estimate,
        };
        drop(usage);

        self.append(&UsageRecord {
            timestamp: now,
            identity: identity.to_string(),
            day_key: reservation.day_key.clone(),
            month_key: reservation.month_key.clone(),
            kind: UsageRecordKind::Reserved,
            requests: 1,
            units: estimate.units as i64,
            cost_usd: estimate.cost_usd,
        })
        .await?;

        Ok(reservation)
    }

    /// Correct a reservation with the actual cost. The correction is
    /// journaled even when the reservation's period has rolled over, so the
    /// historical record stays accurate; requests are never decremented.
    pub async fn commit(
        &self,
        reservation: &Reservation,
        actual: CostSample,
    ) -> Result<(), LedgerError> {
        let units_delta = actual.units as i64 - reservation.estimate.units as i64;
        let cost_delta = actual.cost_usd - reservation.estimate.cost_usd;

        if units_delta == 0 && cost_delta == 0.0 {
            return Ok(());
        }

        let now = Utc::now();
        let account = self.account(&reservation.identity);
        let mut usage = account.lock().await;
        usage.roll_over(now);

        if usage.day_key == reservation.day_key {
            usage.day.adjust(units_delta, cost_delta);
        }
        if usage.month_key == reservation.month_key {
            usage.month.adjust(units_delta, cost_delta);
        }
        drop(usage);

        self.append(&UsageRecord {
            timestamp: now,
            identity: reservation.identity.clone(),
            day_key: reservation.day_key.clone(),
            month_key: reservation.month_key.clone(),
            kind: UsageRecordKind::Committed,
            requests: 0,
            units: units_delta,
            cost_usd: cost_delta,
        })
        .await?;

        Ok(())
    }

    /// Current-period usage summary for an identity.
    pub async fn report(&self, identity: &str, period: Period) -> UsageSummary {
        self.report_at(identity, period, Utc::now()).await
    }

    async fn report_at(&self, identity: &str, period: Period, now: DateTime<Utc>) -> UsageSummary {
        let account = self.account(identity);
        let mut usage = account.lock().await;
        usage.roll_over(now);

        let (counter, limits, key) = match period {
            Period::Day => (usage.day, self.limits.daily, usage.day_key.clone()),
            Period::Month => (usage.month, self.limits.monthly, usage.month_key.clone()),
        };

        UsageSummary {
            identity: identity.to_string(),
            period,
            period_key: key,
            requests: counter.requests,
            units: counter.units,
            cost_usd: counter.cost_usd,
            limits,
            remaining_requests: limits.requests.saturating_sub(counter.requests),
            remaining_units: limits.units.saturating_sub(counter.units),
            remaining_cost_usd: (limits.cost_usd - counter.cost_usd).max(0.0),
        }
    }
}

fn check_period(
    counter: &UsageCounter,
    estimate: CostSample,
    limits: &PeriodLimits,
    kinds: [LimitKind; 3],
    exceeded: &mut Vec<LimitKind>,
) {
    let [requests_kind, units_kind, cost_kind] = kinds;

    if counter.requests + 1 > limits.requests {
        exceeded.push(requests_kind);
    }
    if counter.units + estimate.units > limits.units {
        exceeded.push(units_kind);
    }
    if counter.cost_usd + estimate.cost_usd > limits.cost_usd {
        exceeded.push(cost_kind);
    }
}
