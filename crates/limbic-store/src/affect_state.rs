//! Persisted affect state with optimistic concurrency.
//!
//! One row per (identity, scope). Every write is a single statement guarded
//! by the version read beforehand, so concurrent processes sharing the file
//! either see their write land whole or get [`StoreError::Conflict`] and
//! retry from a fresh read.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, warn};

use limbic_core::affect::{blend, decay};
use limbic_core::time::hours_between;
use limbic_core::{
    AffectConfig, AffectDelta, AffectDynamics, AffectScopeMode, AffectVector, DetectedAffect,
};

use crate::error::{Result, StoreError};
use crate::retry::{RetryPolicy, retry_blocking};
use crate::schema;

pub const SHARED_SCOPE: &str = "shared";

/// Scope key for an affect record under the configured mode.
pub fn scope_for(mode: AffectScopeMode, conversation_id: Option<&str>) -> String {
    match (mode, conversation_id) {
        (AffectScopeMode::Conversation, Some(id)) if !id.is_empty() => format!("conversation:{id}"),
        _ => SHARED_SCOPE.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AffectState {
    pub identity: String,
    pub scope: String,
    pub values: AffectVector,
    pub baseline: AffectVector,
    /// Time the values are valid for.
    pub updated_at_ms: i64,
    /// 0 means never persisted.
    pub version: i64,
}

/// Result of a read-modify-write. A soft failure still carries a valid
/// (possibly stale) state so callers can carry on.
#[derive(Debug)]
pub enum AffectUpdate {
    Applied { state: AffectState, attempts: u32 },
    Stale { state: AffectState, error: StoreError },
}

impl AffectUpdate {
    pub fn state(&self) -> &AffectState {
        match self {
            AffectUpdate::Applied { state, .. } | AffectUpdate::Stale { state, .. } => state,
        }
    }

    pub fn into_state(self) -> AffectState {
        match self {
            AffectUpdate::Applied { state, .. } | AffectUpdate::Stale { state, .. } => state,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, AffectUpdate::Applied { .. })
    }
}

pub struct AffectStateStore {
    conn: Connection,
    baseline: AffectVector,
    dynamics: AffectDynamics,
    policy: RetryPolicy,
}

impl AffectStateStore {
    pub fn open(path: &Path, cfg: &AffectConfig, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, cfg, busy_timeout_ms)
    }

    pub fn open_in_memory(cfg: &AffectConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, cfg, schema::DEFAULT_BUSY_TIMEOUT_MS)
    }

    fn init(conn: Connection, cfg: &AffectConfig, busy_timeout_ms: u64) -> Result<Self> {
        schema::configure(&conn, busy_timeout_ms)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS affect_state (
                identity      TEXT NOT NULL,
                scope         TEXT NOT NULL,
                values_json   TEXT NOT NULL,
                baseline_json TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                version       INTEGER NOT NULL,
                PRIMARY KEY (identity, scope)
            );
            ",
        )?;
        Ok(Self {
            conn,
            baseline: cfg.baseline(),
            dynamics: cfg.dynamics(),
            policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn baseline(&self) -> AffectVector {
        self.baseline
    }

    /// The row as stored, without decay.
    pub fn load(&self, identity: &str, scope: &str) -> Result<Option<AffectState>> {
        let row: Option<(String, String, i64, i64)> = self
            .conn
            .query_row(
                "SELECT values_json, baseline_json, updated_at_ms, version
                 FROM affect_state WHERE identity = ?1 AND scope = ?2",
                params![identity, scope],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|(values, baseline, updated_at_ms, version)| {
            Ok(AffectState {
                identity: identity.to_string(),
                scope: scope.to_string(),
                values: serde_json::from_str(&values)?,
                baseline: serde_json::from_str(&baseline)?,
                updated_at_ms,
                version,
            })
        })
        .transpose()
    }

    /// Current state with passive decay toward baseline applied up to `now_ms`.
    /// Unknown records start at the baseline.
    pub fn get(&self, identity: &str, scope: &str, now_ms: i64) -> Result<AffectState> {
        let Some(stored) = self.load(identity, scope)? else {
            return Ok(self.fresh(identity, scope, now_ms));
        };
        let hours = hours_between(stored.updated_at_ms, now_ms);
        Ok(AffectState {
            values: decay(&stored.values, &self.baseline, self.dynamics.decay_rate, hours),
            baseline: self.baseline,
            updated_at_ms: now_ms.max(stored.updated_at_ms),
            ..stored
        })
    }

    /// Blend newly detected affect into the state.
    pub fn update(
        &self,
        identity: &str,
        scope: &str,
        detected: &DetectedAffect,
        now_ms: i64,
    ) -> AffectUpdate {
        let baseline = self.baseline;
        let dynamics = self.dynamics;
        self.modify(identity, scope, now_ms, |current| {
            blend(current, &baseline, &detected.weights, detected.intensity, &dynamics)
        })
    }

    /// Apply a bounded recall bleed. A zero delta writes nothing.
    pub fn nudge(&self, identity: &str, scope: &str, delta: &AffectDelta, now_ms: i64) -> AffectUpdate {
        if delta.is_zero() {
            return match self.get(identity, scope, now_ms) {
                Ok(state) => AffectUpdate::Applied { state, attempts: 0 },
                Err(error) => AffectUpdate::Stale {
                    state: self.fresh(identity, scope, now_ms),
                    error,
                },
            };
        }
        self.modify(identity, scope, now_ms, |current| delta.apply(current))
    }

    pub fn reset(&self, identity: &str, scope: &str, now_ms: i64) -> AffectUpdate {
        let baseline = self.baseline;
        self.modify(identity, scope, now_ms, |_| baseline)
    }

    /// Read, transform, and write back guarded by the version read. Conflicts
    /// and lock contention are retried with backoff; when retries run out the
    /// last state read is returned untouched.
    pub fn modify<F>(&self, identity: &str, scope: &str, now_ms: i64, mut f: F) -> AffectUpdate
    where
        F: FnMut(&AffectVector) -> AffectVector,
    {
        let mut last_read: Option<AffectState> = None;
        let mut attempts = 0;

        let result = retry_blocking(&self.policy, "affect_update", StoreError::is_transient, |attempt| {
            attempts = attempt;
            let current = self.get(identity, scope, now_ms)?;
            last_read = Some(current.clone());
            let next = f(&current.values);
            self.try_write(&current, next, now_ms)
        });

        match result {
            Ok(state) => {
                debug!(identity, scope, version = state.version, attempts, "affect state written");
                AffectUpdate::Applied { state, attempts }
            }
            Err(error) => {
                warn!(identity, scope, attempts, error = %error, "affect update abandoned, keeping last read state");
                let state = last_read.unwrap_or_else(|| self.fresh(identity, scope, now_ms));
                AffectUpdate::Stale { state, error }
            }
        }
    }

    /// Compare-and-swap against `read.version`. Fails with
    /// [`StoreError::Conflict`] when someone else wrote in between.
    pub fn try_write(
        &self,
        read: &AffectState,
        values: AffectVector,
        now_ms: i64,
    ) -> Result<AffectState> {
        let values_json = serde_json::to_string(&values)?;
        let baseline_json = serde_json::to_string(&self.baseline)?;
        let updated_at_ms = now_ms.max(read.updated_at_ms);

        let changed = if read.version == 0 {
            self.conn.execute(
                "INSERT OR IGNORE INTO affect_state
                     (identity, scope, values_json, baseline_json, updated_at_ms, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![read.identity, read.scope, values_json, baseline_json, updated_at_ms],
            )?
        } else {
            self.conn.execute(
                "UPDATE affect_state
                 SET values_json = ?3, baseline_json = ?4, updated_at_ms = ?5, version = version + 1
                 WHERE identity = ?1 AND scope = ?2 AND version = ?6",
                params![
                    read.identity,
                    read.scope,
                    values_json,
                    baseline_json,
                    updated_at_ms,
                    read.version
                ],
            )?
        };

        if changed == 0 {
            return Err(StoreError::Conflict {
                identity: read.identity.clone(),
                scope: read.scope.clone(),
            });
        }
        Ok(AffectState {
            identity: read.identity.clone(),
            scope: read.scope.clone(),
            values,
            baseline: self.baseline,
            updated_at_ms,
            version: read.version + 1,
        })
    }

    fn fresh(&self, identity: &str, scope: &str, now_ms: i64) -> AffectState {
        AffectState {
            identity: identity.to_string(),
            scope: scope.to_string(),
            values: self.baseline,
            baseline: self.baseline,
            updated_at_ms: now_ms,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use limbic_core::Affect;
    use limbic_core::time::MS_PER_HOUR;
    use tempfile::TempDir;

    const ID: &str = "agent";

    fn store() -> AffectStateStore {
        AffectStateStore::open_in_memory(&AffectConfig::default()).unwrap()
    }

    /// Stored vectors pass through JSON, so compare with tolerance.
    fn assert_close(a: &AffectVector, b: &AffectVector) {
        for (x, y) in a.values().iter().zip(b.values()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    fn fear(weight: f64) -> DetectedAffect {
        let mut weights = AffectVector::zeros();
        weights.set(Affect::Fear, weight);
        DetectedAffect {
            weights,
            intensity: weight,
        }
    }

    #[test]
    fn test_scope_keys() {
        assert_eq!(scope_for(AffectScopeMode::Shared, Some("c1")), "shared");
        assert_eq!(scope_for(AffectScopeMode::Conversation, Some("c1")), "conversation:c1");
        assert_eq!(scope_for(AffectScopeMode::Conversation, None), "shared");
    }

    #[test]
    fn test_fresh_state_is_baseline() {
        let s = store();
        let state = s.get(ID, SHARED_SCOPE, 1000).unwrap();
        assert_eq!(state.values, s.baseline());
        assert_eq!(state.version, 0);
    }

    #[test]
    fn test_update_persists_and_bumps_version() {
        let s = store();
        let first = s.update(ID, SHARED_SCOPE, &fear(0.9), 0);
        assert!(first.is_applied());
        assert_eq!(first.state().version, 1);
        assert!(first.state().values.get(Affect::Fear) > s.baseline().get(Affect::Fear));

        let second = s.update(ID, SHARED_SCOPE, &fear(0.9), 0);
        assert_eq!(second.state().version, 2);
        assert!(second.state().values.get(Affect::Fear) > first.state().values.get(Affect::Fear));

        let stored = s.load(ID, SHARED_SCOPE).unwrap().unwrap();
        assert_close(&stored.values, &second.state().values);
    }

    #[test]
    fn test_decay_on_read() {
        let s = store();
        let mut v0 = s.baseline();
        v0.set(Affect::Fear, 0.9);
        s.modify(ID, SHARED_SCOPE, 0, |_| v0);

        let hours = 3.0;
        let state = s.get(ID, SHARED_SCOPE, (hours * MS_PER_HOUR) as i64).unwrap();
        let b = s.baseline().get(Affect::Fear);
        let expected = b + (-0.1 * hours).exp() * (0.9 - b);
        assert_relative_eq!(state.values.get(Affect::Fear), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_values_stay_in_unit_range() {
        let s = store();
        let mut detected = fear(1.0);
        detected.intensity = 50.0;
        for i in 0..50 {
            let update = s.update(ID, SHARED_SCOPE, &detected, i);
            assert!(update.state().values.values().iter().all(|v| (0.0..=1.0).contains(v)));
        }
        let nudge = s.nudge(ID, SHARED_SCOPE, &AffectDelta([5.0; 7]), 100);
        assert!(nudge.state().values.values().iter().all(|v| *v <= 1.0));
    }

    #[test]
    fn test_zero_nudge_writes_nothing() {
        let s = store();
        let out = s.nudge(ID, SHARED_SCOPE, &AffectDelta::default(), 0);
        assert!(out.is_applied());
        assert!(s.load(ID, SHARED_SCOPE).unwrap().is_none());
    }

    #[test]
    fn test_reset_returns_to_baseline() {
        let s = store();
        s.update(ID, SHARED_SCOPE, &fear(1.0), 0);
        let out = s.reset(ID, SHARED_SCOPE, 0);
        assert_close(&out.state().values, &s.baseline());
    }

    #[test]
    fn test_stale_write_is_rejected() {
        let s = store();
        let read = s.get(ID, SHARED_SCOPE, 0).unwrap();
        s.try_write(&read, AffectVector::zeros(), 0).unwrap();
        let err = s.try_write(&read, AffectVector::new([1.0; 7]), 0).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(
            s.load(ID, SHARED_SCOPE).unwrap().unwrap().values,
            AffectVector::zeros()
        );
    }

    /// Two handles on one file stand in for two processes.
    fn pair(dir: &TempDir) -> (AffectStateStore, AffectStateStore) {
        let path = dir.path().join("affect.db");
        let cfg = AffectConfig::default();
        let a = AffectStateStore::open(&path, &cfg, 5000).unwrap();
        let b = AffectStateStore::open(&path, &cfg, 5000)
            .unwrap()
            .with_retry(RetryPolicy::immediate(3));
        (a, b)
    }

    #[test]
    fn test_concurrent_writer_conflict_is_retried() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        a.update(ID, SHARED_SCOPE, &fear(0.5), 0);

        // b reads, then a writes before b can, forcing b to re-read.
        let mut interfered = false;
        let out = b.modify(ID, SHARED_SCOPE, 0, |current| {
            if !interfered {
                interfered = true;
                a.update(ID, SHARED_SCOPE, &fear(1.0), 0);
            }
            AffectDelta([0.01; 7]).apply(current)
        });

        let AffectUpdate::Applied { state, attempts } = out else {
            panic!("expected the retry to succeed");
        };
        assert_eq!(attempts, 2);
        assert_eq!(state.version, 3);

        // b's write was computed from a's latest values, not the stale read
        let after_a = a.load(ID, SHARED_SCOPE).unwrap().unwrap();
        assert_eq!(after_a.version, 3);
        assert_close(&after_a.values, &state.values);
    }

    #[test]
    fn test_exhausted_retries_return_stale_state() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        a.update(ID, SHARED_SCOPE, &fear(0.5), 0);

        let out = b.modify(ID, SHARED_SCOPE, 0, |_| {
            a.update(ID, SHARED_SCOPE, &fear(0.2), 0);
            AffectVector::zeros()
        });

        let AffectUpdate::Stale { state, error } = out else {
            panic!("every attempt should conflict");
        };
        assert!(matches!(error, StoreError::Conflict { .. }));
        assert!(state.version >= 1);
        let stored = a.load(ID, SHARED_SCOPE).unwrap().unwrap();
        assert_eq!(stored.version, 4, "one initial write plus one per attempt from a");
        assert_ne!(stored.values, AffectVector::zeros(), "b never overwrote");
    }
}
