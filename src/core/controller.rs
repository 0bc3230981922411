//! Serialized, checkpointed policy mutation
//!
//! Every policy change runs inside a transaction:
//!
//! ```text
//! Idle ──lock──▶ Locked ──▶ Mutating ──ok──▶ Committed ──unlock──▶ Idle
//!                              │
//!                              └──err──▶ Aborted ──unlock──▶ Idle
//! ```
//!
//! The lock is an exclusive `flock` on `iptables.lock` in the state directory,
//! so callers in separate processes are serialized. It is held from the first
//! mutation through commit and released by a drop guard on every path,
//! including a failing commit and a panicking batch. The same guard puts the
//! controller back in `Idle`; how the scope ended is kept as
//! [`MutationController::last_outcome`].
//!
//! Mutations are applied straight to the live engine. A failing batch is not
//! rolled back: the engine keeps whatever succeeded, and the backup is left
//! untouched. Commit happens if and only if the batch returned `Ok`.

use crate::core::backup::BackupStore;
use crate::core::blocklist::DohList;
use crate::core::engine::{PacketFilter, PrimitiveOp};
use crate::core::error::{Error, Result};
use crate::core::policy::{FilterChain, FilterRule, NatRule, NatType};
use crate::core::topology::{BuildReport, DEFAULT_RESOLVER_PORT, TopologyBuilder};
use crate::core::translate::RuleTranslator;
use crate::core::zones::ZoneRegistry;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = "iptables.lock";

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ControllerState {
    Idle,
    Locked,
    Mutating,
    /// The ruleset was persisted; the lock is about to be released
    Committed,
    /// The scope failed or panicked; nothing was persisted
    Aborted,
}

/// How the most recent locked scope ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Outcome {
    Committed,
    Aborted,
    /// `restore` loaded the backup; nothing was persisted
    Restored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Block until the lock is free
    #[default]
    Blocking,
    /// Fail with [`Error::LockUnavailable`] when another holder exists
    NonBlocking,
}

/// Exclusive policy lock, released when dropped.
struct PolicyLock {
    _flock: Flock<File>,
}

impl PolicyLock {
    fn acquire(path: &Path, mode: LockMode) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;

        let arg = match mode {
            LockMode::Blocking => FlockArg::LockExclusive,
            LockMode::NonBlocking => FlockArg::LockExclusiveNonblock,
        };

        match Flock::lock(file, arg) {
            Ok(flock) => {
                debug!("Acquired policy lock {}", path.display());
                Ok(Self { _flock: flock })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(Error::LockUnavailable(format!(
                "{} is held by another process",
                path.display()
            ))),
            Err((_, errno)) => Err(std::io::Error::from(errno).into()),
        }
    }
}

pub struct MutationController<E: PacketFilter> {
    engine: E,
    zones: ZoneRegistry,
    backup: BackupStore,
    lock_path: PathBuf,
    lock_mode: LockMode,
    doh_list: Option<PathBuf>,
    resolver_port: u16,
    state: ControllerState,
    last_outcome: Option<Outcome>,
}

/// Holds the policy lock for one scope. Dropping it records the outcome,
/// returns the controller to `Idle`, then releases the lock.
struct Scope<'c, E: PacketFilter> {
    controller: &'c mut MutationController<E>,
    outcome: Outcome,
    _lock: PolicyLock,
}

impl<'c, E: PacketFilter> Scope<'c, E> {
    fn enter(controller: &'c mut MutationController<E>, mode: LockMode) -> Result<Self> {
        let lock = PolicyLock::acquire(&controller.lock_path, mode)?;
        controller.state = ControllerState::Locked;
        Ok(Self {
            controller,
            outcome: Outcome::Aborted,
            _lock: lock,
        })
    }

    fn finish(&mut self, outcome: Outcome) {
        self.outcome = outcome;
        match outcome {
            Outcome::Committed => self.controller.state = ControllerState::Committed,
            Outcome::Aborted => self.controller.state = ControllerState::Aborted,
            Outcome::Restored => {}
        }
    }
}

impl<E: PacketFilter> Drop for Scope<'_, E> {
    fn drop(&mut self) {
        if self.controller.state == ControllerState::Mutating {
            warn!("Mutation scope ended without completing; ruleset not persisted");
        }
        self.controller.last_outcome = Some(self.outcome);
        self.controller.state = ControllerState::Idle;
        debug!("Released policy lock ({})", self.outcome);
    }
}

impl<E: PacketFilter> MutationController<E> {
    /// Controller keeping its lock file and backup in `state_dir`.
    pub fn new(engine: E, zones: ZoneRegistry, state_dir: &Path) -> Self {
        Self {
            engine,
            zones,
            backup: BackupStore::in_dir(state_dir),
            lock_path: state_dir.join(LOCK_FILE_NAME),
            lock_mode: LockMode::default(),
            doh_list: None,
            resolver_port: DEFAULT_RESOLVER_PORT,
            state: ControllerState::Idle,
            last_outcome: None,
        }
    }

    #[must_use]
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    #[must_use]
    pub fn with_doh_list(mut self, path: Option<PathBuf>) -> Self {
        self.doh_list = path;
        self
    }

    #[must_use]
    pub fn with_resolver_port(mut self, port: u16) -> Self {
        self.resolver_port = port;
        self
    }

    /// Current state. Outside a locked scope this is always `Idle`.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// How the most recent transaction or restore ended.
    pub fn last_outcome(&self) -> Option<Outcome> {
        self.last_outcome
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn zones(&self) -> &ZoneRegistry {
        &self.zones
    }

    pub fn backup(&self) -> &BackupStore {
        &self.backup
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Runs `batch` under the policy lock, committing if it returns `Ok`.
    pub fn transaction<T>(
        &mut self,
        batch: impl FnOnce(&mut Session<'_, E>) -> Result<T>,
    ) -> Result<T> {
        self.run(self.lock_mode, batch)
    }

    /// Like [`Self::transaction`], but fails with [`Error::LockUnavailable`]
    /// instead of waiting for another holder.
    pub fn try_transaction<T>(
        &mut self,
        batch: impl FnOnce(&mut Session<'_, E>) -> Result<T>,
    ) -> Result<T> {
        self.run(LockMode::NonBlocking, batch)
    }

    /// Persists the live ruleset under the lock.
    pub fn commit(&mut self) -> Result<()> {
        self.transaction(|_| Ok(()))
    }

    /// Loads the backup into the engine under the lock, without re-committing.
    pub fn restore(&mut self) -> Result<()> {
        let mode = self.lock_mode;
        let mut scope = Scope::enter(self, mode)?;
        scope.controller.load_backup()?;
        scope.finish(Outcome::Restored);
        Ok(())
    }

    fn run<T>(
        &mut self,
        mode: LockMode,
        batch: impl FnOnce(&mut Session<'_, E>) -> Result<T>,
    ) -> Result<T> {
        let mut scope = Scope::enter(self, mode)?;

        scope.controller.state = ControllerState::Mutating;
        let result = batch(&mut Session {
            controller: &mut *scope.controller,
        });

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!("Mutation batch failed, ruleset not persisted: {e}");
                scope.finish(Outcome::Aborted);
                return Err(e);
            }
        };

        match scope.controller.persist() {
            Ok(()) => {
                scope.finish(Outcome::Committed);
                Ok(value)
            }
            Err(e) => {
                warn!("Commit failed: {e}");
                scope.finish(Outcome::Aborted);
                Err(e)
            }
        }
    }

    /// Applies the base topology, with the configured DoH list and resolver
    /// port, straight to the engine. Takes no lock and commits nothing; inside
    /// a transaction use [`Session::apply_defaults`].
    pub fn build_topology(&mut self) -> BuildReport {
        let doh = self
            .doh_list
            .as_deref()
            .map(DohList::load_or_skip)
            .unwrap_or_default();

        TopologyBuilder::new(&self.zones)
            .with_doh_list(&doh)
            .with_resolver_port(self.resolver_port)
            .apply(&mut self.engine)
    }

    fn persist(&mut self) -> Result<()> {
        let dump = self
            .engine
            .dump_ruleset(None)
            .map_err(|e| Error::PersistFailed(format!("ruleset dump failed: {e}")))?;
        self.backup.write(&dump)
    }

    fn load_backup(&mut self) -> Result<()> {
        let dump = self.backup.read()?;
        self.engine.load_ruleset(&dump)?;
        info!("Ruleset restored from {}", self.backup.path().display());
        Ok(())
    }
}

/// Mutation handle valid while the policy lock is held.
///
/// Every call goes straight to the live engine and fails fast; positions are
/// never cached, so deleting at `p` shifts every later rule down by one.
pub struct Session<'c, E: PacketFilter> {
    controller: &'c mut MutationController<E>,
}

impl<E: PacketFilter> Session<'_, E> {
    /// Builds the base topology. Best-effort: failures land in the report.
    pub fn apply_defaults(&mut self) -> BuildReport {
        self.controller.build_topology()
    }

    pub fn add_rule(&mut self, rule: &FilterRule) -> Result<()> {
        let ops = RuleTranslator::new(&self.controller.zones).to_insert_ops(rule)?;
        self.apply_all(&ops)
    }

    pub fn delete_rule(&mut self, chain: FilterChain, position: u32) -> Result<()> {
        let op = RuleTranslator::new(&self.controller.zones).filter_delete_op(chain, position)?;
        self.apply(&op)
    }

    pub fn add_nat(&mut self, rule: &NatRule) -> Result<()> {
        let ops = RuleTranslator::new(&self.controller.zones).nat_insert_ops(rule)?;
        self.apply_all(&ops)
    }

    pub fn delete_nat(&mut self, nat_type: NatType, position: u32) -> Result<()> {
        let op = RuleTranslator::new(&self.controller.zones).nat_delete_op(nat_type, position)?;
        self.apply(&op)
    }

    /// Applies a raw primitive call.
    pub fn apply(&mut self, op: &PrimitiveOp) -> Result<()> {
        debug!("apply: {op}");
        op.apply(&mut self.controller.engine)
    }

    /// Replaces the live ruleset with the last committed backup.
    pub fn restore(&mut self) -> Result<()> {
        self.controller.load_backup()
    }

    pub fn state(&self) -> ControllerState {
        self.controller.state
    }

    pub fn engine(&self) -> &E {
        &self.controller.engine
    }

    pub fn zones(&self) -> &ZoneRegistry {
        &self.controller.zones
    }

    fn apply_all(&mut self, ops: &[PrimitiveOp]) -> Result<()> {
        for op in ops {
            self.apply(op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{Protocol, Table};
    use crate::core::memory::MemoryEngine;
    use crate::core::policy::RuleAction;
    use crate::core::test_helpers::{lan_rule, test_controller};
    use crate::core::zones::Zone;
    use tempfile::TempDir;

    #[test]
    fn test_successful_batch_commits() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());

        controller
            .transaction(|s| {
                s.apply_defaults();
                s.add_rule(&lan_rule(1, 22))
            })
            .unwrap();

        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.last_outcome(), Some(Outcome::Committed));
        let backup = std::fs::read_to_string(controller.backup().path()).unwrap();
        assert!(backup.contains("-A LAN_INTERFACE -s 192.168.1.0/24 -d 0.0.0.0/0 -p tcp --dport 22 -j ACCEPT"));
        assert!(controller.backup().checksum_path().exists());
    }

    #[test]
    fn test_failed_batch_does_not_persist_or_roll_back() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());
        controller.transaction(|s| Ok(s.apply_defaults())).unwrap();
        let committed = std::fs::read(controller.backup().path()).unwrap();

        let err = controller
            .transaction(|s| {
                s.add_rule(&lan_rule(1, 80))?;
                // LAN_INTERFACE has one rule; position 5 is out of range
                s.delete_rule(FilterChain::Zone(Zone::Lan), 5)
            })
            .unwrap_err();

        assert!(matches!(err, Error::PrimitiveCallFailed { .. }));
        assert_eq!(controller.last_outcome(), Some(Outcome::Aborted));
        assert_eq!(std::fs::read(controller.backup().path()).unwrap(), committed);
        // The first mutation stays live
        assert_eq!(
            controller.engine().rule_count(Table::Filter, "LAN_INTERFACE"),
            1
        );
    }

    #[test]
    fn test_validation_happens_before_mutation() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());
        let mut rule = lan_rule(1, 22);
        rule.protocol = Protocol::Udp;
        rule.dst_port = None;

        let before = controller.engine().calls().len();
        let err = controller.transaction(|s| s.add_rule(&rule)).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(controller.engine().calls().len(), before);
        assert!(!controller.backup().exists());
    }

    #[test]
    fn test_lock_contention_without_waiting() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());

        let holder = PolicyLock::acquire(controller.lock_path(), LockMode::Blocking).unwrap();
        let err = controller.try_transaction(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::LockUnavailable(_)));
        assert_eq!(err.kind().exit_code(), 13);

        drop(holder);
        controller.try_transaction(|_| Ok(())).unwrap();
        assert_eq!(controller.last_outcome(), Some(Outcome::Committed));
    }

    #[test]
    fn test_lock_released_after_panicking_batch() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = controller.transaction(|_| -> Result<()> { panic!("batch exploded") });
        }));
        assert!(panicked.is_err());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.last_outcome(), Some(Outcome::Aborted));

        let lock = PolicyLock::acquire(controller.lock_path(), LockMode::NonBlocking);
        assert!(lock.is_ok());
    }

    #[test]
    fn test_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());
        controller
            .transaction(|s| {
                s.apply_defaults();
                s.add_rule(&lan_rule(1, 443))
            })
            .unwrap();

        controller
            .engine_mut()
            .flush_chain(Table::Filter, "LAN_INTERFACE")
            .unwrap();
        assert_eq!(controller.engine().rule_count(Table::Filter, "LAN_INTERFACE"), 0);

        controller.restore().unwrap();
        assert_eq!(controller.engine().rule_count(Table::Filter, "LAN_INTERFACE"), 1);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.last_outcome(), Some(Outcome::Restored));
    }

    #[test]
    fn test_restore_without_backup_fails() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());
        let err = controller.restore().unwrap_err();
        assert_eq!(err.kind().exit_code(), 16);
    }

    #[test]
    fn test_commit_failure_is_persist_failed() {
        let dir = TempDir::new().unwrap();
        let zones = crate::core::test_helpers::test_registry();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let mut controller = MutationController::new(MemoryEngine::new(), zones, &state_dir);

        // Backup target is a directory, so the rename fails
        std::fs::create_dir(controller.backup().path()).unwrap();
        let err = controller
            .transaction(|s| {
                s.apply_defaults();
                s.add_rule(&FilterRule {
                    action: RuleAction::Drop,
                    ..lan_rule(1, 25)
                })
            })
            .unwrap_err();
        assert!(matches!(err, Error::PersistFailed(_)));
        assert_eq!(controller.last_outcome(), Some(Outcome::Aborted));

        // The lock is free again after the failed commit
        std::fs::remove_dir(controller.backup().path()).unwrap();
        controller.try_transaction(|_| Ok(())).unwrap();
        assert_eq!(controller.last_outcome(), Some(Outcome::Committed));
    }

    #[test]
    fn test_states_through_a_scope() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.last_outcome(), None);

        let inside = controller.transaction(|s| Ok(s.state())).unwrap();
        assert_eq!(inside, ControllerState::Mutating);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_lock_released_after_failed_batch() {
        let dir = TempDir::new().unwrap();
        let mut controller = test_controller(dir.path());

        let err = controller
            .transaction(|s| s.delete_rule(FilterChain::Global, 1))
            .unwrap_err();
        assert_eq!(err.kind().exit_code(), 12);
        assert_eq!(controller.state(), ControllerState::Idle);

        controller.try_transaction(|_| Ok(())).unwrap();
        assert_eq!(controller.last_outcome(), Some(Outcome::Committed));
    }

    #[test]
    fn test_blocking_transaction_waits_for_holder() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let dir = TempDir::new().unwrap();
        let holder =
            PolicyLock::acquire(&dir.path().join(LOCK_FILE_NAME), LockMode::Blocking).unwrap();
        let entered = Arc::new(AtomicBool::new(false));

        let waiter = {
            let entered = Arc::clone(&entered);
            let state_dir = dir.path().to_path_buf();
            std::thread::spawn(move || {
                let mut controller = test_controller(&state_dir);
                controller
                    .transaction(|_| {
                        entered.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                    .map(|()| controller.last_outcome())
            })
        };

        std::thread::sleep(Duration::from_millis(300));
        assert!(!entered.load(Ordering::SeqCst), "waiter ran while the lock was held");

        drop(holder);
        let outcome = waiter.join().unwrap().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(outcome, Some(Outcome::Committed));
    }

    #[test]
    fn test_build_topology_includes_doh_list() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("doh.ips");
        std::fs::write(&list, "1.1.1.1\n").unwrap();
        let mut controller = test_controller(dir.path()).with_doh_list(Some(list));

        let report = controller.build_topology();
        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(
            controller.engine().rules(Table::Filter, crate::core::blocklist::DOH_CHAIN).unwrap(),
            ["-d 1.1.1.1/32 -p tcp --dport 443 -j REJECT --reject-with tcp-reset"]
        );
        // Nothing was locked or persisted
        assert_eq!(controller.last_outcome(), None);
        assert!(!controller.backup().exists());
    }
}
