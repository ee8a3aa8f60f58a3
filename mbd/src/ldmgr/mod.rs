use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use crate::error::MbdError;
use crate::host::HostInventory;
use crate::ldmgr::policy::BalancePolicy;
use crate::ldmgr::state::{StateFile, StateRecord};
use crate::ve::{Backend, Ve, VeConfig, VeConfigPatch, VeInfo, VeType, ve_name_ok};

pub mod policies;
pub mod policy;
pub mod state;

// The load manager serializes every mutation of the VE registry through one
// worker thread. RPC tasks enqueue a typed request carrying a oneshot reply
// handle and wait on it, which keeps the caller's synchronous contract while
// the worker stays the only writer. The periodic rebalance rides on the
// request queue's receive timeout.

const REQUEST_QUEUE_DEPTH: usize = 256;

/// Constructs the knob backend for a VE being registered.
pub type MakeBackend = Box<dyn Fn(&str, VeType) -> Result<Backend, MbdError> + Send>;

type Reply = oneshot::Sender<Result<(), MbdError>>;

enum Request {
    Register {
        name: String,
        ve_type: u32,
        config: VeConfig,
        force: bool,
        reply: Reply,
    },
    Activate {
        name: String,
        reply: Reply,
    },
    Deactivate {
        name: String,
        reply: Reply,
    },
    Update {
        name: String,
        patch: VeConfigPatch,
        force: bool,
        reply: Reply,
    },
    Unregister {
        name: String,
        reply: Reply,
    },
    Shutdown {
        reply: Reply,
    },
}

pub struct LoadManager {
    tx: Sender<Request>,
    snapshot: Arc<Mutex<Vec<VeInfo>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LoadManager {
    pub fn start(
        policy: Box<dyn BalancePolicy>,
        host: Arc<HostInventory>,
        make_backend: MakeBackend,
        state: Option<StateFile>,
    ) -> Self {
        let (tx, rx) = channel::bounded(REQUEST_QUEUE_DEPTH);
        let snapshot = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker {
            rx,
            ves: Vec::new(),
            policy,
            host,
            make_backend,
            state,
            snapshot: snapshot.clone(),
            last_rebalance: None,
            next_rebalance: Instant::now(),
        };
        let handle = thread::spawn(move || worker.run());
        Self {
            tx,
            snapshot,
            worker: Mutex::new(Some(handle)),
        }
    }

    async fn submit(&self, make: impl FnOnce(Reply) -> Request) -> Result<(), MbdError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.try_send(make(reply)).is_err() {
            // queue full or worker gone; either way the operation didn't run
            error!("load manager request queue unavailable");
            return Err(MbdError::VeOperationFailed);
        }
        rx.await.unwrap_or(Err(MbdError::VeOperationFailed))
    }

    pub async fn register_ve(
        &self,
        name: &str,
        ve_type: u32,
        config: VeConfig,
        force: bool,
    ) -> Result<(), MbdError> {
        let name = name.to_string();
        self.submit(|reply| Request::Register {
            name,
            ve_type,
            config,
            force,
            reply,
        })
        .await
    }

    pub async fn activate_ve(&self, name: &str) -> Result<(), MbdError> {
        let name = name.to_string();
        self.submit(|reply| Request::Activate { name, reply }).await
    }

    pub async fn deactivate_ve(&self, name: &str) -> Result<(), MbdError> {
        let name = name.to_string();
        self.submit(|reply| Request::Deactivate { name, reply })
            .await
    }

    pub async fn update_ve(
        &self,
        name: &str,
        patch: VeConfigPatch,
        force: bool,
    ) -> Result<(), MbdError> {
        let name = name.to_string();
        self.submit(|reply| Request::Update {
            name,
            patch,
            force,
            reply,
        })
        .await
    }

    pub async fn unregister_ve(&self, name: &str) -> Result<(), MbdError> {
        let name = name.to_string();
        self.submit(|reply| Request::Unregister { name, reply })
            .await
    }

    /// Read the published registry snapshot; doesn't go through the worker.
    pub fn get_all_registered_ves(&self) -> Vec<VeInfo> {
        self.snapshot.lock().unwrap().clone()
    }

    /// Enqueue a shutdown behind all pending requests and wait for the
    /// worker to finish them and exit.
    pub async fn shutdown(&self) {
        let _ = self.submit(|reply| Request::Shutdown { reply }).await;
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

struct Worker {
    rx: Receiver<Request>,
    ves: Vec<Ve>,
    policy: Box<dyn BalancePolicy>,
    host: Arc<HostInventory>,
    make_backend: MakeBackend,
    state: Option<StateFile>,
    snapshot: Arc<Mutex<Vec<VeInfo>>>,
    last_rebalance: Option<Instant>,
    next_rebalance: Instant,
}

impl Worker {
    fn run(mut self) {
        self.restore_state();
        self.next_rebalance = Instant::now() + self.policy.timeout();
        loop {
            let timeout = self.next_rebalance.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(timeout) {
                Ok(Request::Shutdown { reply }) => {
                    let _ = reply.send(Ok(()));
                    break;
                }
                Ok(req) => self.handle(req),
                Err(RecvTimeoutError::Timeout) => {
                    self.refresh_stats();
                    self.balance(true);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("load manager worker exiting");
    }

    fn handle(&mut self, req: Request) {
        match req {
            Request::Register {
                name,
                ve_type,
                config,
                force,
                reply,
            } => {
                let r = self.do_register(name, ve_type, config, force);
                let _ = reply.send(r);
            }
            Request::Activate { name, reply } => {
                let r = self.do_activate(&name);
                if r.is_ok() {
                    self.balance(false);
                }
                let _ = reply.send(r);
            }
            Request::Deactivate { name, reply } => {
                let r = self.do_deactivate(&name);
                if r.is_ok() {
                    self.balance(false);
                }
                let _ = reply.send(r);
            }
            Request::Update {
                name,
                patch,
                force,
                reply,
            } => {
                let r = self.do_update(&name, patch, force);
                if r.is_ok() {
                    self.balance(false);
                }
                let _ = reply.send(r);
            }
            Request::Unregister { name, reply } => {
                let r = self.do_unregister(&name);
                if r.is_ok() {
                    self.balance(false);
                }
                let _ = reply.send(r);
            }
            Request::Shutdown { .. } => {}
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.ves.iter().position(|ve| ve.name() == name)
    }

    fn publish(&self) {
        *self.snapshot.lock().unwrap() = self.ves.iter().map(Ve::info).collect();
    }

    fn save_state(&self) {
        let Some(state) = &self.state else { return };
        let records: Vec<StateRecord> = self
            .ves
            .iter()
            .map(|ve| {
                let config = ve.config();
                StateRecord {
                    name: ve.name().to_string(),
                    ve_type: ve.ve_type().tag(),
                    guarantee: config.guarantee,
                    limit: config.limit,
                    swap: config.swap,
                }
            })
            .collect();
        if let Err(e) = state.save(&records) {
            error!("failed to save registry state: {}", e);
        }
    }

    fn restore_state(&mut self) {
        let Some(state) = &self.state else { return };
        let records = state.load();
        if records.is_empty() {
            return;
        }
        let mut n = 0;
        for rec in records {
            let config = VeConfig {
                guarantee: rec.guarantee,
                limit: rec.limit,
                swap: rec.swap,
            };
            match self.do_register(rec.name.clone(), rec.ve_type, config, true) {
                Ok(()) => n += 1,
                Err(e) => warn!("failed to restore VE '{}': {}", rec.name, e),
            }
        }
        info!("{} VE(s) restored from the previous run", n);
    }

    fn refresh_stats(&mut self) {
        // VM fetches go out to the hypervisor and can take tens of
        // milliseconds each, so fan them out over a few scoped threads and
        // join before anything else looks at the snapshots
        const FETCH_THREADS: usize = 4;
        let mut active: Vec<&mut Ve> = self.ves.iter_mut().filter(|v| v.active()).collect();
        if active.is_empty() {
            return;
        }
        let chunk = active.len().div_ceil(FETCH_THREADS);
        std::thread::scope(|s| {
            for group in active.chunks_mut(chunk) {
                s.spawn(move || {
                    for ve in group.iter_mut() {
                        // keep the previous snapshot on failure; an
                        // unreachable backend is not a reason to drop the VE
                        // from management
                        if let Err(e) = ve.update_stats() {
                            error!("failed to update stats for {}: {}", ve, e);
                        }
                    }
                });
            }
        });
    }

    /// The guarantee admission check: with `new_guarantee` substituted for
    /// the named VE (or added, for a registration), the guarantees of all
    /// registered VEs must fit in the pool.
    fn admission_ok(&mut self, subject: Option<&str>, new_guarantee: u64) -> bool {
        self.refresh_stats();
        let mut sum = new_guarantee as u128;
        for ve in &self.ves {
            if subject == Some(ve.name()) {
                continue;
            }
            sum += ve.config().guarantee as u128;
        }
        sum <= self.host.mem_available() as u128
    }

    fn do_register(
        &mut self,
        name: String,
        ve_type: u32,
        config: VeConfig,
        force: bool,
    ) -> Result<(), MbdError> {
        if !ve_name_ok(&name) {
            return Err(MbdError::InvalidVeName);
        }
        let ty = VeType::from_tag(ve_type).ok_or(MbdError::InvalidVeType)?;
        let config = config.sanitized()?;
        if self.find(&name).is_some() {
            return Err(MbdError::VeNameAlreadyInUse);
        }
        if !force && !self.admission_ok(None, config.guarantee) {
            return Err(MbdError::NoSpace);
        }
        let backend = (self.make_backend)(&name, ty)?;
        let ve = Ve::new(name, ty, config, self.host.total_ram, backend);
        info!("registered {} {}", ve, config);
        self.ves.push(ve);
        self.publish();
        self.save_state();
        Ok(())
    }

    fn do_activate(&mut self, name: &str) -> Result<(), MbdError> {
        let i = self.find(name).ok_or(MbdError::VeNotRegistered)?;
        let ve = &mut self.ves[i];
        if ve.active() {
            return Err(MbdError::VeAlreadyActive);
        }
        if let Err(e) = ve.activate() {
            error!("failed to activate {}: {}", ve, e);
            return Err(MbdError::VeOperationFailed);
        }
        self.policy.ve_activated(&mut self.ves[i]);
        info!("activated {}", self.ves[i]);
        self.publish();
        Ok(())
    }

    fn do_deactivate(&mut self, name: &str) -> Result<(), MbdError> {
        let i = self.find(name).ok_or(MbdError::VeNotRegistered)?;
        if !self.ves[i].active() {
            return Err(MbdError::VeNotActive);
        }
        self.ves[i].deactivate();
        self.policy.ve_deactivated(&mut self.ves[i]);
        info!("deactivated {}", self.ves[i]);
        self.publish();
        Ok(())
    }

    fn do_update(
        &mut self,
        name: &str,
        patch: VeConfigPatch,
        force: bool,
    ) -> Result<(), MbdError> {
        let i = self.find(name).ok_or(MbdError::VeNotRegistered)?;
        let config = patch.apply(self.ves[i].config()).sanitized()?;
        if !force && !self.admission_ok(Some(name), config.guarantee) {
            return Err(MbdError::NoSpace);
        }
        let ve = &mut self.ves[i];
        if let Err(e) = ve.set_config(config) {
            error!("failed to update {}: {}", ve, e);
            return Err(MbdError::VeOperationFailed);
        }
        self.policy.ve_config_updated(&mut self.ves[i]);
        info!("updated {} {}", self.ves[i], config);
        self.publish();
        self.save_state();
        Ok(())
    }

    fn do_unregister(&mut self, name: &str) -> Result<(), MbdError> {
        let i = self.find(name).ok_or(MbdError::VeNotRegistered)?;
        let ve = self.ves.remove(i);
        info!("unregistered {}", ve);
        self.publish();
        self.save_state();
        Ok(())
    }

    /// One balance cycle: run the policy over the active VEs and push the
    /// resulting bounds. A VE whose knobs fail is logged and dropped from
    /// management so it can't wedge the loop.
    fn balance(&mut self, stats_updated: bool) {
        let now = Instant::now();
        if let Some(last) = self.last_rebalance {
            debug!(
                "balance cycle ({:.1}s since last)",
                now.duration_since(last).as_secs_f64()
            );
        }
        self.last_rebalance = Some(now);

        let mem_avail = self.host.mem_available();
        let mut failed: Vec<String> = Vec::new();
        {
            let mut active: Vec<&mut Ve> = self.ves.iter_mut().filter(|v| v.active()).collect();
            if !active.is_empty() {
                let quotas = self.policy.balance(&mut active, mem_avail, stats_updated);
                for (ve, quota) in active.iter_mut().zip(quotas) {
                    let config = ve.config();
                    if let Err(e) = ve.apply_bounds(quota, quota, config.limit, config.swap) {
                        error!("failed to apply policy setting for {}: {}", ve, e);
                        failed.push(ve.name().to_string());
                    }
                }
            }
        }
        for name in failed {
            if let Some(i) = self.find(&name) {
                let ve = self.ves.remove(i);
                warn!("dropped unresponsive {}", ve);
                self.publish();
                self.save_state();
            }
        }

        self.next_rebalance = Instant::now() + self.policy.timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldmgr::policy::make_policy;
    use crate::ve::mock::MockBackend;
    use std::collections::HashMap;
    use std::time::Duration;

    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    type Mocks = Arc<Mutex<HashMap<String, MockBackend>>>;

    fn mock_factory() -> (Mocks, MakeBackend) {
        let mocks: Mocks = Arc::new(Mutex::new(HashMap::new()));
        let m = mocks.clone();
        let f: MakeBackend = Box::new(move |name, _ty| {
            let mut map = m.lock().unwrap();
            let be = map
                .entry(name.to_string())
                .or_insert_with(MockBackend::new)
                .clone();
            Ok(Backend::Mock(be))
        });
        (mocks, f)
    }

    fn test_host(pool: u64) -> Arc<HostInventory> {
        Arc::new(HostInventory {
            total_ram: 16 * GIB,
            host_reserve: 0,
            sys_reserve: 0,
            user_reserve: 0,
            ve_pool: pool,
        })
    }

    fn start(pool: u64, policy: &str, interval: Duration) -> (LoadManager, Mocks) {
        let (mocks, factory) = mock_factory();
        let mgr = LoadManager::start(
            make_policy(policy, interval).unwrap(),
            test_host(pool),
            factory,
            None,
        );
        (mgr, mocks)
    }

    fn cfg(guarantee: u64, limit: u64) -> VeConfig {
        VeConfig {
            guarantee,
            limit,
            swap: 0,
        }
    }

    // long interval: only event-driven balances happen during these tests
    const IDLE: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn register_validation() {
        let (mgr, _) = start(8 * GIB, "static", IDLE);
        assert_eq!(
            mgr.register_ve("", 0, cfg(0, GIB), false).await,
            Err(MbdError::InvalidVeName)
        );
        assert_eq!(
            mgr.register_ve("a/b", 0, cfg(0, GIB), false).await,
            Err(MbdError::InvalidVeName)
        );
        assert_eq!(
            mgr.register_ve("a", 9, cfg(0, GIB), false).await,
            Err(MbdError::InvalidVeType)
        );
        assert_eq!(
            mgr.register_ve("a", 0, cfg(2 * GIB, GIB), false).await,
            Err(MbdError::InvalidVeConfig)
        );
        assert!(mgr.register_ve("a", 0, cfg(0, GIB), false).await.is_ok());
        assert_eq!(
            mgr.register_ve("a", 0, cfg(0, GIB), false).await,
            Err(MbdError::VeNameAlreadyInUse)
        );
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn guarantee_admission() {
        let (mgr, _) = start(2 * GIB, "static", IDLE);
        assert!(mgr.register_ve("a", 0, cfg(GIB, 4 * GIB), false).await.is_ok());
        assert!(mgr.register_ve("b", 0, cfg(GIB, 4 * GIB), false).await.is_ok());
        assert_eq!(
            mgr.register_ve("c", 0, cfg(GIB, 4 * GIB), false).await,
            Err(MbdError::NoSpace)
        );
        assert!(mgr.register_ve("c", 0, cfg(GIB, 4 * GIB), true).await.is_ok());
        assert_eq!(mgr.get_all_registered_ves().len(), 3);

        // updates are admission-checked the same way
        assert_eq!(
            mgr.update_ve(
                "a",
                VeConfigPatch {
                    guarantee: Some(2 * GIB),
                    ..Default::default()
                },
                false
            )
            .await,
            Err(MbdError::NoSpace)
        );
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn lifecycle_ordering() {
        let (mgr, _) = start(8 * GIB, "static", IDLE);

        assert!(mgr.register_ve("a", 0, cfg(0, GIB), false).await.is_ok());
        assert!(mgr.unregister_ve("a").await.is_ok());
        assert_eq!(
            mgr.activate_ve("a").await,
            Err(MbdError::VeNotRegistered)
        );

        assert!(mgr.register_ve("a", 0, cfg(0, GIB), false).await.is_ok());
        assert!(mgr.activate_ve("a").await.is_ok());
        assert_eq!(mgr.activate_ve("a").await, Err(MbdError::VeAlreadyActive));

        assert!(mgr.deactivate_ve("a").await.is_ok());
        assert_eq!(mgr.deactivate_ve("a").await, Err(MbdError::VeNotActive));

        assert!(mgr.unregister_ve("a").await.is_ok());
        assert_eq!(
            mgr.unregister_ve("a").await,
            Err(MbdError::VeNotRegistered)
        );
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn listing_preserves_registration_order() {
        let (mgr, _) = start(8 * GIB, "static", IDLE);
        for name in ["charlie", "alpha", "bravo"] {
            mgr.register_ve(name, 0, cfg(0, GIB), false).await.unwrap();
        }
        let names: Vec<String> = mgr
            .get_all_registered_ves()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, ["charlie", "alpha", "bravo"]);

        mgr.unregister_ve("alpha").await.unwrap();
        let names: Vec<String> = mgr
            .get_all_registered_ves()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, ["charlie", "bravo"]);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn static_balance_fits_in_pool() {
        let (mgr, mocks) = start(8 * GIB, "static", IDLE);
        mgr.register_ve("a", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.register_ve("b", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.activate_ve("a").await.unwrap();
        mgr.activate_ve("b").await.unwrap();

        // balance ran before activate returned: quota == limit for both
        let mocks = mocks.lock().unwrap();
        for name in ["a", "b"] {
            let s = mocks[name].state();
            assert_eq!(s.low, 4 * GIB, "{} low", name);
            assert_eq!(s.high, 4 * GIB, "{} high", name);
            assert_eq!(s.max, 4 * GIB, "{} max", name);
        }
        drop(mocks);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn static_balance_overcommit() {
        let (mgr, mocks) = start(6 * GIB, "static", IDLE);
        mgr.register_ve("a", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.register_ve("b", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.activate_ve("a").await.unwrap();
        mgr.activate_ve("b").await.unwrap();

        let mocks = mocks.lock().unwrap();
        let qa = mocks["a"].state().low;
        let qb = mocks["b"].state().low;
        assert_eq!(qa, qb);
        assert!(qa.abs_diff(3 * GIB) < MIB, "qa = {}", qa);
        drop(mocks);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn update_with_identical_config_changes_nothing() {
        let (mgr, mocks) = start(8 * GIB, "static", IDLE);
        mgr.register_ve("a", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.activate_ve("a").await.unwrap();
        let before = mgr.get_all_registered_ves();
        let low_before = mocks.lock().unwrap()["a"].state().low;

        mgr.update_ve(
            "a",
            VeConfigPatch {
                guarantee: Some(GIB),
                limit: Some(4 * GIB),
                swap: Some(0),
            },
            false,
        )
        .await
        .unwrap();

        assert_eq!(mgr.get_all_registered_ves(), before);
        assert_eq!(mocks.lock().unwrap()["a"].state().low, low_before);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn knob_failure_drops_ve_from_management() {
        let (mgr, mocks) = start(8 * GIB, "static", IDLE);
        mgr.register_ve("a", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.register_ve("x", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.activate_ve("a").await.unwrap();
        mgr.activate_ve("x").await.unwrap();
        assert_eq!(mgr.get_all_registered_ves().len(), 2);

        mocks.lock().unwrap()["x"].state().fail_high = true;
        // any event balance will now hit the bad knob
        mgr.update_ve("a", VeConfigPatch::default(), false)
            .await
            .unwrap();

        let names: Vec<String> = mgr
            .get_all_registered_ves()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, ["a"]);

        // and the name is free again
        mocks.lock().unwrap().remove("x");
        assert!(mgr.register_ve("x", 0, cfg(0, GIB), false).await.is_ok());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn stats_fetch_failure_keeps_ve_registered() {
        let (mgr, mocks) = start(8 * GIB, "static", IDLE);
        mgr.register_ve("a", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.activate_ve("a").await.unwrap();
        mocks.lock().unwrap()["a"].state().fail_fetch = true;

        // update triggers an admission stat refresh and a balance
        mgr.update_ve("a", VeConfigPatch::default(), false)
            .await
            .unwrap();
        assert_eq!(mgr.get_all_registered_ves().len(), 1);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_rebalance_refreshes_stats() {
        let (mgr, mocks) = start(8 * GIB, "static", Duration::from_millis(30));
        mgr.register_ve("a", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.activate_ve("a").await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let fetches = mocks.lock().unwrap()["a"].state().fetches;
        assert!(fetches >= 2, "fetches = {}", fetches);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn wfb_thrashing_ve_gets_more_memory() {
        let (mgr, mocks) = start(4 * GIB, "wfb", Duration::from_millis(25));
        mgr.register_ve("busy", 0, cfg(512 * MIB, 4 * GIB), false)
            .await
            .unwrap();
        mgr.register_ve("idle", 0, cfg(512 * MIB, 4 * GIB), false)
            .await
            .unwrap();

        {
            let mocks = mocks.lock().unwrap();
            let mut s = mocks["busy"].state();
            s.mem.memfree = 0;
            s.mem.actual = (512 * MIB) as i64;
            s.mem.majflt = 0;
            s.majflt_step = 500;
            s.io_step.rd_req = 500;
            drop(s);
            let mut s = mocks["idle"].state();
            s.mem.memfree = (500 * MIB) as i64;
            s.mem.actual = (512 * MIB) as i64;
        }

        mgr.activate_ve("busy").await.unwrap();
        mgr.activate_ve("idle").await.unwrap();

        // let a few periodic cycles run
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mocks = mocks.lock().unwrap();
        let busy_quota = mocks["busy"].state().low;
        let idle_quota = mocks["idle"].state().low;
        assert!(busy_quota > idle_quota, "busy = {} idle = {}", busy_quota, idle_quota);
        assert!(busy_quota > GIB, "busy = {}", busy_quota);
        // settlement kept the total near the pool
        let sum = busy_quota + idle_quota;
        assert!(sum.abs_diff(4 * GIB) <= 64 * MIB, "sum = {}", sum);
        drop(mocks);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn state_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let (_, factory) = mock_factory();
        let mgr = LoadManager::start(
            make_policy("static", IDLE).unwrap(),
            test_host(8 * GIB),
            factory,
            Some(StateFile::new(&path)),
        );
        mgr.register_ve("a", 0, cfg(GIB, 4 * GIB), false).await.unwrap();
        mgr.register_ve("b", 1, cfg(0, u64::MAX), false).await.unwrap();
        mgr.activate_ve("a").await.unwrap();
        mgr.shutdown().await;

        let (_, factory) = mock_factory();
        let mgr = LoadManager::start(
            make_policy("static", IDLE).unwrap(),
            test_host(8 * GIB),
            factory,
            Some(StateFile::new(&path)),
        );
        // worker restores asynchronously before serving requests; any
        // round-trip through the queue orders us behind it
        mgr.update_ve("a", VeConfigPatch::default(), false)
            .await
            .unwrap();

        let infos = mgr.get_all_registered_ves();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "a");
        assert_eq!(infos[0].config.guarantee, GIB);
        // VEs come back registered but inactive
        assert!(!infos[0].active);
        assert_eq!(infos[1].name, "b");
        assert_eq!(infos[1].ve_type, VeType::Vm);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, b"MBDSgarbagegarbage").unwrap();

        let (_, factory) = mock_factory();
        let mgr = LoadManager::start(
            make_policy("static", IDLE).unwrap(),
            test_host(8 * GIB),
            factory,
            Some(StateFile::new(&path)),
        );
        mgr.register_ve("a", 0, cfg(0, GIB), false).await.unwrap();
        assert_eq!(mgr.get_all_registered_ves().len(), 1);
        mgr.shutdown().await;
    }
}
