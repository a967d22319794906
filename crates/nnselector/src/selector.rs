// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Client-side selection of an active metadata server.
//!
//! The server list and the blacklist are immutable snapshots swapped
//! atomically, so `next()` never sees a half-updated list. One background
//! task refreshes the list on a timer or when woken; every reconciliation,
//! whether periodic or requested, is serialized.

use crate::client::{Connector, MembershipClient};
use crate::config::{Policy, SelectorConfig, validate_config};
use crate::error::{Result, SelectorError};
use crate::handle::ServerHandle;
use crate::server::ActiveServerList;
use arc_swap::ArcSwap;
use diagnostics::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Draws per `next()` call under the random policy.
const RANDOM_DRAWS: usize = 10;

type Handles<C> = Vec<ServerHandle<<C as Connector>::Client>>;

struct Shared<C: Connector> {
    config: SelectorConfig,
    connector: C,
    servers: ArcSwap<Handles<C>>,
    blacklist: ArcSwap<Handles<C>>,
    cursor: Mutex<usize>,
    rng: Mutex<StdRng>,
    wake: Notify,
    wakes: AtomicU64,
    refreshing: AsyncMutex<()>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

fn listed<H: MembershipClient>(list: &[ServerHandle<H>], handle: &ServerHandle<H>) -> bool {
    list.iter().any(|entry| entry == handle)
}

fn joined<H: MembershipClient>(handles: &[ServerHandle<H>]) -> String {
    handles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl<C: Connector> Shared<C> {
    fn wake(&self) {
        _ = self.wakes.fetch_add(1, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn pick_round_robin(
        &self,
        servers: &[ServerHandle<C::Client>],
        blacklist: &[ServerHandle<C::Client>],
    ) -> Option<ServerHandle<C::Client>> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let mut index = *cursor;
        for _ in 0..=servers.len() {
            index = (index + 1) % servers.len();
            let candidate = &servers[index];
            if !listed(blacklist, candidate) {
                *cursor = index;
                return Some(candidate.clone());
            }
        }
        None
    }

    fn pick_random(
        &self,
        servers: &[ServerHandle<C::Client>],
        blacklist: &[ServerHandle<C::Client>],
    ) -> Option<ServerHandle<C::Client>> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..RANDOM_DRAWS {
            let candidate = &servers[rng.gen_range(0..servers.len())];
            if !listed(blacklist, candidate) {
                return Some(candidate.clone());
            }
        }
        None
    }

    async fn run(self: Arc<Self>) {
        let period = self.config.refresh_period();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(period) => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.refresh().await {
                let error = err.to_string();
                warn!("namenode list refresh failed: {error}");
            }
        }
        debug!("namenode list refresher stopped");
    }

    async fn refresh(&self) -> Result<()> {
        let _serial = self.refreshing.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            debug!("selector closed, skipping refresh");
            return Ok(());
        }

        let list = match self.query_known().await {
            Some(list) => list,
            None => self.bootstrap().await?,
        };
        self.reconcile(list).await;
        Ok(())
    }

    /// Asks the connected servers for the membership, healthy ones first.
    async fn query_known(&self) -> Option<ActiveServerList> {
        let servers = self.servers.load_full();
        let blacklist = self.blacklist.load_full();
        let (healthy, suspect): (Vec<_>, Vec<_>) = servers
            .iter()
            .partition(|handle| !listed(&blacklist, handle));

        for handle in healthy.into_iter().chain(suspect) {
            let server = handle.server().to_string();
            match handle.client().active_servers().await {
                Ok(list) if !list.is_empty() => return Some(list),
                Ok(_) => debug!("{server} reported an empty namenode list"),
                Err(err) => {
                    let error = err.to_string();
                    debug!("{server} could not report namenodes: {error}");
                }
            }
        }
        None
    }

    /// Fetches the membership from the primary endpoint, then from each
    /// candidate in turn, until one returns a non-empty list.
    async fn bootstrap(&self) -> Result<ActiveServerList> {
        for endpoint in self.config.bootstrap_endpoints() {
            match self.fetch_from(endpoint).await {
                Ok(list) if !list.is_empty() => {
                    let count = list.len();
                    debug!("bootstrapped {count} namenodes from {endpoint}");
                    return Ok(list);
                }
                Ok(_) => debug!("{endpoint} reported an empty namenode list"),
                Err(err) => {
                    let error = err.to_string();
                    warn!("failed to get namenode list from {endpoint}: {error}");
                }
            }
        }
        Err(SelectorError::Membership(
            "no bootstrap endpoint returned active namenodes".to_string(),
        ))
    }

    async fn fetch_from(&self, endpoint: &str) -> Result<ActiveServerList> {
        let client = self.connector.connect(endpoint).await?;
        let list = client.active_servers().await;
        client.close();
        list
    }

    /// Replaces the server list with `list`, keeping the connections of
    /// servers present in both. A kept server takes the id and hostname
    /// the new list reports for its address.
    async fn reconcile(&self, list: ActiveServerList) {
        let current = self.servers.load_full();
        let mut next: Handles<C> = current
            .iter()
            .filter_map(|handle| {
                let reported = list.find(handle.address())?;
                let known = handle.server();
                if reported.id == known.id && reported.hostname == known.hostname {
                    return Some(handle.clone());
                }
                let (was, now) = (known.to_string(), reported.to_string());
                debug!("namenode {was} is now {now}");
                Some(handle.redescribed(reported.clone()))
            })
            .collect();
        let removed = (current.len() - next.len()) as u64;

        let mut added = 0u64;
        for server in &list {
            if current.iter().any(|handle| handle.address() == server.address()) {
                continue;
            }
            let endpoint = server.endpoint();
            match self.connector.connect(&endpoint).await {
                Ok(client) => {
                    next.push(ServerHandle::new(server.clone(), client));
                    added += 1;
                }
                Err(err) => {
                    let error = err.to_string();
                    warn!("unable to connect to namenode {endpoint}: {error}");
                }
            }
        }
        next.sort_by_key(ServerHandle::id);

        let connected = next.len() as u64;
        self.servers.store(Arc::new(next));
        self.blacklist.store(Arc::new(Vec::new()));
        drop(current);
        info!("namenode list refreshed: {added} added, {removed} removed, {connected} connected");
    }
}

/// Picks active servers for client calls and keeps their list current.
pub struct NamenodeSelector<C: Connector> {
    shared: Arc<Shared<C>>,
    worker: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> NamenodeSelector<C> {
    /// Bootstraps the server list and starts the background refresh.
    ///
    /// A failed bootstrap is logged, not returned: the selector starts
    /// empty and `next()` reports no alive server until a refresh succeeds.
    pub async fn start(config: SelectorConfig, connector: C) -> Result<Self> {
        validate_config(&config).map_err(|err| SelectorError::Config(err.to_string()))?;

        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let shared = Arc::new(Shared {
            config,
            connector,
            servers: ArcSwap::from_pointee(Vec::new()),
            blacklist: ArcSwap::from_pointee(Vec::new()),
            cursor: Mutex::new(0),
            rng: Mutex::new(rng),
            wake: Notify::new(),
            wakes: AtomicU64::new(0),
            refreshing: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        if let Err(err) = shared.refresh().await {
            let error = err.to_string();
            warn!("initial namenode list unavailable: {error}");
        }
        let policy = shared.config.policy.to_string();
        let count = shared.servers.load().len() as u64;
        info!("namenode selector started with {count} namenodes, policy {policy}");

        let worker = tokio::spawn(Shared::run(shared.clone()));
        Ok(Self {
            shared,
            worker: AsyncMutex::new(Some(worker)),
        })
    }

    pub fn policy(&self) -> Policy {
        self.shared.config.policy
    }

    /// Next server according to the policy, skipping blacklisted ones.
    ///
    /// Fails with [`SelectorError::NoAliveServer`] and wakes the refresher
    /// when the list is empty or no eligible server was found.
    pub fn next(&self) -> Result<ServerHandle<C::Client>> {
        let servers = self.shared.servers.load_full();
        if servers.is_empty() {
            self.shared.wake();
            return Err(SelectorError::NoAliveServer(
                "namenode list is empty, refresh requested".to_string(),
            ));
        }

        let blacklist = self.shared.blacklist.load_full();
        let picked = match self.shared.config.policy {
            Policy::RoundRobin => self.shared.pick_round_robin(&servers, &blacklist),
            Policy::Random => self.shared.pick_random(&servers, &blacklist),
        };
        picked.ok_or_else(|| {
            self.shared.wake();
            SelectorError::NoAliveServer(
                "no eligible namenode, refresh requested".to_string(),
            )
        })
    }

    /// Every connected server, ordered by id.
    pub fn all_servers(&self) -> Result<Vec<ServerHandle<C::Client>>> {
        let servers = self.shared.servers.load_full();
        if servers.is_empty() {
            self.shared.wake();
            return Err(SelectorError::NoAliveServer(
                "namenode list is empty, refresh requested".to_string(),
            ));
        }
        Ok(servers.to_vec())
    }

    /// The server with the lowest id.
    pub fn leader(&self) -> Result<ServerHandle<C::Client>> {
        self.all_servers()?
            .into_iter()
            .next()
            .ok_or_else(|| SelectorError::NoAliveServer("no leader".to_string()))
    }

    pub fn connected_count(&self) -> usize {
        self.shared.servers.load().len()
    }

    /// Reports a failing server. It is skipped by `next()` until the next
    /// refresh, which is requested immediately.
    pub fn blacklist(&self, handle: &ServerHandle<C::Client>) {
        let previous = self.shared.blacklist.rcu(|current| {
            if listed(current, handle) {
                Arc::clone(current)
            } else {
                let mut next = Vec::clone(current);
                next.push(handle.clone());
                Arc::new(next)
            }
        });
        if !listed(&previous, handle) {
            let server = handle.server().to_string();
            info!("blacklisted namenode {server}");
        }
        self.shared.wake();
    }

    pub fn blacklisted(&self) -> Vec<ServerHandle<C::Client>> {
        self.shared.blacklist.load().to_vec()
    }

    pub fn is_blacklisted(&self, handle: &ServerHandle<C::Client>) -> bool {
        listed(&self.shared.blacklist.load(), handle)
    }

    /// Connected and blacklisted servers, for logs.
    pub fn describe(&self) -> String {
        format!(
            "connected to namenodes: {}; blacklisted: {}",
            joined(&self.shared.servers.load_full()),
            joined(&self.shared.blacklist.load_full()),
        )
    }

    /// Runs one reconciliation on the caller's task.
    pub async fn refresh_now(&self) -> Result<()> {
        self.shared.refresh().await
    }

    /// Number of times the refresher was woken out of band.
    pub fn wake_count(&self) -> u64 {
        self.shared.wakes.load(Ordering::SeqCst)
    }

    /// Stops the background refresh and waits for it to exit. Idempotent.
    pub async fn stop_periodic_updates(&self) {
        self.shared.cancel.cancel();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                let error = err.to_string();
                warn!("namenode list refresher failed: {error}");
            }
        }
    }

    /// Stops the refresher and releases every connection. Idempotent.
    ///
    /// Handles still held by callers keep their connection open until they
    /// are dropped.
    pub async fn close(&self) {
        self.stop_periodic_updates().await;
        let _serial = self.shared.refreshing.lock().await;
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.shared.servers.load().len() as u64;
        self.shared.blacklist.store(Arc::new(Vec::new()));
        self.shared.servers.store(Arc::new(Vec::new()));
        info!("namenode selector closed, released {count} connections");
    }
}

impl<C: Connector> Drop for NamenodeSelector<C> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
