use crate::{
    backend::Annotations,
    k8s::{self, ServiceAccount},
    reconcile::{self, Reconciler},
};
use anyhow::{bail, Result};
use futures::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::{hash_map::Entry, HashMap},
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, instrument, warn};
use vkcc_core::{backoff::ExponentialBackoff, IdentityRef};


pub struct Index {
    /// One reconciler per enabled backend.
    reconcilers: Vec<Reconciler>,

    /// The annotations of every ServiceAccount in the cluster.
    cache: HashMap<IdentityRef, Annotations>,

    /// Accumulates ServiceAccounts while the watch is (re)listing.
    relisting: Option<HashMap<IdentityRef, Annotations>>,

    /// Retries and periodic garbage collection, keyed by task so that each task is pending at
    /// most once.
    queue: DelayQueue<Task>,
    pending: HashMap<Task, Pending>,

    backoff: ExponentialBackoff,
    rng: StdRng,
    gc_interval: Option<Duration>,

    /// Backends whose initial garbage collection has not yet succeeded.
    initial_gc: Vec<usize>,
    synced: bool,
    ready: watch::Sender<bool>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
enum Task {
    Reconcile { backend: usize, id: IdentityRef },
    CollectGarbage { backend: usize },
}

#[derive(Debug)]
struct Pending {
    key: delay_queue::Key,
    failures: u32,
}

// === impl Index ===

impl Index {
    pub(crate) fn new(
        reconcilers: Vec<Reconciler>,
        backoff: ExponentialBackoff,
        gc_interval: Option<Duration>,
        ready: watch::Sender<bool>,
    ) -> Self {
        let initial_gc = (0..reconcilers.len()).collect();
        Self {
            reconcilers,
            cache: HashMap::default(),
            relisting: None,
            queue: DelayQueue::new(),
            pending: HashMap::default(),
            backoff,
            rng: StdRng::from_entropy(),
            gc_interval,
            initial_gc,
            synced: false,
            ready,
        }
    }

    /// Drives reconciliation for all backends.
    ///
    /// This is all driven on a single task, so no reconcile or garbage collection runs concurrently
    /// with another. Failed tasks are requeued with backoff. Returns when the drain signal fires,
    /// or with an error if the watch terminates.
    pub(crate) async fn index(
        mut self,
        mut service_accounts: k8s::Watch<ServiceAccount>,
        drain: drain::Watch,
    ) -> Result<()> {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _release = &mut shutdown => {
                    info!("Shutting down");
                    return Ok(());
                }

                ev = service_accounts.recv() => match ev {
                    Some(ev) => self.handle(ev).await,
                    None => bail!("ServiceAccount watch terminated"),
                },

                Some(expired) = self.queue.next(), if !self.queue.is_empty() => {
                    self.run_expired(expired.into_inner()).await;
                }
            }
        }
    }

    pub(crate) async fn handle(&mut self, ev: k8s::Event<ServiceAccount>) {
        match ev {
            k8s::Event::Apply(sa) => {
                if let Some(id) = k8s::identity(&sa) {
                    self.apply(id, k8s::annotations(sa)).await;
                }
            }

            k8s::Event::Delete(sa) => {
                if let Some(id) = k8s::identity(&sa) {
                    let cached = self.cache.remove(&id);
                    self.delete(id, cached, Some(k8s::annotations(sa))).await;
                }
            }

            k8s::Event::Init => {
                debug!("Relisting ServiceAccounts");
                self.relisting = Some(HashMap::default());
            }

            k8s::Event::InitApply(sa) => {
                if let Some(id) = k8s::identity(&sa) {
                    self.relisting
                        .get_or_insert_with(HashMap::default)
                        .insert(id, k8s::annotations(sa));
                }
            }

            k8s::Event::InitDone => {
                let listed = self.relisting.take().unwrap_or_default();
                self.reset(listed).await;
            }
        }
    }

    /// Handles a ServiceAccount that was created or updated.
    async fn apply(&mut self, id: IdentityRef, annotations: Annotations) {
        let old = self.cache.insert(id.clone(), annotations);
        if old.as_ref() == self.cache.get(&id) {
            debug!(ns = %id.namespace, name = %id.name, "Annotations unchanged");
            return;
        }

        for backend in 0..self.reconcilers.len() {
            let admitted = reconcile::admits(
                self.reconcilers[backend].backend(),
                &id,
                old.as_ref(),
                self.cache.get(&id),
            );
            if admitted {
                let task = Task::Reconcile {
                    backend,
                    id: id.clone(),
                };
                self.run(task, 0).await;
            }
        }
    }

    /// Handles a ServiceAccount that was deleted, given its last cached and final states.
    async fn delete(
        &mut self,
        id: IdentityRef,
        cached: Option<Annotations>,
        last: Option<Annotations>,
    ) {
        for backend in 0..self.reconcilers.len() {
            if reconcile::admits(
                self.reconcilers[backend].backend(),
                &id,
                cached.as_ref(),
                last.as_ref(),
            ) {
                let task = Task::Reconcile {
                    backend,
                    id: id.clone(),
                };
                self.run(task, 0).await;
            }
        }
    }

    /// Replaces the cache with a complete listing of ServiceAccounts.
    ///
    /// ServiceAccounts that changed while the watch was disconnected are handled as updates or
    /// deletions. The first listing triggers garbage collection for every backend.
    #[instrument(skip(self, listed), fields(service_accounts = listed.len()))]
    async fn reset(&mut self, listed: HashMap<IdentityRef, Annotations>) {
        let removed = self
            .cache
            .keys()
            .filter(|id| !listed.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        for id in removed {
            let cached = self.cache.remove(&id);
            self.delete(id, cached, None).await;
        }

        for (id, annotations) in listed {
            self.apply(id, annotations).await;
        }

        if !self.synced {
            self.synced = true;
            info!("Initial sync complete");
            for backend in 0..self.reconcilers.len() {
                self.run(Task::CollectGarbage { backend }, 0).await;
            }
            self.update_ready();
        }
    }

    /// Runs a task whose retry or periodic delay has elapsed.
    async fn run_expired(&mut self, task: Task) {
        let failures = self.pending.remove(&task).map_or(0, |p| p.failures);
        self.run(task, failures).await;
    }

    /// Runs a task, scheduling a retry if it fails.
    ///
    /// `failures` counts the task's consecutive prior failures.
    async fn run(&mut self, task: Task, failures: u32) {
        // The task runs now, so any pending retry is superseded.
        if let Some(p) = self.pending.remove(&task) {
            self.queue.remove(&p.key);
        }

        let res = match &task {
            Task::Reconcile { backend, id } => {
                let reconciler = &self.reconcilers[*backend];
                reconciler.reconcile(id, self.cache.get(id)).await
            }
            Task::CollectGarbage { backend } => self.reconcilers[*backend]
                .collect_garbage(&self.cache)
                .await
                .map(|_| ()),
        };

        match res {
            Ok(()) => {
                if let Task::CollectGarbage { backend } = task {
                    self.initial_gc.retain(|b| *b != backend);
                    self.update_ready();
                    if let Some(interval) = self.gc_interval {
                        self.schedule(task, interval, 0);
                    }
                }
            }
            Err(error) => {
                let delay = self.backoff.delay(failures, &mut self.rng);
                match &task {
                    Task::Reconcile { backend, id } => {
                        let reconciler = &self.reconcilers[*backend];
                        warn!(
                            backend = %reconciler.backend().name(),
                            ns = %id.namespace,
                            name = %id.name,
                            key = %reconciler.key(id),
                            ?error,
                            ?delay,
                            "Failed to reconcile"
                        );
                    }
                    Task::CollectGarbage { backend } => {
                        warn!(
                            backend = %self.reconcilers[*backend].backend().name(),
                            ?error,
                            ?delay,
                            "Failed to collect garbage"
                        );
                    }
                }
                self.schedule(task, delay, failures.saturating_add(1));
            }
        }
    }

    fn schedule(&mut self, task: Task, delay: Duration, failures: u32) {
        match self.pending.entry(task) {
            Entry::Occupied(mut e) => {
                self.queue.reset(&e.get().key, delay);
                e.get_mut().failures = failures;
            }
            Entry::Vacant(e) => {
                let key = self.queue.insert(e.key().clone(), delay);
                e.insert(Pending { key, failures });
            }
        }
    }

    fn update_ready(&mut self) {
        let ready = self.synced && self.initial_gc.is_empty();
        if ready && !*self.ready.borrow() {
            info!("Ready");
        }
        let _ = self.ready.send_if_modified(|r| std::mem::replace(r, ready) != ready);
    }
}
