//! Ordering of concurrent filesystem work by path.
//!
//! Every job names the paths it will create or replace. A job has
//! exclusive use of those paths and shared use of all of their ancestor
//! directories, so that `foo/a` and `foo/b` may be written at the same time
//! while replacing `foo` itself waits for both, and anything queued after
//! the replacement waits for it in turn.
//!
//! Keys are compared after lexical normalisation and lower-casing, so paths
//! that might collide on a case-insensitive filesystem are serialised too.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use tarstream::reservations::PathReservations;
//!
//! let reservations = PathReservations::new();
//! let held = Arc::new(Mutex::new(Vec::new()));
//!
//! let h = Arc::clone(&held);
//! reservations.reserve(["dir/file"], move |release| h.lock().unwrap().push(release));
//! let h = Arc::clone(&held);
//! let second = reservations.reserve(["DIR/FILE"], move |release| h.lock().unwrap().push(release));
//!
//! assert!(!reservations.is_running(second));
//! let first = held.lock().unwrap().remove(0);
//! drop(first);
//! assert!(reservations.is_running(second));
//! ```

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    future::Future,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use log::trace;
use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    paths::normalize,
};

/// Identifies one call to [`PathReservations::reserve`].
pub type ReservationId = u64;

type Job = Box<dyn FnOnce(Release) + Send>;

enum Slot {
    /// A job that creates or replaces this path.
    Exclusive(ReservationId),
    /// Jobs working somewhere below this directory.
    Shared(HashSet<ReservationId>),
}

struct Reservation {
    paths: Vec<String>,
    dirs: Vec<String>,
    job: Option<Job>,
}

#[derive(Default)]
struct Inner {
    next_id: ReservationId,
    queues: HashMap<String, VecDeque<Slot>>,
    reservations: HashMap<ReservationId, Reservation>,
    running: HashSet<ReservationId>,
}

impl Inner {
    fn register(&mut self, paths: Vec<String>, dirs: Vec<String>, job: Job) -> ReservationId {
        let id = self.next_id;
        self.next_id += 1;

        for path in &paths {
            self.queues
                .entry(path.clone())
                .or_default()
                .push_back(Slot::Exclusive(id));
        }
        for dir in &dirs {
            let queue = self.queues.entry(dir.clone()).or_default();
            match queue.back_mut() {
                Some(Slot::Shared(set)) => {
                    set.insert(id);
                }
                _ => queue.push_back(Slot::Shared(HashSet::from([id]))),
            }
        }

        self.reservations.insert(
            id,
            Reservation {
                paths,
                dirs,
                job: Some(job),
            },
        );
        id
    }

    fn is_eligible(&self, id: ReservationId) -> bool {
        let Some(res) = self.reservations.get(&id) else {
            return false;
        };
        let head = |key: &String| self.queues.get(key).and_then(VecDeque::front);
        res.paths
            .iter()
            .all(|p| matches!(head(p), Some(Slot::Exclusive(h)) if *h == id))
            && res
                .dirs
                .iter()
                .all(|d| matches!(head(d), Some(Slot::Shared(set)) if set.contains(&id)))
    }

    /// Mark `id` running if it may run, handing back its job.
    fn start(&mut self, id: ReservationId) -> Option<Job> {
        if self.running.contains(&id) || !self.is_eligible(id) {
            return None;
        }
        let job = self.reservations.get_mut(&id)?.job.take()?;
        trace!("reservation {id} running");
        self.running.insert(id);
        Some(job)
    }

    /// Drop `id` from every queue, returning the jobs that became runnable.
    fn release(&mut self, id: ReservationId) -> Vec<(ReservationId, Job)> {
        self.running.remove(&id);
        let Some(res) = self.reservations.remove(&id) else {
            return Vec::new();
        };
        trace!("reservation {id} released");

        let mut candidates = Vec::new();
        for key in res.paths.iter().chain(&res.dirs) {
            let Some(queue) = self.queues.get_mut(key) else {
                continue;
            };
            match queue.front_mut() {
                Some(Slot::Exclusive(h)) if *h == id => {
                    queue.pop_front();
                }
                Some(Slot::Shared(set)) => {
                    set.remove(&id);
                    if set.is_empty() {
                        queue.pop_front();
                    }
                }
                _ => {}
            }
            if queue.is_empty() {
                self.queues.remove(key);
                continue;
            }
            match queue.front() {
                Some(Slot::Exclusive(h)) => candidates.push(*h),
                Some(Slot::Shared(set)) => candidates.extend(set.iter().copied()),
                None => {}
            }
        }

        candidates.sort_unstable();
        candidates.dedup();
        candidates
            .into_iter()
            .filter_map(|id| Some((id, self.start(id)?)))
            .collect()
    }
}

/// A queue of jobs keyed by the paths they touch.
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone, Default)]
pub struct PathReservations {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for PathReservations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("PathReservations")
            .field("queues", &inner.queues.len())
            .field("pending", &inner.reservations.len())
            .field("running", &inner.running.len())
            .finish()
    }
}

impl PathReservations {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `job` behind every earlier job touching the same paths.
    ///
    /// The job runs as soon as it is first in line for each of `paths` and
    /// shares the head of the line for each of their ancestors; that may be
    /// right away, on the calling thread. It receives a [`Release`] that
    /// lets the next jobs run once dropped.
    pub fn reserve<I, P, F>(&self, paths: I, job: F) -> ReservationId
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        F: FnOnce(Release) + Send + 'static,
    {
        let (paths, dirs) = keys(paths);
        let (id, job) = {
            let mut inner = self.lock();
            let id = inner.register(paths, dirs, Box::new(job));
            trace!("reservation {id} queued");
            (id, inner.start(id))
        };
        if let Some(job) = job {
            job(self.release_guard(id));
        }
        id
    }

    /// Queue a reservation and wait for it.
    ///
    /// The reservation is queued when this is called, not when the future is
    /// first polled, so calls made in order are granted in order.
    pub fn reserve_async<I, P>(&self, paths: I) -> impl Future<Output = Result<Release>> + Send
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let (tx, rx) = oneshot::channel();
        self.reserve(paths, move |release| {
            // a dropped receiver hands the release straight back, freeing it
            let _ = tx.send(release);
        });
        async move {
            rx.await
                .map_err(|_| Error::Aborted("path reservation was dropped".into()))
        }
    }

    /// Whether the job for `id` has started and not yet been released.
    #[must_use]
    pub fn is_running(&self, id: ReservationId) -> bool {
        self.lock().running.contains(&id)
    }

    /// Number of queue slots, running or waiting, for `path`.
    #[must_use]
    pub fn queue_len(&self, path: impl AsRef<Path>) -> usize {
        self.lock()
            .queues
            .get(&key(path.as_ref()))
            .map_or(0, VecDeque::len)
    }

    fn release_guard(&self, id: ReservationId) -> Release {
        Release {
            reservations: self.clone(),
            id,
        }
    }
}

/// Held by a running job. Dropping it lets waiting jobs proceed.
pub struct Release {
    reservations: PathReservations,
    id: ReservationId,
}

impl Release {
    /// The reservation this guard belongs to.
    #[must_use]
    pub fn id(&self) -> ReservationId {
        self.id
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Release").field("id", &self.id).finish()
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        let ready = self.reservations.lock().release(self.id);
        for (id, job) in ready {
            job(self.reservations.release_guard(id));
        }
    }
}

fn key(path: &Path) -> String {
    normalize(path).to_string_lossy().to_lowercase()
}

/// Normalised keys for `paths` and for all of their ancestors.
fn keys<I, P>(paths: I) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut literal = Vec::new();
    let mut dirs = Vec::new();
    for path in paths {
        let normalized = normalize(path.as_ref());
        let k = normalized.to_string_lossy().to_lowercase();
        if !literal.contains(&k) {
            literal.push(k);
        }
        for ancestor in normalized.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            let d = ancestor.to_string_lossy().to_lowercase();
            if !dirs.contains(&d) {
                dirs.push(d);
            }
        }
    }
    // a job holding a path exclusively already covers it as an ancestor
    dirs.retain(|d| !literal.contains(d));
    (literal, dirs)
}
