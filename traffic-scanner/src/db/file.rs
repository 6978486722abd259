//! File-backed append-only storage.
//!
//! A storage directory holds three JSON-lines files:
//!
//! - `users.jsonl`: user upserts, the last line for a user wins
//! - `routes.jsonl`: a journal of route events (added, renamed, removed), replayed on load
//! - `traffic.jsonl`: one line per sample
//!
//! The directory may be shared by several processes (the CLI next to a running `serve`). A scope
//! takes an exclusive `flock` on `.lock` in the directory, loads every file, and works on that
//! copy. On commit it appends its new lines. When a scope deleted samples (retention or route
//! removal) the traffic file is compacted instead: rewritten to a temporary file which then
//! replaces the original. Dropping a scope without committing discards the copy.
//!
//! Nothing is cached between scopes, so every scope sees what other processes committed and route
//! ids are always allocated past every `added` event on disk.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};
use tracing::{debug, info, warn};

use crate::db::errors::{DbError, Result};
use crate::db::models::{NewRoute, Route, Traffic, TrafficReport, User, validate_title};
use crate::db::{Storage, StorageScope, retention_cutoff};
use crate::types::{RouteId, UserId};

const USERS_FILE: &str = "users.jsonl";
const ROUTES_FILE: &str = "routes.jsonl";
const TRAFFIC_FILE: &str = "traffic.jsonl";
const LOCK_FILE: &str = ".lock";

/// One line of the route journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RouteEvent {
    Added(Route),
    Renamed { route_id: RouteId, title: String },
    Removed { route_id: RouteId },
}

#[derive(Debug, Clone)]
struct FileState {
    users: BTreeMap<UserId, User>,
    routes: BTreeMap<RouteId, Route>,
    traffic: Vec<Traffic>,
    next_route_id: RouteId,
}

impl FileState {
    /// Replay every file in `dir`.
    async fn load(dir: &Path) -> Result<Self> {
        let mut state = FileState {
            users: BTreeMap::new(),
            routes: BTreeMap::new(),
            traffic: Vec::new(),
            next_route_id: 1,
        };

        for user in read_lines::<User>(&dir.join(USERS_FILE)).await? {
            state.users.insert(user.user_id, user);
        }
        for event in read_lines::<RouteEvent>(&dir.join(ROUTES_FILE)).await? {
            state.apply(event);
        }

        let samples = read_lines::<Traffic>(&dir.join(TRAFFIC_FILE)).await?;
        let total = samples.len();
        state.traffic = samples
            .into_iter()
            .filter(|sample| state.routes.contains_key(&sample.route_id))
            .collect();
        if state.traffic.len() < total {
            // Left behind by a crash between removing a route and compacting its samples
            warn!("Ignoring {} samples of removed routes", total - state.traffic.len());
        }

        Ok(state)
    }

    fn apply(&mut self, event: RouteEvent) {
        match event {
            RouteEvent::Added(route) => {
                self.next_route_id = self.next_route_id.max(route.route_id + 1);
                self.routes.insert(route.route_id, route);
            }
            RouteEvent::Renamed { route_id, title } => {
                if let Some(route) = self.routes.get_mut(&route_id) {
                    route.title = title;
                }
            }
            RouteEvent::Removed { route_id } => {
                self.routes.remove(&route_id);
            }
        }
    }

    fn owned_route(&self, user_id: UserId, route_id: RouteId) -> Option<&Route> {
        self.routes.get(&route_id).filter(|route| route.user_id == user_id)
    }
}

/// Exclusive `flock` on a storage directory, held until dropped.
///
/// `fd_lock` guards borrow their lock, so the guard lives on a blocking thread that waits for
/// this handle to go away.
struct DirLock {
    _release: oneshot::Sender<()>,
}

impl DirLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        let (acquired_tx, acquired_rx) = oneshot::channel::<std::io::Result<()>>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        tokio::task::spawn_blocking(move || {
            let file = match std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) => {
                    let _ = acquired_tx.send(Err(e));
                    return;
                }
            };

            let mut lock = fd_lock::RwLock::new(file);
            match lock.write() {
                Ok(_guard) => {
                    // Nobody waiting any more means the scope was abandoned before it got the lock
                    if acquired_tx.send(Ok(())).is_ok() {
                        let _ = release_rx.blocking_recv();
                    }
                }
                Err(e) => {
                    let _ = acquired_tx.send(Err(e));
                }
            }
        });

        match acquired_rx.await {
            Ok(Ok(())) => Ok(Self { _release: release_tx }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DbError::Other(anyhow::anyhow!("Storage lock task exited before locking"))),
        }
    }
}

/// Directory-backed [`Storage`].
pub struct FileStorage {
    dir: PathBuf,
    /// Serializes scopes of this process before they queue on the directory lock
    local: Arc<Mutex<()>>,
    default_timezone: i32,
}

impl FileStorage {
    /// Open the storage directory, creating it if needed, and check that every file loads.
    pub async fn open(dir: impl AsRef<Path>, default_timezone: i32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let storage = Self {
            dir,
            local: Arc::new(Mutex::new(())),
            default_timezone,
        };

        let _lock = storage.lock().await?;
        let state = FileState::load(&storage.dir).await?;
        info!(
            "Opened file storage at {} ({} users, {} routes, {} samples)",
            storage.dir.display(),
            state.users.len(),
            state.routes.len(),
            state.traffic.len()
        );

        Ok(storage)
    }

    async fn lock(&self) -> Result<(OwnedMutexGuard<()>, DirLock)> {
        let local = self.local.clone().lock_owned().await;
        let dir_lock = DirLock::acquire(self.dir.join(LOCK_FILE)).await?;
        Ok((local, dir_lock))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn session_scope(&self) -> Result<Box<dyn StorageScope>> {
        let (local, dir_lock) = self.lock().await?;
        let working = FileState::load(&self.dir).await?;
        Ok(Box::new(FileScope {
            _dir_lock: dir_lock,
            _local: local,
            working,
            dir: self.dir.clone(),
            default_timezone: self.default_timezone,
            new_users: Vec::new(),
            new_route_events: Vec::new(),
            new_traffic: Vec::new(),
            compact_traffic: false,
        }))
    }
}

/// Exclusive unit of work over a [`FileStorage`].
pub struct FileScope {
    _dir_lock: DirLock,
    _local: OwnedMutexGuard<()>,
    working: FileState,
    dir: PathBuf,
    default_timezone: i32,
    new_users: Vec<User>,
    new_route_events: Vec<RouteEvent>,
    new_traffic: Vec<Traffic>,
    compact_traffic: bool,
}

impl FileScope {
    fn record(&mut self, event: RouteEvent) {
        self.working.apply(event.clone());
        self.new_route_events.push(event);
    }

    fn upsert_user(&mut self, user: User) {
        self.working.users.insert(user.user_id, user.clone());
        self.new_users.push(user);
    }

    fn drop_samples(&mut self, keep: impl Fn(&Traffic) -> bool) -> u64 {
        let before = self.working.traffic.len();
        self.working.traffic.retain(|sample| keep(sample));
        let removed = (before - self.working.traffic.len()) as u64;
        if removed > 0 {
            self.compact_traffic = true;
        }
        removed
    }
}

#[async_trait]
impl StorageScope for FileScope {
    async fn get_route(&mut self, user_id: UserId, route_id: RouteId) -> Result<Option<Route>> {
        Ok(self.working.owned_route(user_id, route_id).cloned())
    }

    async fn get_routes(&mut self, user_id: Option<UserId>) -> Result<Vec<Route>> {
        Ok(self
            .working
            .routes
            .values()
            .filter(|route| user_id.is_none_or(|id| route.user_id == id))
            .cloned()
            .collect())
    }

    async fn add_route(&mut self, route: NewRoute) -> Result<Route> {
        route.validate()?;

        if !self.working.users.contains_key(&route.user_id) {
            self.upsert_user(User::new(route.user_id));
        }

        let route = Route {
            route_id: self.working.next_route_id,
            user_id: route.user_id,
            title: route.title,
            start: route.start,
            end: route.end,
        };
        self.record(RouteEvent::Added(route.clone()));

        debug!(route_id = route.route_id, user_id = route.user_id, "Inserted route");
        Ok(route)
    }

    async fn remove_route(&mut self, user_id: UserId, route_id: RouteId) -> Result<bool> {
        if self.working.owned_route(user_id, route_id).is_none() {
            return Ok(false);
        }

        let samples = self.drop_samples(|sample| sample.route_id != route_id);
        self.new_traffic.retain(|sample| sample.route_id != route_id);
        self.record(RouteEvent::Removed { route_id });

        debug!(route_id, user_id, samples, "Removed route");
        Ok(true)
    }

    async fn rename_route(&mut self, user_id: UserId, route_id: RouteId, title: &str) -> Result<()> {
        validate_title(title)?;

        if self.working.owned_route(user_id, route_id).is_some() {
            self.record(RouteEvent::Renamed {
                route_id,
                title: title.to_string(),
            });
        }
        Ok(())
    }

    async fn append_traffic_at(&mut self, route: &Route, timestamp: i64, duration_sec: Option<i64>) -> Result<Traffic> {
        if !self.working.routes.contains_key(&route.route_id) {
            return Err(DbError::ForeignKeyViolation {
                table: Some("traffic".to_string()),
                message: format!("route {} does not exist", route.route_id),
            });
        }

        let sample = Traffic {
            route_id: route.route_id,
            timestamp,
            duration_sec,
        };
        self.working.traffic.push(sample.clone());
        self.new_traffic.push(sample.clone());
        Ok(sample)
    }

    async fn delete_old_traffic(&mut self, route: &Route, keep_days: u32) -> Result<u64> {
        let cutoff = retention_cutoff(chrono::Utc::now().timestamp(), keep_days);
        let route_id = route.route_id;

        let deleted = self.drop_samples(|sample| sample.route_id != route_id || sample.timestamp >= cutoff);
        self.new_traffic
            .retain(|sample| sample.route_id != route_id || sample.timestamp >= cutoff);
        Ok(deleted)
    }

    async fn make_report(&mut self, route: &Route) -> Result<TrafficReport> {
        let timezone = self
            .working
            .users
            .get(&route.user_id)
            .and_then(|user| user.timezone)
            .unwrap_or(self.default_timezone);

        let samples = self
            .working
            .traffic
            .iter()
            .filter(|sample| sample.route_id == route.route_id)
            .cloned()
            .collect();

        Ok(TrafficReport::new(route.clone(), timezone, samples))
    }

    async fn update_user(&mut self, user: &User) -> Result<()> {
        self.upsert_user(user.clone());
        Ok(())
    }

    async fn get_user(&mut self, user_id: UserId) -> Result<Option<User>> {
        Ok(self.working.users.get(&user_id).cloned())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let dir = &self.dir;

        // Routes before traffic, so a crash never leaves samples pointing at an unknown route
        append_lines(&dir.join(USERS_FILE), &self.new_users).await?;
        append_lines(&dir.join(ROUTES_FILE), &self.new_route_events).await?;
        if self.compact_traffic {
            rewrite_lines(&dir.join(TRAFFIC_FILE), &self.working.traffic).await?;
        } else {
            append_lines(&dir.join(TRAFFIC_FILE), &self.new_traffic).await?;
        }

        Ok(())
    }
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| DbError::Corrupt {
                file: path.display().to_string(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

fn encode_lines<T: Serialize>(items: &[T]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item).map_err(anyhow::Error::from)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

async fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }

    let buf = encode_lines(items)?;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(&buf).await?;
    file.sync_all().await?;
    Ok(())
}

async fn rewrite_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let buf = encode_lines(items)?;
    let tmp = path.with_extension("jsonl.tmp");

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&buf).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
