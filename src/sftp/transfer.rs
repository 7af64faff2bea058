//! Transfer Queue
//!
//! Bounded-concurrency scheduler for uploads and downloads over a
//! file-transfer channel supplied by the caller.
//!
//! Each promotion hands the item a fresh run token together with its own
//! [`TransferControl`]. The active-slot count is released exactly once per run
//! token: by completion, failure, pause or cancel, whichever reaches the queue
//! first. A task that outlives its token (paused or cancelled mid-stream) is
//! abandoned and can no longer report progress or completion.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::conflict::local_stat;
use super::error::SftpError;
use super::remote::RemoteFs;
use super::types::{TransferDirection, TransferEvent, TransferItem, TransferRequest, TransferStatus};
use crate::config::TransferSettings;
use crate::events::EventBus;

/// Maximum possible concurrent transfers
const MAX_POSSIBLE_CONCURRENT: usize = 10;

/// Default concurrent transfers
const DEFAULT_CONCURRENT_TRANSFERS: usize = 3;

const CHUNK_SIZE: usize = 64 * 1024;

/// I/O timeout to prevent zombie transfers on a dead transport
const IO_TIMEOUT: Duration = Duration::from_secs(300);

/// Minimum spacing of progress updates per item
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Cancellation signal for one run of a transfer
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

struct Run {
    token: u64,
    control: Arc<TransferControl>,
}

struct Entry {
    item: TransferItem,
    run: Option<Run>,
}

struct QueueState {
    /// Enqueue order, for `get_all`
    order: Vec<String>,
    /// Items waiting for a slot, FIFO
    pending: VecDeque<String>,
    entries: HashMap<String, Entry>,
    active: usize,
    max_concurrent: usize,
    next_token: u64,
    channel: Option<Arc<dyn RemoteFs>>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    /// Bytes per second, 0 = unlimited; applied to each stream independently
    speed_limit_bps: Arc<AtomicUsize>,
    preserve_timestamps: AtomicBool,
    events: EventBus<TransferEvent>,
}

/// Cheap to clone; all clones drive the same queue.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    order: Vec::new(),
                    pending: VecDeque::new(),
                    entries: HashMap::new(),
                    active: 0,
                    max_concurrent: DEFAULT_CONCURRENT_TRANSFERS,
                    next_token: 0,
                    channel: None,
                }),
                speed_limit_bps: Arc::new(AtomicUsize::new(0)),
                preserve_timestamps: AtomicBool::new(true),
                events: EventBus::new(),
            }),
        }
    }

    pub fn from_settings(settings: &TransferSettings) -> Self {
        let queue = Self::new();
        queue.set_max_concurrent(settings.max_concurrent);
        queue.set_speed_limit_kbps(settings.speed_limit_kbps);
        queue.set_preserve_timestamps(settings.preserve_timestamps);
        queue
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Replace the file-transfer channel used by transfers promoted from now on.
    ///
    /// Callers refresh this after every reconnect.
    pub fn set_channel(&self, channel: Option<Arc<dyn RemoteFs>>) {
        let mut state = self.inner.state.lock();
        state.channel = channel;
        debug!("Transfer queue channel updated");
    }

    /// Update the maximum concurrent transfer limit
    pub fn set_max_concurrent(&self, max: usize) {
        let clamped = max.clamp(1, MAX_POSSIBLE_CONCURRENT);
        let mut state = self.inner.state.lock();
        state.max_concurrent = clamped;
        info!("Max concurrent transfers set to: {}", clamped);
        self.inner.promote(&mut state);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.state.lock().max_concurrent
    }

    /// Update the speed limit (in KB/s, 0 = unlimited)
    pub fn set_speed_limit_kbps(&self, kbps: usize) {
        let bps = kbps.saturating_mul(1024);
        self.inner.speed_limit_bps.store(bps, Ordering::SeqCst);
        if kbps > 0 {
            info!("Speed limit set to: {} KB/s", kbps);
        } else {
            info!("Speed limit disabled (unlimited)");
        }
    }

    pub fn set_preserve_timestamps(&self, preserve: bool) {
        self.inner
            .preserve_timestamps
            .store(preserve, Ordering::SeqCst);
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Add a transfer; it starts `queued` and is promoted if a slot is free.
    pub fn enqueue(&self, request: TransferRequest) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let item = TransferItem::new(id.clone(), request);
        info!(
            "Enqueued {:?} transfer {}: {} -> {}",
            item.direction,
            id,
            item.source(),
            item.destination()
        );

        let mut state = self.inner.state.lock();
        state.order.push(id.clone());
        state.pending.push_back(id.clone());
        self.inner.events.emit(TransferEvent::Update(item.clone()));
        state.entries.insert(id.clone(), Entry { item, run: None });
        self.inner.promote(&mut state);
        id
    }

    /// `active → paused`. The in-flight stream is abandoned; `resume` starts over.
    pub fn pause(&self, id: &str) -> Result<(), SftpError> {
        let mut state = self.inner.state.lock();
        let entry = Self::entry_in(&mut state, id, "pause", &[TransferStatus::Active])?;
        entry.item.status = TransferStatus::Paused;
        entry.item.speed = 0;
        entry.item.eta_seconds = None;
        let run = entry.run.take();
        let snapshot = entry.item.clone();
        if let Some(run) = run {
            run.control.cancel();
            QueueInner::release_slot(&mut state);
        }
        info!("Paused transfer: {}", id);
        self.inner.events.emit(TransferEvent::Update(snapshot));
        self.inner.promote(&mut state);
        Ok(())
    }

    /// `paused → queued`, with progress reset.
    pub fn resume(&self, id: &str) -> Result<(), SftpError> {
        self.requeue(id, "resume", TransferStatus::Paused)
    }

    /// `failed → queued`, with progress and error cleared.
    pub fn retry(&self, id: &str) -> Result<(), SftpError> {
        self.requeue(id, "retry", TransferStatus::Failed)
    }

    fn requeue(&self, id: &str, action: &'static str, from: TransferStatus) -> Result<(), SftpError> {
        let mut state = self.inner.state.lock();
        let entry = Self::entry_in(&mut state, id, action, &[from])?;
        entry.item.reset_progress();
        entry.item.status = TransferStatus::Queued;
        let snapshot = entry.item.clone();
        state.pending.push_back(id.to_string());
        info!("Re-queued transfer ({}): {}", action, id);
        self.inner.events.emit(TransferEvent::Update(snapshot));
        self.inner.promote(&mut state);
        Ok(())
    }

    /// `queued | active | paused → cancelled`
    pub fn cancel(&self, id: &str) -> Result<(), SftpError> {
        let mut state = self.inner.state.lock();
        self.inner.cancel_locked(&mut state, id)?;
        self.inner.promote(&mut state);
        Ok(())
    }

    /// Cancel every item that has not finished yet
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock();
        let ids: Vec<String> = state
            .order
            .iter()
            .filter(|id| {
                state
                    .entries
                    .get(*id)
                    .is_some_and(|e| !e.item.status.is_terminal())
            })
            .cloned()
            .collect();
        for id in &ids {
            let _ = self.inner.cancel_locked(&mut state, id);
        }
        info!("Cancelled {} transfers", ids.len());
    }

    /// Drop completed, failed and cancelled items; returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.item.status.is_terminal());
        let QueueState { order, entries, .. } = &mut *state;
        order.retain(|id| entries.contains_key(id));
        before - state.entries.len()
    }

    pub fn get(&self, id: &str) -> Option<TransferItem> {
        self.inner
            .state
            .lock()
            .entries
            .get(id)
            .map(|e| e.item.clone())
    }

    /// All items in enqueue order
    pub fn get_all(&self) -> Vec<TransferItem> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id).map(|e| e.item.clone()))
            .collect()
    }

    fn entry_in<'a>(
        state: &'a mut QueueState,
        id: &str,
        action: &'static str,
        allowed: &[TransferStatus],
    ) -> Result<&'a mut Entry, SftpError> {
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| SftpError::TransferNotFound(id.to_string()))?;
        if !allowed.contains(&entry.item.status) {
            return Err(SftpError::InvalidTransition {
                id: id.to_string(),
                action,
                status: entry.item.status,
            });
        }
        Ok(entry)
    }
}

impl QueueInner {
    fn release_slot(state: &mut QueueState) {
        match state.active.checked_sub(1) {
            Some(n) => {
                state.active = n;
                debug!("Transfer slot released, active count: {}", n);
            }
            None => warn!("Transfer slot released with active count already 0"),
        }
    }

    fn cancel_locked(&self, state: &mut QueueState, id: &str) -> Result<(), SftpError> {
        let entry = TransferQueue::entry_in(
            state,
            id,
            "cancel",
            &[
                TransferStatus::Queued,
                TransferStatus::Active,
                TransferStatus::Paused,
            ],
        )?;
        entry.item.status = TransferStatus::Cancelled;
        entry.item.speed = 0;
        entry.item.eta_seconds = None;
        entry.item.finished_at = Some(Utc::now());
        let run = entry.run.take();
        let snapshot = entry.item.clone();
        if let Some(run) = run {
            run.control.cancel();
            Self::release_slot(state);
        }
        info!("Cancelled transfer: {}", id);
        self.events.emit(TransferEvent::Update(snapshot));
        Ok(())
    }

    /// Fill free slots from the front of the pending queue.
    fn promote(self: &Arc<Self>, state: &mut QueueState) {
        while state.active < state.max_concurrent {
            let Some(id) = state.pending.pop_front() else {
                break;
            };
            state.next_token += 1;
            let token = state.next_token;
            let channel = state.channel.clone();
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            // Cancelled or re-queued entries may still sit in `pending`
            if entry.item.status != TransferStatus::Queued || entry.run.is_some() {
                continue;
            }

            let control = Arc::new(TransferControl::new());
            entry.item.status = TransferStatus::Active;
            entry.item.started_at = Some(Utc::now());
            entry.run = Some(Run {
                token,
                control: control.clone(),
            });
            let snapshot = entry.item.clone();
            state.active += 1;
            debug!(
                "Promoted transfer {}, active count: {}/{}",
                id, state.active, state.max_concurrent
            );
            self.events.emit(TransferEvent::Update(snapshot.clone()));

            let job = TransferJob {
                queue: self.clone(),
                id,
                token,
                control,
                channel,
                speed_limit_bps: self.speed_limit_bps.clone(),
                preserve_timestamps: self.preserve_timestamps.load(Ordering::SeqCst),
            };
            tokio::spawn(job.run(snapshot));
        }
    }

    fn is_current(entry: &Entry, token: u64) -> bool {
        entry.item.status == TransferStatus::Active
            && entry.run.as_ref().is_some_and(|r| r.token == token)
    }

    /// Record progress; `false` once this run no longer owns the item.
    fn report_progress(
        &self,
        id: &str,
        token: u64,
        transferred: u64,
        total: u64,
        elapsed: Duration,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            return false;
        };
        if !Self::is_current(entry, token) {
            return false;
        }
        let item = &mut entry.item;
        item.total_bytes = total;
        item.transferred_bytes = transferred;
        let secs = elapsed.as_secs_f64().max(0.001);
        item.speed = (transferred as f64 / secs) as u64;
        item.eta_seconds = if item.speed > 0 {
            Some(total.saturating_sub(transferred) / item.speed)
        } else {
            None
        };
        self.events.emit(TransferEvent::Update(item.clone()));
        true
    }

    fn finish(self: &Arc<Self>, id: &str, token: u64, result: Result<u64, SftpError>) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            return;
        };
        if !Self::is_current(entry, token) {
            debug!("Discarding result of abandoned run for transfer {}", id);
            return;
        }
        entry.run = None;
        let item = &mut entry.item;
        item.finished_at = Some(Utc::now());
        item.eta_seconds = None;
        let event = match result {
            Ok(bytes) => {
                item.status = TransferStatus::Completed;
                item.transferred_bytes = bytes;
                item.total_bytes = item.total_bytes.max(bytes);
                item.eta_seconds = Some(0);
                info!("Transfer completed: {} ({} bytes)", id, bytes);
                TransferEvent::Complete(item.clone())
            }
            Err(e) => {
                item.status = TransferStatus::Failed;
                item.speed = 0;
                item.error = Some(e.to_string());
                warn!("Transfer failed: {}: {}", id, e);
                TransferEvent::Error(item.clone())
            }
        };
        Self::release_slot(&mut state);
        self.events.emit(event);
        self.promote(&mut state);
    }
}

/// One run of one item
struct TransferJob {
    queue: Arc<QueueInner>,
    id: String,
    token: u64,
    control: Arc<TransferControl>,
    channel: Option<Arc<dyn RemoteFs>>,
    speed_limit_bps: Arc<AtomicUsize>,
    preserve_timestamps: bool,
}

impl TransferJob {
    async fn run(self, item: TransferItem) {
        let result = match self.channel.clone() {
            None => Err(SftpError::NoChannel),
            Some(channel) => match item.direction {
                TransferDirection::Upload => {
                    self.upload(channel.as_ref(), &item.local_path, &item.remote_path)
                        .await
                }
                TransferDirection::Download => {
                    self.download(channel.as_ref(), &item.remote_path, &item.local_path)
                        .await
                }
            },
        };
        self.queue.finish(&self.id, self.token, result);
    }

    async fn upload(&self, remote: &dyn RemoteFs, local_path: &str, remote_path: &str) -> Result<u64, SftpError> {
        let stat = local_stat(local_path)
            .await?
            .ok_or_else(|| SftpError::NotFound(local_path.to_string()))?;
        let mut reader = tokio::fs::File::open(local_path).await?;
        self.ensure_live()?;
        let mut writer = remote.open_write(remote_path).await?;

        let bytes = self.pump(&mut reader, &mut writer, stat.size).await?;

        if self.preserve_timestamps {
            if let Err(e) = remote.set_times(remote_path, stat.accessed, stat.modified).await {
                warn!("Failed to preserve timestamps on {}: {}", remote_path, e);
            }
        }
        Ok(bytes)
    }

    async fn download(&self, remote: &dyn RemoteFs, remote_path: &str, local_path: &str) -> Result<u64, SftpError> {
        let stat = remote
            .stat(remote_path)
            .await?
            .ok_or_else(|| SftpError::NotFound(remote_path.to_string()))?;
        let mut reader = remote.open_read(remote_path).await?;
        self.ensure_live()?;
        let mut writer = tokio::fs::File::create(local_path).await?;

        let bytes = self.pump(&mut reader, &mut writer, stat.size).await?;

        if self.preserve_timestamps {
            let path = local_path.to_string();
            let atime = filetime::FileTime::from_unix_time(stat.accessed, 0);
            let mtime = filetime::FileTime::from_unix_time(stat.modified, 0);
            let result =
                tokio::task::spawn_blocking(move || filetime::set_file_times(&path, atime, mtime))
                    .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to preserve timestamps on {}: {}", local_path, e),
                Err(e) => warn!("Timestamp task failed for {}: {}", local_path, e),
            }
        }
        Ok(bytes)
    }

    /// Abandoned runs must not touch the destination
    fn ensure_live(&self) -> Result<(), SftpError> {
        if self.control.is_cancelled() {
            return Err(SftpError::TransferCancelled);
        }
        Ok(())
    }

    /// Stream `reader` into `writer` in chunks with cooperative cancellation,
    /// throttling and rate-limited progress.
    async fn pump<R, W>(&self, reader: &mut R, writer: &mut W, total: u64) -> Result<u64, SftpError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let start = Instant::now();
        let mut last_progress = start;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;

        if !self.queue.report_progress(&self.id, self.token, 0, total, Duration::ZERO) {
            return Err(SftpError::TransferCancelled);
        }

        loop {
            if self.control.is_cancelled() {
                debug!("Transfer {} abandoned at {} bytes", self.id, transferred);
                return Err(SftpError::TransferCancelled);
            }

            let n = match tokio::time::timeout(IO_TIMEOUT, reader.read(&mut buffer)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(SftpError::IoError(e)),
                Err(_) => {
                    warn!("Read timeout after {:?} at {} bytes", IO_TIMEOUT, transferred);
                    return Err(SftpError::TransferError(format!(
                        "Read timeout after {:?} - connection may be dead",
                        IO_TIMEOUT
                    )));
                }
            };
            if n == 0 {
                break;
            }

            match tokio::time::timeout(IO_TIMEOUT, writer.write_all(&buffer[..n])).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(SftpError::IoError(e)),
                Err(_) => {
                    warn!("Write timeout after {:?} at {} bytes", IO_TIMEOUT, transferred);
                    return Err(SftpError::TransferError(format!(
                        "Write timeout after {:?}",
                        IO_TIMEOUT
                    )));
                }
            }
            transferred += n as u64;

            // Token-bucket style throttle
            let bps = self.speed_limit_bps.load(Ordering::Relaxed);
            if bps > 0 {
                let elapsed = start.elapsed().as_secs_f64();
                let expected_secs = transferred as f64 / bps as f64;
                if expected_secs > elapsed {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs_f64(expected_secs - elapsed)) => {}
                        _ = self.control.cancelled() => return Err(SftpError::TransferCancelled),
                    }
                }
            }

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                if !self
                    .queue
                    .report_progress(&self.id, self.token, transferred, total, start.elapsed())
                {
                    return Err(SftpError::TransferCancelled);
                }
            }
        }

        match tokio::time::timeout(IO_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SftpError::IoError(e)),
            Err(_) => {
                return Err(SftpError::TransferError(format!(
                    "Flush timeout after {:?}",
                    IO_TIMEOUT
                )))
            }
        }

        Ok(transferred)
    }
}
