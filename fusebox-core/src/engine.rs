//! Device engines, allocators, and the registry of shared graph engines.
//!
//! Every compiled partition that targets the same [`DeviceEngine`] shares one [`GraphEngine`].
//! The [`EngineRegistry`] counts how many compiled partitions reference each engine; when the
//! count reaches zero the engine's runtime memory is released and it is evicted. A partition's
//! reference is an [`EngineLease`], so dropping it is the only way to give the reference back.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Cpu,
    Gpu,
}

impl Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

/// Memory accounting hook a device exposes to the backend runtime.
pub trait Allocator: Send + Sync + fmt::Debug {
    fn allocate(&self, bytes: usize) -> Result<()>;

    fn deallocate(&self, bytes: usize);
}

/// An allocator that only counts.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicUsize,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes allocated and not yet returned.
    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, bytes: usize) -> Result<()> {
        let live = self.live.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(live, Ordering::SeqCst);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deallocate(&self, bytes: usize) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                Some(live.saturating_sub(bytes))
            });
    }
}

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);

/// Caller-side device handle. Identity (the registry key) is `id`; clones share it.
#[derive(Debug, Clone)]
pub struct DeviceEngine {
    id: u64,
    kind: EngineKind,
    allocator: Arc<dyn Allocator>,
}

impl DeviceEngine {
    /// A device with its own [`CountingAllocator`].
    pub fn new(kind: EngineKind) -> Self {
        Self::with_allocator(kind, Arc::new(CountingAllocator::new()))
    }

    pub fn with_allocator(kind: EngineKind, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            allocator,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }
}

/// Max bytes kept pooled per engine.
const MAX_POOLED_BYTES: usize = 1024 * 1024 * 1024;
/// When pooled bytes exceed this, the largest buffers are dropped.
const TRIM_THRESHOLD: usize = MAX_POOLED_BYTES / 2;

/// Tracks pool usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Current total capacity of all pooled buffers, in bytes.
    pub current_size: usize,
    /// Number of times a buffer was reused instead of allocated.
    pub hits: usize,
    /// Number of times a new buffer was allocated.
    pub misses: usize,
    /// Number of buffers released back to the allocator.
    pub drops: usize,
}

/// Scratch buffers reused across executions of every partition sharing an engine.
#[derive(Debug, Default)]
struct RuntimePool {
    pool: Vec<Vec<f32>>,
    metrics: PoolMetrics,
}

fn buffer_bytes(buf: &Vec<f32>) -> usize {
    buf.capacity() * mem::size_of::<f32>()
}

impl RuntimePool {
    /// Take the smallest pooled buffer that fits `len`, zeroed to length `len`.
    fn take(&mut self, len: usize) -> Option<Vec<f32>> {
        let idx = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= len)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i)?;
        self.metrics.hits += 1;
        let mut buf = self.pool.swap_remove(idx);
        self.metrics.current_size = self.metrics.current_size.saturating_sub(buffer_bytes(&buf));
        buf.clear();
        buf.resize(len, 0.0);
        Some(buf)
    }

    /// Pool `buf`. Returns the byte sizes of buffers that no longer fit.
    fn recycle(&mut self, buf: Vec<f32>) -> Vec<usize> {
        let bytes = buffer_bytes(&buf);
        if self.metrics.current_size + bytes > MAX_POOLED_BYTES {
            self.metrics.drops += 1;
            return vec![bytes];
        }
        self.metrics.current_size += bytes;
        self.pool.push(buf);

        let mut trimmed = Vec::new();
        while self.metrics.current_size > TRIM_THRESHOLD {
            let Some((idx, _)) = self.pool.iter().enumerate().max_by_key(|(_, b)| b.capacity())
            else {
                break;
            };
            let largest = buffer_bytes(&self.pool.swap_remove(idx));
            self.metrics.current_size = self.metrics.current_size.saturating_sub(largest);
            self.metrics.drops += 1;
            trimmed.push(largest);
        }
        debug_assert_eq!(
            self.metrics.current_size,
            self.pool.iter().map(buffer_bytes).sum::<usize>()
        );
        trimmed
    }

    fn drain(&mut self) -> usize {
        let bytes = self.pool.drain(..).map(|b| buffer_bytes(&b)).sum();
        self.metrics.current_size = 0;
        bytes
    }
}

/// Backend runtime state shared by all compiled partitions on one device.
///
/// Every byte of runtime memory, pooled or lent out, is accounted through the device's
/// allocator.
#[derive(Debug)]
pub struct GraphEngine {
    device: DeviceEngine,
    pool: Mutex<RuntimePool>,
}

impl GraphEngine {
    pub fn new(device: DeviceEngine) -> Self {
        Self {
            device,
            pool: Mutex::new(RuntimePool::default()),
        }
    }

    pub fn device(&self) -> &DeviceEngine {
        &self.device
    }

    /// Get a zeroed scratch buffer of `len` elements.
    pub fn take_buffer(&self, len: usize) -> Result<Vec<f32>> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(buf) = pool.take(len) {
            return Ok(buf);
        }
        pool.metrics.misses += 1;
        drop(pool);
        self.device
            .allocator
            .allocate(len * mem::size_of::<f32>())?;
        Ok(vec![0.0; len])
    }

    /// Return a buffer obtained from [`GraphEngine::take_buffer`].
    pub fn recycle_buffer(&self, buf: Vec<f32>) {
        let released = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recycle(buf);
        for bytes in released {
            self.device.allocator.deallocate(bytes);
        }
    }

    /// Hand every pooled buffer back to the allocator.
    pub fn release_runtime_memory(&self) {
        let bytes = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        if bytes > 0 {
            self.device.allocator.deallocate(bytes);
        }
        log::debug!(
            "released {bytes} bytes of runtime memory for device engine {}",
            self.device.id
        );
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .clone()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    engines: HashMap<u64, Arc<GraphEngine>>,
    counts: HashMap<u64, usize>,
}

/// Device engine id -> shared graph engine, plus the active-partition count of each.
///
/// One lock guards both tables. It is held only for lookup, insertion and count updates.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    state: Mutex<RegistryState>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`CompileContext::default`](crate::CompileContext).
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<EngineRegistry>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Get or create the engine for `device` and count one more partition against it.
    pub fn acquire(self: &Arc<Self>, device: &DeviceEngine) -> EngineLease {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let engine = state
            .engines
            .entry(device.id)
            .or_insert_with(|| {
                log::debug!("creating graph engine for device engine {}", device.id);
                Arc::new(GraphEngine::new(device.clone()))
            })
            .clone();
        *state.counts.entry(device.id).or_insert(0) += 1;
        EngineLease {
            registry: self.clone(),
            engine,
            allocator: device.allocator.clone(),
        }
    }

    /// Count one partition fewer; at zero release the engine's memory and evict it.
    fn release(&self, device_id: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = state.counts.get_mut(&device_id) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.counts.remove(&device_id);
            if let Some(engine) = state.engines.remove(&device_id) {
                engine.release_runtime_memory();
                log::debug!("evicted graph engine for device engine {device_id}");
            }
        }
    }

    /// Compiled partitions currently holding the engine of `device_id`.
    pub fn active_partitions(&self, device_id: u64) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.counts.get(&device_id).copied().unwrap_or(0)
    }

    pub fn cached_engines(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .engines
            .len()
    }

    pub fn contains(&self, device_id: u64) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .engines
            .contains_key(&device_id)
    }
}

/// One counted reference to a shared engine. Dropping it releases the count, then the
/// allocator reference.
#[derive(Debug)]
pub struct EngineLease {
    registry: Arc<EngineRegistry>,
    engine: Arc<GraphEngine>,
    allocator: Arc<dyn Allocator>,
}

impl EngineLease {
    pub fn engine(&self) -> &Arc<GraphEngine> {
        &self.engine
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.registry.release(self.engine.device().id());
    }
}
