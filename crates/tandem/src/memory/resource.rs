use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{error, instrument};

use super::format::{Direction, ImageFormat, ResourceKind};
use crate::device::{Device, Event, Queue, work};
use crate::error::{Error, Result};
use crate::status::CommandKind;

/// Backing memory of a resource: the device allocation and the host-visible
/// region it is mapped into.
struct Storage {
    device: Mutex<Vec<u8>>,
    host: Mutex<Vec<u8>>,
    mapped: AtomicBool,
}

impl Storage {
    fn new(bytes: usize) -> Self {
        Self {
            device: Mutex::new(vec![0; bytes]),
            host: Mutex::new(vec![0; bytes]),
            mapped: AtomicBool::new(false),
        }
    }

    fn map(&self, direction: Direction) {
        if direction == Direction::DeviceToHost {
            let device = self.device.lock();
            self.host.lock().copy_from_slice(&device);
        }
        self.mapped.store(true, Ordering::Release);
    }

    fn unmap(&self, direction: Direction) {
        if direction == Direction::HostToDevice {
            let mut device = self.device.lock();
            device.copy_from_slice(&self.host.lock());
        }
        self.mapped.store(false, Ordering::Release);
    }
}

/// Handle to the device side of a [`MappedResource`], bound as a kernel
/// argument.
#[derive(Clone)]
pub struct DeviceMem {
    storage: Arc<Storage>,
    len: usize,
}

impl DeviceMem {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locks the device bytes. Kernels use this while they execute.
    pub fn lock(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.storage.device.lock(), |bytes| bytes.as_mut_slice())
    }

    pub fn ptr_eq(&self, other: &DeviceMem) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl fmt::Debug for DeviceMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMem").field("len", &self.len).finish()
    }
}

/// # MappedResource
///
/// A memory region visible to both host and device: a linear buffer or a 2-D
/// image, selected by [`ResourceKind`].
///
/// ## Ownership Protocol
///
/// The device owns the region until a [`map`](MappedResource::map) resolves;
/// from then until the paired [`unmap`](MappedResource::unmap) is issued the
/// host may read or write it through [`with_host`](MappedResource::with_host)
/// and [`with_host_mut`](MappedResource::with_host_mut). Touching the host
/// region outside that window is a caller error and is not checked.
///
/// Map and unmap are asynchronous commands on the resource's own in-order
/// queue, each gated on an arbitrary wait list of events.
pub struct MappedResource {
    kind: ResourceKind,
    direction: Direction,
    queue: Queue,
    storage: Arc<Storage>,
}

impl MappedResource {
    /// Allocates a resource and its private queue.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] if the size is zero or exceeds the device limit.
    #[instrument(skip(device))]
    pub fn new(device: &Device, kind: ResourceKind, direction: Direction) -> Result<Self> {
        let bytes = kind.byte_size();
        if let Err(status) = device.check_alloc(bytes) {
            error!(bytes, %status, "resource allocation failed");
            return Err(Error::Allocation { bytes, status });
        }
        Ok(Self {
            kind,
            direction,
            queue: Queue::new(device),
            storage: Arc::new(Storage::new(bytes)),
        })
    }

    pub fn buffer(
        device: &Device,
        len: usize,
        format: ImageFormat,
        direction: Direction,
    ) -> Result<Self> {
        Self::new(device, ResourceKind::buffer(len, format), direction)
    }

    pub fn image(
        device: &Device,
        width: usize,
        height: usize,
        format: ImageFormat,
        direction: Direction,
    ) -> Result<Self> {
        Self::new(device, ResourceKind::image(width, height, format), direction)
    }

    /// Requests host visibility once every event in `wait` has resolved.
    ///
    /// With `synchronous` set the call blocks until the map has completed.
    /// Returns the map's completion event.
    pub fn map(&self, wait: &[Event], synchronous: bool) -> Result<Event> {
        self.map_on(&self.queue, wait, synchronous)
    }

    /// Like [`map`](MappedResource::map) but issued on `queue`.
    pub fn map_on(&self, queue: &Queue, wait: &[Event], synchronous: bool) -> Result<Event> {
        let storage = self.storage.clone();
        let direction = self.direction;
        let work = work(async move {
            storage.map(direction);
            Ok(())
        });
        let event = queue.submit(CommandKind::Map, wait, work).map_err(|status| {
            error!(queue = queue.id(), %status, "map failed");
            Error::dispatch("map", status)
        })?;
        if synchronous {
            event.wait().map_err(|status| {
                error!(queue = queue.id(), %status, "synchronous map failed");
                Error::dispatch("map", status)
            })?;
        }
        Ok(event)
    }

    /// Returns the region to the device once every event in `wait` has
    /// resolved. Returns the unmap's completion event.
    pub fn unmap(&self, wait: &[Event]) -> Result<Event> {
        self.unmap_on(&self.queue, wait)
    }

    /// Like [`unmap`](MappedResource::unmap) but issued on `queue`.
    pub fn unmap_on(&self, queue: &Queue, wait: &[Event]) -> Result<Event> {
        let storage = self.storage.clone();
        let direction = self.direction;
        let work = work(async move {
            storage.unmap(direction);
            Ok(())
        });
        queue.submit(CommandKind::Unmap, wait, work).map_err(|status| {
            error!(queue = queue.id(), %status, "unmap failed");
            Error::dispatch("unmap", status)
        })
    }

    /// Runs `f` over the host-visible region.
    pub fn with_host<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.storage.host.lock())
    }

    /// Runs `f` over the host-visible region, mutably.
    pub fn with_host_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.storage.host.lock())
    }

    pub fn device_mem(&self) -> DeviceMem {
        DeviceMem {
            storage: self.storage.clone(),
            len: self.kind.byte_size(),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn byte_size(&self) -> usize {
        self.kind.byte_size()
    }

    /// Whether the last completed map has not yet been followed by a completed
    /// unmap.
    pub fn is_mapped(&self) -> bool {
        self.storage.mapped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MappedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedResource")
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("queue", &self.queue)
            .finish()
    }
}
