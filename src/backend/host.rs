//! An in-memory implementation of the device capabilities.
//!
//! The host backend behaves like a device whose every operation completes
//! immediately: buffers are plain host allocations, copies are memcpys and
//! markers are signaled as soon as they are inserted. Construct it with
//! [`HostBackend::with_manual_markers`] instead to get markers that stay
//! pending until [`HostBackend::signal_markers`] is called, which is how the
//! tests in this crate exercise the ring buffer's wait path.
//!
//! Cloning a `HostBackend` clones a handle to the same backend, so a test can
//! keep one handle while moving the other into a [`StreamingRingBuffer`] or
//! [`BufferManager`].
//!
//! [`StreamingRingBuffer`]: crate::buffer::StreamingRingBuffer
//! [`BufferManager`]: crate::buffer::BufferManager

use super::{
    BindTarget, CompletionMarker, DeviceBackend, DeviceBuffer, DeviceError, MapFlags, StorageFlags,
};
use crate::DeviceSize;
use parking_lot::{Condvar, Mutex};
use std::{
    alloc::{self, Layout},
    ops::Range,
    ptr::{self, NonNull},
    sync::{Arc, Weak},
    time::Duration,
};

/// An in-memory device backend.
#[derive(Clone, Debug)]
pub struct HostBackend {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    // Whether markers are satisfied the moment they are inserted.
    auto_signal: bool,
    // Markers inserted in manual mode, waiting for `signal_markers`.
    pending: Mutex<Vec<Weak<MarkerState>>>,
}

impl HostBackend {
    /// Creates a backend whose markers are satisfied immediately.
    pub fn new() -> Self {
        HostBackend {
            shared: Arc::new(Shared {
                auto_signal: true,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a backend whose markers stay pending until
    /// [`signal_markers`] is called.
    ///
    /// [`signal_markers`]: Self::signal_markers
    pub fn with_manual_markers() -> Self {
        HostBackend {
            shared: Arc::new(Shared {
                auto_signal: false,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Satisfies every marker inserted so far, waking any waiters.
    pub fn signal_markers(&self) {
        let mut pending = self.shared.pending.lock();

        for state in pending.drain(..) {
            if let Some(state) = state.upgrade() {
                state.signal();
            }
        }
    }

    /// Returns the number of markers that are still pending.
    pub fn pending_markers(&self) -> usize {
        let mut pending = self.shared.pending.lock();
        pending.retain(|state| state.upgrade().is_some());

        pending.len()
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for HostBackend {
    type Buffer = HostBuffer;
    type Marker = HostMarker;

    fn create_storage(
        &self,
        size: DeviceSize,
        initial_data: Option<&[u8]>,
        flags: StorageFlags,
    ) -> Result<Self::Buffer, DeviceError> {
        if let Some(data) = initial_data {
            if data.len() as DeviceSize > size {
                return Err(DeviceError::OutOfBounds);
            }
        }

        let storage = Storage::zeroed(size)?;

        if let Some(data) = initial_data {
            // SAFETY: The storage was just allocated with at least
            // `data.len()` bytes and nothing else can reference it yet.
            unsafe {
                ptr::copy_nonoverlapping(data.as_ptr(), storage.ptr.as_ptr(), data.len());
            }
        }

        Ok(HostBuffer {
            storage: Arc::new(storage),
            flags,
            bind_log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn copy_range(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        src_offset: DeviceSize,
        dst_offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), DeviceError> {
        if src_offset.checked_add(size).is_none_or(|end| end > src.size())
            || dst_offset.checked_add(size).is_none_or(|end| end > dst.size())
        {
            return Err(DeviceError::OutOfBounds);
        }

        // SAFETY: Both ranges were bounds-checked against fixed-size
        // allocations that live for as long as the buffers do. `ptr::copy`
        // handles the case where `src` and `dst` are the same buffer.
        unsafe {
            ptr::copy(
                src.storage.ptr.as_ptr().add(src_offset as usize),
                dst.storage.ptr.as_ptr().add(dst_offset as usize),
                size as usize,
            );
        }

        Ok(())
    }

    fn insert_marker(&self) -> Result<Self::Marker, DeviceError> {
        let state = Arc::new(MarkerState {
            signaled: Mutex::new(self.shared.auto_signal),
            condvar: Condvar::new(),
        });

        if !self.shared.auto_signal {
            self.shared.pending.lock().push(Arc::downgrade(&state));
        }

        Ok(HostMarker { state })
    }
}

/// A buffer of the [`HostBackend`]: a fixed-size host allocation.
#[derive(Clone, Debug)]
pub struct HostBuffer {
    storage: Arc<Storage>,
    flags: StorageFlags,
    bind_log: Arc<Mutex<Vec<BindRecord>>>,
}

impl HostBuffer {
    /// Returns the flags the buffer was created with.
    pub fn flags(&self) -> StorageFlags {
        self.flags
    }

    /// Returns a copy of the buffer's bytes.
    pub fn contents(&self) -> Vec<u8> {
        // SAFETY: The allocation is valid for `len` bytes for as long as the
        // buffer is alive.
        unsafe { std::slice::from_raw_parts(self.storage.ptr.as_ptr(), self.storage.len).to_vec() }
    }

    /// Returns the bind calls issued against this buffer, oldest first.
    pub fn bindings(&self) -> Vec<BindRecord> {
        self.bind_log.lock().clone()
    }
}

impl DeviceBuffer for HostBuffer {
    fn size(&self) -> DeviceSize {
        self.storage.len as DeviceSize
    }

    fn map_persistent(
        &self,
        range: Range<DeviceSize>,
        _flags: MapFlags,
    ) -> Result<NonNull<u8>, DeviceError> {
        if range.start > range.end || range.end > self.size() {
            return Err(DeviceError::OutOfBounds);
        }

        // SAFETY: `range.start` was bounds-checked and the allocation never
        // moves, so the pointer stays valid for the life of the buffer, which
        // is exactly what a persistent mapping promises.
        Ok(unsafe { NonNull::new_unchecked(self.storage.ptr.as_ptr().add(range.start as usize)) })
    }

    fn bind(&self, target: BindTarget) {
        self.bind_log.lock().push(BindRecord::Full { target });
    }

    fn bind_range(&self, target: BindTarget, index: u32, offset: DeviceSize, size: DeviceSize) {
        self.bind_log.lock().push(BindRecord::Range {
            target,
            index,
            offset,
            size,
        });
    }
}

/// One bind call recorded by a [`HostBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindRecord {
    Full {
        target: BindTarget,
    },
    Range {
        target: BindTarget,
        index: u32,
        offset: DeviceSize,
        size: DeviceSize,
    },
}

/// The raw allocation behind a [`HostBuffer`].
///
/// Kept as a raw pointer rather than a `Vec` so that persistent mappings and
/// device-side copies can coexist the way they do on a real device, without
/// creating aliasing references.
#[derive(Debug)]
struct Storage {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: The storage is plain memory; synchronization of access is the
// responsibility of whoever holds mappings into it, as with a real device.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn zeroed(size: DeviceSize) -> Result<Self, DeviceError> {
        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfDeviceMemory)?;

        if len == 0 {
            return Ok(Storage {
                ptr: NonNull::dangling(),
                len,
            });
        }

        let layout = Layout::array::<u8>(len).map_err(|_| DeviceError::OutOfDeviceMemory)?;
        // SAFETY: `layout` has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        match NonNull::new(ptr) {
            Some(ptr) => Ok(Storage { ptr, len }),
            None => Err(DeviceError::OutOfDeviceMemory),
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.len != 0 {
            // SAFETY: The allocation was created in `zeroed` with this exact
            // layout and has not been freed before.
            unsafe {
                alloc::dealloc(self.ptr.as_ptr(), Layout::array::<u8>(self.len).unwrap());
            }
        }
    }
}

/// A completion marker of the [`HostBackend`].
#[derive(Debug)]
pub struct HostMarker {
    state: Arc<MarkerState>,
}

#[derive(Debug)]
struct MarkerState {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl MarkerState {
    fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_all();
    }
}

impl CompletionMarker for HostMarker {
    fn wait(&self, timeout: Option<Duration>) -> Result<(), DeviceError> {
        let mut signaled = self.state.signaled.lock();

        match timeout {
            None => {
                while !*signaled {
                    self.state.condvar.wait(&mut signaled);
                }

                Ok(())
            }
            Some(timeout) => {
                if !*signaled
                    && self
                        .state
                        .condvar
                        .wait_for(&mut signaled, timeout)
                        .timed_out()
                    && !*signaled
                {
                    return Err(DeviceError::Timeout);
                }

                Ok(())
            }
        }
    }

    fn is_signaled(&self) -> bool {
        *self.state.signaled.lock()
    }
}
