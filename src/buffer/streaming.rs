//! A triple-buffered ring for data that is rewritten every cycle.

use crate::{
    backend::{
        BindTarget, CompletionMarker, DeviceBackend, DeviceBuffer, DeviceError, MapFlags,
        StorageFlags,
    },
    DeviceSize,
};
use std::{
    error::Error,
    fmt::{self, Debug, Display, Formatter},
    ptr::NonNull,
    slice,
};

/// How many regions the ring cycles through.
///
/// Three give the writer one full cycle of slack: while the consumer is still
/// reading region `N`, the writer can fill `N+1` and `N+2` before it has to
/// wait.
const REGION_COUNT: usize = 3;

/// A ring of three equal-size regions within one persistently mapped device
/// buffer.
///
/// Each cycle the writer [`acquire`]s the current region, fills it, submits
/// work that reads it, and [`advance`]s to the next region. `advance` places
/// a [completion marker] behind everything submitted so far; when the ring
/// comes back around three cycles later, `acquire` waits on that marker
/// before handing the region out again, so the writer can never overwrite
/// data the consumer is still reading. Regions are never freed individually;
/// reclaim is implicit on the ring's three-cycle period.
///
/// [`acquire`]: Self::acquire
/// [`advance`]: Self::advance
/// [completion marker]: crate::backend::CompletionMarker
pub struct StreamingRingBuffer<B: DeviceBackend> {
    backend: B,
    buffer: B::Buffer,
    mapping: NonNull<u8>,
    region_size: DeviceSize,
    head: usize,
    markers: [Option<B::Marker>; REGION_COUNT],
}

impl<B: DeviceBackend> StreamingRingBuffer<B> {
    /// Creates a ring of three regions of `region_size` bytes each, backed by
    /// one host-writable, coherently and persistently mapped device buffer.
    pub fn new(backend: B, region_size: DeviceSize) -> Result<Self, StreamingError> {
        if region_size == 0 {
            return Err(StreamingError::ZeroSize);
        }

        let buffer_size = region_size
            .checked_mul(REGION_COUNT as DeviceSize)
            .ok_or(StreamingError::RegionTooLarge)?;

        let flags = StorageFlags::HOST_WRITE | StorageFlags::PERSISTENT | StorageFlags::COHERENT;
        let buffer = backend.create_storage(buffer_size, None, flags)?;

        let flags = MapFlags::WRITE | MapFlags::PERSISTENT | MapFlags::COHERENT;
        let mapping = buffer.map_persistent(0..buffer_size, flags)?;

        Ok(StreamingRingBuffer {
            backend,
            buffer,
            mapping,
            region_size,
            head: 0,
            markers: [None, None, None],
        })
    }

    /// Returns the size of one region in bytes.
    pub fn region_size(&self) -> DeviceSize {
        self.region_size
    }

    /// Returns the write slice for the current region, waiting for the
    /// consumer to release it first if necessary.
    ///
    /// If the region still carries the completion marker installed when it
    /// was last advanced past, this blocks until the device satisfies the
    /// marker, then clears it. Calling `acquire` again within the same cycle
    /// returns the same region without waiting. This is the only blocking
    /// point in the crate.
    pub fn acquire(&mut self) -> Result<&mut [u8], StreamingError> {
        if let Some(marker) = self.markers[self.head].take() {
            marker.wait(None)?;
        }

        let offset = self.head as DeviceSize * self.region_size;

        // SAFETY: The mapping covers all three regions for the lifetime of
        // the buffer, the offset is in bounds by construction, and `&mut
        // self` gives exclusive host access to it for the returned lifetime.
        Ok(unsafe {
            slice::from_raw_parts_mut(
                self.mapping.as_ptr().add(offset as usize),
                self.region_size as usize,
            )
        })
    }

    /// Closes the current write cycle and moves to the next region.
    ///
    /// Installs a fresh completion marker covering everything submitted
    /// against the current region up to now, then rotates the head. The
    /// newly current region keeps whatever marker state it was left in three
    /// cycles ago. Call this exactly once per cycle, after all writes through
    /// the slice from [`acquire`] have been issued.
    ///
    /// [`acquire`]: Self::acquire
    pub fn advance(&mut self) -> Result<(), StreamingError> {
        // A marker can still be present if the writer skipped `acquire` this
        // cycle; the newest marker replaces it.
        self.markers[self.head] = Some(self.backend.insert_marker()?);
        self.head = (self.head + 1) % REGION_COUNT;

        Ok(())
    }

    /// Binds the whole ring buffer to `target`.
    pub fn bind(&self, target: BindTarget) {
        self.buffer.bind(target);
    }

    /// Binds the current region's byte range to the indexed binding point
    /// `index` of `target`.
    pub fn bind_range(&self, target: BindTarget, index: u32) {
        self.buffer.bind_range(
            target,
            index,
            self.head as DeviceSize * self.region_size,
            self.region_size,
        );
    }
}

impl<B: DeviceBackend> Debug for StreamingRingBuffer<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingRingBuffer")
            .field("region_size", &self.region_size)
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Error that can be returned by a [`StreamingRingBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamingError {
    /// A zero region size was requested.
    ZeroSize,

    /// Three regions of the requested size would overflow the address space.
    RegionTooLarge,

    /// A device collaborator failed.
    Device(DeviceError),
}

impl Error for StreamingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for StreamingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "a zero region size was requested"),
            Self::RegionTooLarge => write!(f, "the region size overflows the ring buffer"),
            Self::Device(_) => write!(f, "a device collaborator failed"),
        }
    }
}

impl From<DeviceError> for StreamingError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}
