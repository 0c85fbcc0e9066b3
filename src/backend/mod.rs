//! The narrow capabilities the memory core consumes from a device.
//!
//! Nothing in this crate assumes a particular device API. Everything the
//! [`BufferManager`] and [`StreamingRingBuffer`] need from the outside world
//! is captured by three traits: [`DeviceBackend`] creates storage, copies
//! ranges and inserts completion markers; [`DeviceBuffer`] maps and binds one
//! block of storage; [`CompletionMarker`] is a one-shot, host-waitable signal
//! that the device has finished consuming everything submitted before it.
//!
//! The [`host`] module provides an in-memory implementation of all three,
//! which is what this crate's own tests run against.
//!
//! [`BufferManager`]: crate::buffer::BufferManager
//! [`StreamingRingBuffer`]: crate::buffer::StreamingRingBuffer

use crate::DeviceSize;
use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    ops::{BitOr, BitOrAssign, Range},
    ptr::NonNull,
    time::Duration,
};

pub mod host;

/// A device that can provide buffer storage and completion markers.
pub trait DeviceBackend {
    /// The buffer objects this backend creates.
    type Buffer: DeviceBuffer;

    /// The completion markers this backend inserts.
    type Marker: CompletionMarker;

    /// Creates a block of device storage of `size` bytes.
    ///
    /// If `initial_data` is provided, its bytes fill the prefix of the new
    /// storage; it must not be longer than `size`. The storage is otherwise
    /// zeroed.
    fn create_storage(
        &self,
        size: DeviceSize,
        initial_data: Option<&[u8]>,
        flags: StorageFlags,
    ) -> Result<Self::Buffer, DeviceError>;

    /// Copies `size` bytes from `src` at `src_offset` to `dst` at
    /// `dst_offset`.
    fn copy_range(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        src_offset: DeviceSize,
        dst_offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), DeviceError>;

    /// Inserts a completion marker behind all work submitted to the device so
    /// far and returns a handle the host can wait on.
    fn insert_marker(&self) -> Result<Self::Marker, DeviceError>;
}

/// One block of device storage.
pub trait DeviceBuffer {
    /// Returns the size of the buffer in bytes.
    fn size(&self) -> DeviceSize;

    /// Maps `range` of the buffer for host access and returns a pointer to
    /// the start of the mapping.
    ///
    /// With [`MapFlags::PERSISTENT`] the pointer stays valid until the buffer
    /// is dropped, even while the device consumes the buffer.
    fn map_persistent(
        &self,
        range: Range<DeviceSize>,
        flags: MapFlags,
    ) -> Result<NonNull<u8>, DeviceError>;

    /// Binds the whole buffer to `target`.
    fn bind(&self, target: BindTarget);

    /// Binds `size` bytes of the buffer starting at `offset` to the indexed
    /// binding point `index` of `target`.
    fn bind_range(&self, target: BindTarget, index: u32, offset: DeviceSize, size: DeviceSize);
}

/// A one-shot completion signal from the device.
///
/// The marker is satisfied once the device has finished consuming everything
/// that was submitted before [`DeviceBackend::insert_marker`] created it.
/// Dropping a marker releases it without waiting.
pub trait CompletionMarker {
    /// Blocks until the marker is satisfied, or at least until the timeout
    /// duration has elapsed.
    ///
    /// `None` means an unbounded wait. Returns [`DeviceError::Timeout`] if
    /// the timeout was reached instead.
    fn wait(&self, timeout: Option<Duration>) -> Result<(), DeviceError>;

    /// Returns true if the marker is satisfied, without blocking.
    fn is_signaled(&self) -> bool;
}

macro_rules! device_flags {
    ($(#[doc = $ty_doc:literal])* $name:ident { $($(#[doc = $doc:literal])* $flag:ident = $bit:expr,)+ }) => {
        $(#[doc = $ty_doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            /// No flags set.
            pub const NONE: Self = Self(0);

            $(
                $(#[doc = $doc])*
                pub const $flag: Self = Self($bit);
            )+

            /// Returns whether all flags of `other` are set in `self`.
            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl BitOr for $name {
            type Output = Self;

            #[inline]
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            #[inline]
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

device_flags! {
    /// Selects how a buffer's storage is created.
    StorageFlags {
        /// The host will write to the storage through a mapping.
        HOST_WRITE = 1 << 0,
        /// The storage can stay mapped while the device consumes it.
        PERSISTENT = 1 << 1,
        /// Host writes become visible to the device without explicit flushes.
        COHERENT = 1 << 2,
        /// The storage is a short-lived staging area and should be placed in
        /// host-accessible memory.
        CLIENT_STORAGE = 1 << 3,
    }
}

device_flags! {
    /// Selects how a buffer range is mapped.
    MapFlags {
        /// The mapping will be written through.
        WRITE = 1 << 0,
        /// The mapping stays valid while the device consumes the buffer.
        PERSISTENT = 1 << 1,
        /// Writes become visible to the device without explicit flushes.
        COHERENT = 1 << 2,
    }
}

/// An opaque consumer-facing binding surface.
///
/// The meaning of the value is entirely up to the backend; the memory core
/// only passes it through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindTarget(pub u32);

/// Error that can be returned by a device collaborator.
///
/// Any of these is fatal for the memory-core operation in progress: no
/// partial or degraded buffer state is left live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not provide backing storage of the requested size.
    OutOfDeviceMemory,

    /// A copy, mapping or initialization referenced a range outside the
    /// buffer it targets.
    OutOfBounds,

    /// The specified timeout wasn't long enough.
    Timeout,
}

impl Error for DeviceError {}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfDeviceMemory => "out of device memory",
            Self::OutOfBounds => "a range was out of bounds of the buffer",
            Self::Timeout => "the timeout has been reached",
        };

        f.write_str(msg)
    }
}
