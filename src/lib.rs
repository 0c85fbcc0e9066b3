//! Sub-allocation and streaming access over device-resident buffers.
//!
//! A *device buffer* is an opaque block of memory shared between the
//! controlling process and an asynchronous hardware consumer. This crate
//! provides the memory-management core for working with such buffers:
//!
//! - A [`Suballocator`] is the capability any range allocator must provide,
//!   and [`FirstFitAllocator`] is the provided implementation: it tracks an
//!   ordered chain of free and used segments covering a linear address space,
//!   splitting segments on allocation and coalescing neighbors on free.
//!
//! - A [`BufferManager`] owns one growable device buffer and carves
//!   persistent sub-regions out of it, handing out RAII [`BufferRegion`]
//!   handles. When the buffer is exhausted it allocates a larger one, copies
//!   the existing content across and retries, so region offsets stay valid
//!   across growth.
//!
//! - A [`StreamingRingBuffer`] owns one persistently mapped buffer split into
//!   three equal regions and hands out a fresh write region each cycle,
//!   waiting on a completion marker only when the region about to be reused
//!   might still be read by the consumer.
//!
//! The device itself is reached through the narrow capabilities in
//! [`backend`]: creating storage, copying ranges, mapping, binding, and
//! inserting host-waitable completion markers. [`backend::host`] contains an
//! in-memory implementation of those capabilities, used by this crate's own
//! tests and usable for testing downstream code without a device.
//!
//! All three components are synchronous and designed for a single control
//! thread; the only blocking point is [`StreamingRingBuffer::acquire`]
//! waiting on a completion marker.
//!
//! [`Suballocator`]: crate::suballocator::Suballocator
//! [`FirstFitAllocator`]: crate::suballocator::FirstFitAllocator

pub mod backend;
pub mod buffer;
pub mod suballocator;

pub use self::{
    buffer::{BufferManager, BufferRegion, StreamingRingBuffer},
    suballocator::{FirstFitAllocator, Suballocator},
};

/// A size or offset in bytes within a device buffer.
pub type DeviceSize = u64;

/// Aligns `value` upward to the next multiple of `alignment`, returning
/// `value` itself if it is already a multiple.
///
/// An `alignment` of zero is treated as an alignment of one. The aligned
/// value must not overflow a `DeviceSize`.
#[inline(always)]
pub const fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    value + misalignment(value, alignment)
}

/// Returns whether `value` is a multiple of `alignment`.
///
/// An `alignment` of zero is treated as an alignment of one.
#[inline(always)]
pub const fn is_aligned(value: DeviceSize, alignment: DeviceSize) -> bool {
    misalignment(value, alignment) == 0
}

/// Returns how many bytes separate `value` from the next multiple of
/// `alignment`.
#[inline(always)]
pub(crate) const fn misalignment(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    let alignment = if alignment == 0 { 1 } else { alignment };

    match value % alignment {
        0 => 0,
        rem => alignment - rem,
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside of this crate. Structures with a
/// field of this type can only be constructed by calling a constructor
/// function or `Default::default()`. The effect is similar to the standard
/// Rust `#[non_exhaustive]` attribute, except that it does not prevent update
/// syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
