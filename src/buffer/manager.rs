//! Persistent sub-regions carved out of one growable device buffer.

use crate::{
    backend::{BindTarget, DeviceBackend, DeviceBuffer, DeviceError, MapFlags, StorageFlags},
    suballocator::{FirstFitAllocator, Suballocator, SuballocatorError},
    DeviceSize,
};
use bytemuck::NoUninit;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::{
    cmp,
    error::Error,
    fmt::{self, Debug, Display, Formatter},
    slice,
    sync::Arc,
};

/// How many returned staging buffers are kept around for reuse.
const MAX_BOUNCE_BUFFERS: usize = 8;

/// Manages one growable device buffer and carves persistent sub-regions out
/// of it.
///
/// The manager delegates all offset bookkeeping to a [`Suballocator`] and
/// only materializes device storage on the first allocation. When the
/// allocator reports that it is out of space, the manager allocates a larger
/// buffer, copies the entire old content into its prefix and retries once.
/// Region offsets are stable across growth because growth only appends, so
/// outstanding [`BufferRegion`]s stay valid; the swap is atomic from a
/// caller's point of view.
///
/// Cloning the manager clones a handle to the same buffer. All operations are
/// synchronous; the manager is intended for a single control thread.
pub struct BufferManager<B: DeviceBackend, A: Suballocator = FirstFitAllocator> {
    inner: Arc<ManagerInner<B, A>>,
}

impl<B: DeviceBackend, A: Suballocator> Debug for BufferManager<B, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();

        f.debug_struct("BufferManager")
            .field("block_size", &self.inner.block_size)
            .field("buffer_size", &state.buffer_size)
            .finish_non_exhaustive()
    }
}

impl<B: DeviceBackend, A: Suballocator> Clone for BufferManager<B, A> {
    fn clone(&self) -> Self {
        BufferManager {
            inner: self.inner.clone(),
        }
    }
}

struct ManagerInner<B: DeviceBackend, A: Suballocator> {
    backend: B,
    // Growth increment in bytes; also the floor for the initial size.
    block_size: DeviceSize,
    state: Mutex<ManagerState<B, A>>,
    // Staging buffers handed back after a host write, reused when large
    // enough.
    bounce_reserve: ArrayQueue<B::Buffer>,
}

struct ManagerState<B: DeviceBackend, A: Suballocator> {
    // `None` until the first allocation materializes storage.
    buffer: Option<B::Buffer>,
    buffer_size: DeviceSize,
    allocator: A,
}

/// Parameters to create a new [`BufferManager`].
#[derive(Clone, Copy, Debug)]
pub struct BufferManagerCreateInfo {
    /// The growth increment in bytes. The buffer is created at
    /// `max(block_size, first request)` and grows in steps of at least this
    /// many bytes.
    ///
    /// The default value is `1 << 20`.
    pub block_size: DeviceSize,

    pub _ne: crate::NonExhaustive,
}

impl Default for BufferManagerCreateInfo {
    fn default() -> Self {
        BufferManagerCreateInfo {
            block_size: 1 << 20,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl<B: DeviceBackend> BufferManager<B, FirstFitAllocator> {
    /// Creates a new `BufferManager` using a [`FirstFitAllocator`] for offset
    /// bookkeeping.
    pub fn new(backend: B, create_info: BufferManagerCreateInfo) -> Self {
        Self::with_allocator(backend, FirstFitAllocator::new(0), create_info)
    }
}

impl<B: DeviceBackend, A: Suballocator> BufferManager<B, A> {
    /// Creates a new `BufferManager` with a caller-provided allocator.
    ///
    /// The allocator must start out empty; the manager feeds it the buffer
    /// capacity through [`Suballocator::grow`] as storage materializes.
    pub fn with_allocator(backend: B, allocator: A, create_info: BufferManagerCreateInfo) -> Self {
        let BufferManagerCreateInfo {
            block_size,
            _ne: _,
        } = create_info;

        BufferManager {
            inner: Arc::new(ManagerInner {
                backend,
                block_size,
                state: Mutex::new(ManagerState {
                    buffer: None,
                    buffer_size: 0,
                    allocator,
                }),
                bounce_reserve: ArrayQueue::new(MAX_BOUNCE_BUFFERS),
            }),
        }
    }

    /// Reserves `size` bytes aligned to `alignment` and returns an exclusive
    /// handle to the reservation.
    ///
    /// On the first call this materializes the device buffer at
    /// `max(block_size, size)` bytes. When the buffer is exhausted it grows
    /// by `max(size + alignment, block_size)` bytes and the allocation is
    /// retried exactly once.
    ///
    /// # Errors
    ///
    /// - Returns [`AllocateError::Suballocator`] for caller-contract
    ///   violations such as a zero-size request.
    /// - Returns [`AllocateError::Device`] if the device fails to provide or
    ///   copy storage, or if the grown buffer size would overflow a
    ///   [`DeviceSize`].
    /// - Returns [`AllocateError::Inconsistent`] if the allocator is still
    ///   out of space after growth, which cannot happen unless the allocator
    ///   was mutated behind the manager's back.
    pub fn allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Result<BufferRegion<B, A>, AllocateError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.buffer.is_none() {
            let initial = cmp::max(inner.block_size, size);
            let buffer = inner
                .backend
                .create_storage(initial, None, StorageFlags::NONE)?;
            state.allocator.grow(initial);
            state.buffer = Some(buffer);
            state.buffer_size = initial;
        }

        let offset = match state.allocator.allocate(size, alignment) {
            Ok(offset) => offset,
            Err(SuballocatorError::OutOfRegionMemory) => {
                let padded = size
                    .checked_add(alignment)
                    .ok_or(AllocateError::Device(DeviceError::OutOfDeviceMemory))?;
                let growth = cmp::max(padded, inner.block_size);
                let new_size = state
                    .buffer_size
                    .checked_add(growth)
                    .ok_or(AllocateError::Device(DeviceError::OutOfDeviceMemory))?;
                let new_buffer = inner
                    .backend
                    .create_storage(new_size, None, StorageFlags::NONE)?;

                let old_buffer = state.buffer.as_ref().unwrap();
                inner
                    .backend
                    .copy_range(old_buffer, &new_buffer, 0, 0, state.buffer_size)?;

                state.allocator.grow(growth);
                state.buffer = Some(new_buffer);
                state.buffer_size = new_size;

                // Growth covers the request plus any alignment padding, so a
                // second failure means the allocator state is corrupt.
                match state.allocator.allocate(size, alignment) {
                    Ok(offset) => offset,
                    Err(SuballocatorError::OutOfRegionMemory) => {
                        return Err(AllocateError::Inconsistent)
                    }
                    Err(err) => return Err(AllocateError::Suballocator(err)),
                }
            }
            Err(err) => return Err(AllocateError::Suballocator(err)),
        };

        drop(state);

        Ok(BufferRegion {
            parent: Some(inner.clone()),
            offset,
            size,
        })
    }

    /// Returns the current capacity of the managed buffer.
    ///
    /// This is zero until the first allocation and only ever grows.
    pub fn buffer_size(&self) -> DeviceSize {
        self.inner.state.lock().buffer_size
    }

    /// Returns the total free space currently tracked by the allocator.
    pub fn free_size(&self) -> DeviceSize {
        self.inner.state.lock().allocator.free_size()
    }
}

impl<B: DeviceBackend, A: Suballocator> ManagerInner<B, A> {
    /// Uploads `data` into a staging buffer, reusing a returned one when it
    /// is large enough.
    fn stage_bytes(&self, data: &[u8]) -> Result<B::Buffer, DeviceError> {
        let len = data.len() as DeviceSize;
        let bounce = match self.bounce_reserve.pop() {
            Some(buffer) if buffer.size() >= len => buffer,
            _ => self.backend.create_storage(
                len,
                None,
                StorageFlags::CLIENT_STORAGE | StorageFlags::HOST_WRITE,
            )?,
        };

        let ptr = bounce.map_persistent(0..len, MapFlags::WRITE)?;
        // SAFETY: The mapping is valid for `len` bytes and the staging buffer
        // is not visible to anyone else until we hand it over.
        unsafe {
            slice::from_raw_parts_mut(ptr.as_ptr(), data.len()).copy_from_slice(data);
        }

        Ok(bounce)
    }

    fn recycle_bounce(&self, bounce: B::Buffer) {
        // Dropping the buffer when the reserve is full is fine.
        let _ = self.bounce_reserve.push(bounce);
    }
}

/// An exclusive handle to a reservation made by a [`BufferManager`].
///
/// While the handle is live, its byte range belongs to it alone; dropping the
/// handle returns the range to the manager's allocator. A default-constructed
/// handle is *inert*: it has no owner, every data operation on it fails with
/// [`RegionError::Inert`] and dropping it is a no-op. Regions are move-only,
/// which is what makes the release on drop happen exactly once.
pub struct BufferRegion<B: DeviceBackend, A: Suballocator = FirstFitAllocator> {
    parent: Option<Arc<ManagerInner<B, A>>>,
    offset: DeviceSize,
    size: DeviceSize,
}

impl<B: DeviceBackend, A: Suballocator> Debug for BufferRegion<B, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegion")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("inert", &self.is_inert())
            .finish()
    }
}

impl<B: DeviceBackend, A: Suballocator> Default for BufferRegion<B, A> {
    /// Creates an inert region.
    fn default() -> Self {
        BufferRegion {
            parent: None,
            offset: 0,
            size: 0,
        }
    }
}

impl<B: DeviceBackend, A: Suballocator> BufferRegion<B, A> {
    /// Returns the offset of the region within the managed buffer.
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size of the region.
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns whether the region is inert.
    pub fn is_inert(&self) -> bool {
        self.parent.is_none()
    }

    /// Copies `data` into the region through a staging buffer.
    ///
    /// `data` must be exactly as long as the region.
    pub fn write_bytes(&self, data: &[u8]) -> Result<(), RegionError> {
        let parent = self.parent.as_ref().ok_or(RegionError::Inert)?;

        if data.len() as DeviceSize != self.size {
            return Err(RegionError::SizeMismatch {
                required: self.size,
                provided: data.len() as DeviceSize,
            });
        }

        let bounce = parent.stage_bytes(data)?;

        {
            let state = parent.state.lock();
            // The buffer exists because this region exists.
            let buffer = state.buffer.as_ref().unwrap();
            parent
                .backend
                .copy_range(&bounce, buffer, 0, self.offset, self.size)?;
        }

        parent.recycle_bounce(bounce);

        Ok(())
    }

    /// Copies the prefix of `src` into the region, entirely on the device.
    ///
    /// `src` must be at least as long as the region.
    pub fn copy_from(&self, src: &B::Buffer) -> Result<(), RegionError> {
        let parent = self.parent.as_ref().ok_or(RegionError::Inert)?;

        if src.size() < self.size {
            return Err(RegionError::SizeMismatch {
                required: self.size,
                provided: src.size(),
            });
        }

        let state = parent.state.lock();
        let buffer = state.buffer.as_ref().unwrap();
        parent
            .backend
            .copy_range(src, buffer, 0, self.offset, self.size)?;

        Ok(())
    }

    /// Copies a slice of plain-old-data values into the region.
    ///
    /// The byte length of `data` must be exactly the size of the region.
    pub fn write_data<T: NoUninit>(&self, data: &[T]) -> Result<(), RegionError> {
        self.write_bytes(bytemuck::cast_slice(data))
    }

    /// Binds the whole managed buffer to `target`.
    pub fn bind(&self, target: BindTarget) -> Result<(), RegionError> {
        let parent = self.parent.as_ref().ok_or(RegionError::Inert)?;
        let state = parent.state.lock();
        state.buffer.as_ref().unwrap().bind(target);

        Ok(())
    }

    /// Binds the region's byte range to the indexed binding point `index` of
    /// `target`.
    pub fn bind_range(&self, target: BindTarget, index: u32) -> Result<(), RegionError> {
        let parent = self.parent.as_ref().ok_or(RegionError::Inert)?;
        let state = parent.state.lock();
        state
            .buffer
            .as_ref()
            .unwrap()
            .bind_range(target, index, self.offset, self.size);

        Ok(())
    }
}

impl<B: DeviceBackend, A: Suballocator> Drop for BufferRegion<B, A> {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.take() {
            let mut state = parent.state.lock();
            let released = state.allocator.deallocate(self.offset, self.size);

            // The allocator handed this exact range out and the region, being
            // move-only, is the only one that can return it, so this cannot
            // fail through the public API. A panic in a drop aborts the
            // process when it happens during unwinding, so a corrupted
            // allocator is only reported in debug builds; release builds
            // leak the range instead.
            debug_assert!(released.is_ok());
        }
    }
}

/// Error that can be returned when allocating a [`BufferRegion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocateError {
    /// The allocator rejected the request.
    Suballocator(SuballocatorError),

    /// A device collaborator failed.
    Device(DeviceError),

    /// The allocator was still out of space after growing the buffer. This
    /// signals corrupted allocator state, not a recoverable condition.
    Inconsistent,
}

impl Error for AllocateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Suballocator(err) => Some(err),
            Self::Device(err) => Some(err),
            Self::Inconsistent => None,
        }
    }
}

impl Display for AllocateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suballocator(_) => write!(f, "the allocator rejected the request"),
            Self::Device(_) => write!(f, "a device collaborator failed"),
            Self::Inconsistent => {
                write!(f, "the allocator ran out of space after the buffer grew")
            }
        }
    }
}

impl From<SuballocatorError> for AllocateError {
    fn from(err: SuballocatorError) -> Self {
        Self::Suballocator(err)
    }
}

impl From<DeviceError> for AllocateError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

/// Error that can be returned by operations on a [`BufferRegion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionError {
    /// The region is inert: it was default-constructed or its reservation
    /// has been moved elsewhere.
    Inert,

    /// The provided data does not match the size of the region.
    SizeMismatch {
        required: DeviceSize,
        provided: DeviceSize,
    },

    /// A device collaborator failed.
    Device(DeviceError),
}

impl Error for RegionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for RegionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inert => write!(f, "the region does not have an owner"),
            Self::SizeMismatch { required, provided } => write!(
                f,
                "the data size ({} bytes) does not match the region size ({} bytes)",
                provided, required,
            ),
            Self::Device(_) => write!(f, "a device collaborator failed"),
        }
    }
}

impl From<DeviceError> for RegionError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;

    fn manager_with_block_size(block_size: DeviceSize) -> BufferManager<HostBackend> {
        BufferManager::new(
            HostBackend::new(),
            BufferManagerCreateInfo {
                block_size,
                ..Default::default()
            },
        )
    }

    fn managed_contents(manager: &BufferManager<HostBackend>) -> Vec<u8> {
        manager
            .inner
            .state
            .lock()
            .buffer
            .as_ref()
            .unwrap()
            .contents()
    }

    #[test]
    fn storage_materializes_on_first_allocation() {
        let manager = manager_with_block_size(128);
        assert_eq!(manager.buffer_size(), 0);

        let region = manager.allocate(16, 1).unwrap();
        assert_eq!(manager.buffer_size(), 128);
        assert_eq!(region.offset(), 0);
        assert_eq!(region.size(), 16);

        // A first request larger than the block size sizes the buffer after
        // the request instead.
        let large = manager_with_block_size(128);
        large.allocate(300, 1).unwrap();
        assert_eq!(large.buffer_size(), 300);
    }

    #[test]
    fn dropping_a_region_returns_its_range() {
        let manager = manager_with_block_size(128);

        let region = manager.allocate(128, 1).unwrap();
        assert_eq!(manager.free_size(), 0);

        drop(region);
        assert_eq!(manager.free_size(), 128);

        // The freed range is handed out again.
        assert_eq!(manager.allocate(128, 1).unwrap().offset(), 0);
    }

    #[test]
    fn exhaustion_grows_exactly_once_and_preserves_contents() {
        let manager = manager_with_block_size(64);

        let region = manager.allocate(64, 1).unwrap();
        region.write_bytes(&[0xab; 64]).unwrap();
        assert_eq!(manager.buffer_size(), 64);

        // Out of space: one growth of max(size + alignment, block_size).
        let second = manager.allocate(100, 4).unwrap();
        assert_eq!(manager.buffer_size(), 64 + 104);
        assert_eq!(second.offset(), 64);

        // The bytes written before the growth survived the migration.
        assert_eq!(&managed_contents(&manager)[..64], &[0xab; 64][..]);

        // The first region's offset is still valid for writes.
        region.write_bytes(&[0xcd; 64]).unwrap();
        assert_eq!(&managed_contents(&manager)[..64], &[0xcd; 64][..]);
    }

    #[test]
    fn zero_size_allocation_is_a_contract_error() {
        let manager = manager_with_block_size(64);

        assert_eq!(
            manager.allocate(0, 1).err(),
            Some(AllocateError::Suballocator(SuballocatorError::ZeroSize)),
        );
    }

    #[test]
    fn write_bytes_checks_the_region_size() {
        let manager = manager_with_block_size(64);
        let region = manager.allocate(8, 1).unwrap();

        assert_eq!(
            region.write_bytes(&[0; 4]).err(),
            Some(RegionError::SizeMismatch {
                required: 8,
                provided: 4,
            }),
        );

        region.write_bytes(&[7; 8]).unwrap();
        assert_eq!(&managed_contents(&manager)[..8], &[7; 8][..]);
    }

    #[test]
    fn typed_writes_go_through_bytemuck() {
        let manager = manager_with_block_size(64);
        let region = manager.allocate(8, 4).unwrap();

        region.write_data(&[1u32.to_le(), 2u32.to_le()]).unwrap();
        assert_eq!(
            &managed_contents(&manager)[..8],
            &[1, 0, 0, 0, 2, 0, 0, 0][..],
        );
    }

    #[test]
    fn device_to_device_copy_into_a_region() {
        let backend = HostBackend::new();
        let manager = BufferManager::new(backend.clone(), Default::default());
        let region = manager.allocate(4, 1).unwrap();

        let src = backend
            .create_storage(4, Some(&[1, 2, 3, 4]), StorageFlags::NONE)
            .unwrap();
        region.copy_from(&src).unwrap();
        assert_eq!(&managed_contents(&manager)[..4], &[1, 2, 3, 4][..]);

        let short = backend.create_storage(2, None, StorageFlags::NONE).unwrap();
        assert_eq!(
            region.copy_from(&short).err(),
            Some(RegionError::SizeMismatch {
                required: 4,
                provided: 2,
            }),
        );
    }

    #[test]
    fn inert_regions_reject_every_operation() {
        let region = BufferRegion::<HostBackend>::default();

        assert!(region.is_inert());
        assert_eq!(region.write_bytes(&[]).err(), Some(RegionError::Inert));
        assert_eq!(region.write_data(&[0u8; 0]).err(), Some(RegionError::Inert));
        assert_eq!(region.bind(BindTarget(0)).err(), Some(RegionError::Inert));
        assert_eq!(
            region.bind_range(BindTarget(0), 0).err(),
            Some(RegionError::Inert),
        );
        // Dropping an inert region must not call into any manager.
        drop(region);
    }

    #[test]
    fn regions_bind_their_range() {
        let manager = manager_with_block_size(64);
        let region = manager.allocate(16, 16).unwrap();
        let _pad = manager.allocate(16, 1).unwrap();

        region.bind_range(BindTarget(3), 1).unwrap();

        let state = manager.inner.state.lock();
        let bindings = state.buffer.as_ref().unwrap().bindings();
        assert_eq!(
            bindings.last().unwrap(),
            &crate::backend::host::BindRecord::Range {
                target: BindTarget(3),
                index: 1,
                offset: region.offset(),
                size: 16,
            },
        );
    }

    #[test]
    fn bounce_buffers_are_recycled() {
        let manager = manager_with_block_size(64);
        let region = manager.allocate(8, 1).unwrap();

        region.write_bytes(&[1; 8]).unwrap();
        assert_eq!(manager.inner.bounce_reserve.len(), 1);

        // The second write reuses the staged buffer instead of queueing
        // another one.
        region.write_bytes(&[2; 8]).unwrap();
        assert_eq!(manager.inner.bounce_reserve.len(), 1);
        assert_eq!(&managed_contents(&manager)[..8], &[2; 8][..]);
    }

    #[test]
    fn oversized_requests_error_instead_of_overflowing() {
        let manager = manager_with_block_size(64);
        let _region = manager.allocate(16, 1).unwrap();

        // `size + alignment` does not fit in a `DeviceSize`.
        assert_eq!(
            manager.allocate(DeviceSize::MAX, 1).err(),
            Some(AllocateError::Device(DeviceError::OutOfDeviceMemory)),
        );

        // The growth step would push the buffer size past `DeviceSize::MAX`.
        assert_eq!(
            manager.allocate(DeviceSize::MAX - 32, 0).err(),
            Some(AllocateError::Device(DeviceError::OutOfDeviceMemory)),
        );

        // Neither attempt touched the buffer or the allocator.
        assert_eq!(manager.buffer_size(), 64);
        assert_eq!(manager.free_size(), 48);
    }

    #[test]
    fn regions_outlive_the_manager_handle() {
        let manager = manager_with_block_size(64);
        let region = manager.allocate(16, 1).unwrap();

        let inner = region.parent.clone().unwrap();
        drop(manager);

        // The region keeps the shared state alive; dropping it still returns
        // the range.
        drop(region);
        assert!(inner.state.lock().allocator.is_empty());
        assert_eq!(inner.state.lock().allocator.free_size(), 64);
    }

    #[test]
    fn alignment_within_the_managed_buffer() {
        let manager = manager_with_block_size(1024);

        manager.allocate(10, 1).unwrap();
        let aligned = manager.allocate(32, 256).unwrap();
        assert_eq!(aligned.offset() % 256, 0);
    }
}
