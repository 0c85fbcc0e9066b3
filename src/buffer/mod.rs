//! Buffer memory management on top of the device capabilities.
//!
//! [`BufferManager`] serves long-lived data: it carves persistent sub-regions
//! out of one growable device buffer. [`StreamingRingBuffer`] serves
//! per-cycle data: it rotates through three fixed regions of one persistently
//! mapped buffer, gated by completion markers. Both answer the same question
//! of when handed-out memory can be taken back, under different cost models.

pub use self::{
    manager::{
        AllocateError, BufferManager, BufferManagerCreateInfo, BufferRegion, RegionError,
    },
    streaming::{StreamingError, StreamingRingBuffer},
};

mod manager;
mod streaming;
