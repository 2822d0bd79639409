//! Driver core for the COMBO PCI accelerator card.
//!
//! The card exposes a small register window (BAR 0) with interrupt control and a
//! single-channel DMA engine that copies between host memory and card-local
//! memory. This crate implements the attach/detach resource chain, the interrupt
//! top half, the tasklet-style bottom half, the DMA transfer protocol and the
//! page-fault driven mapping of the driver's coherent buffer into user space.
//!
//! Everything the kernel would normally provide (PCI resources, coherent DMA
//! allocation, IRQ registration, deferred work, mmap nodes) is reached through
//! the traits in [`hal`].

#![no_std]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod util;

pub mod config;
pub mod device;
pub mod dma;
pub mod hal;
pub mod info;
pub mod irq;
pub mod mmap;
pub mod mmio;
pub mod regs;
pub mod units;
pub mod worker;

#[cfg(any(test, feature = "emulated"))]
pub mod emulated;

pub use config::{DriverConfig, SelfTestMode};
pub use device::{
    AttachError, AttachStage, AttachState, ComboDriver, DetachError, DeviceHandle, SelfTestError,
};
pub use dma::{Completion, DmaBuffer, DmaEngine, DmaError, Direction, TransferDescriptor};
pub use irq::{InterruptDispatcher, InterruptEvent};
pub use mmap::{Fault, MappedPage, MemoryMapExposure, VmArea};
pub use worker::DeferredWorker;

/// PCI vendor ID of the COMBO card.
pub const VENDOR_ID: u16 = 0x18ec;
/// PCI device ID of the COMBO card.
pub const DEVICE_ID: u16 = 0xc058;
