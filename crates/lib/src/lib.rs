//! # Raspberry Pi first boot provisioning
//!
//! This crate is run by the kernel as `init` on the very first boot of a
//! freshly flashed image. It grows the root partition by way of an
//! external helper, removes its own `init=` trigger from the boot
//! partition's `cmdline.txt` once that has worked, and reboots into the
//! real system.

mod bootcfg;
pub mod cli;
mod config;
mod expand;
mod host;
mod journal;
mod kernel_cmdline;
mod orchestrator;
mod reboot;
