//! Build and boot-test pipeline for bare-metal llamafile images.
//!
//! A llamafile is an Actually Portable Executable: the same file carries a
//! BIOS boot sector and a PE header UEFI firmware can load. This crate
//! drives the upstream build, appends the model, lays out BIOS and UEFI
//! boot media, and boots them in QEMU, optionally under GDB.
//!
//! Stages take an immutable config plus the outputs of earlier stages.
//! External programs are reached only through [`runner::CommandRunner`]
//! and host state only through [`host::Host`], so every stage can be
//! exercised without spawning anything.

pub mod analyzer;
pub mod builder;
pub mod config;
pub mod deps;
pub mod emulator;
pub mod env;
mod error;
pub mod fetch;
pub mod host;
pub mod logging;
pub mod manifest;
pub mod media;
pub mod pipeline;
pub mod runner;
pub mod templates;

pub use error::{Error, Result};
