//! runtopo materializes a user-described network topology as running
//! KVM/libvirt guests.
//!
//! The input is a graph in the DOT language: nodes are virtual devices,
//! edges are point-to-point links realized as libvirt UDP tunnels. The
//! [`topology`] module parses and validates the graph (optionally
//! synthesizing an out-of-band management network); the [`libvirt`] runner
//! turns the result into storage volumes, defined domains, customized
//! guest filesystems, and running VMs, and tears all of it down again.

pub mod libvirt;
pub mod topology;
pub mod utils;

mod virsh;
