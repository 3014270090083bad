// Device implementations of the capability traits. Nothing here is built on
// the host.

#[cfg(target_os = "espidf")]
pub mod esp;
