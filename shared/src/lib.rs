//! Hardware abstractions, simulated devices and image processing used by
//! the scope server.

pub mod camera_interface;
pub mod config_storage;
pub mod devices;
pub mod image_proc;
pub mod search;
