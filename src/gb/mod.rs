pub mod alarm;
pub mod catalog;
pub mod device;
pub mod handler;
pub mod ptz;
pub mod record;
pub mod server;
pub mod session;
pub mod xml;

pub use device::{Channel, Device, DeviceEntry, Registry};
pub use server::{GbServer, GbServerRef};
pub use session::{PlaybackAction, PlaybackInput, PlayInput, PlayResult};

#[cfg(test)]
pub mod tests;
