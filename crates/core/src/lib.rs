pub mod agent;
pub mod catalog;
pub mod error;
pub mod media;
pub mod protocol;
pub mod session;
pub mod transport;

pub use agent::{DeviceAgent, DeviceConfig};
pub use error::{Result, SimError};
pub use media::Packetizer;
pub use session::{SessionController, SessionState};
