pub mod bluetooth;
pub mod config;
pub mod error;
pub mod models;
pub mod session;
pub mod utils;

pub use bluetooth::{CharacteristicInfo, Radio, RadioEvent};
pub use config::SessionConfig;
pub use error::{ConfigError, ConnectFailure, DecodeError, RadioError, SessionError};
pub use models::{
    Channel, ChannelSet, GeoPoint, PeripheralDescriptor, PeripheralId, Reading, Submission,
};
pub use session::{ConnectionState, ScanState, SessionEvent, SessionManager, SessionState};
