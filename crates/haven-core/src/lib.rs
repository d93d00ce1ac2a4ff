//! Haven core business logic.
//!
//! Session metering against a prepaid wallet, the one-time free-trial
//! allowance and the lifecycle of a one-to-one video call. Platform media,
//! signaling and storage are injected through traits.

pub mod call;
pub mod errors;
pub mod events;
pub mod loopback;
pub mod media;
pub mod meter;
pub mod settings;
pub mod signaling;
pub mod store;
pub mod trial;
pub mod wallet;

pub use call::{CallConfig, CallCoordinator, CallSession, CallStatus};
pub use errors::HavenError;
pub use events::{EventEmitter, HavenEvent, HavenEventListener, MeterEvent};
pub use meter::{MeteredFeature, MeterSnapshot, SessionMeter};
pub use settings::{Settings, SettingsStore};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, RetryQueue};
pub use trial::FreeTrial;
pub use wallet::{Paise, Wallet};
