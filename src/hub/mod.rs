//! Event hub: extension registry, ordered event delivery, response
//! listeners and versioned shared state.

mod container;
mod dispatcher;
mod extension;
mod listener;
pub mod shared_state;

pub use dispatcher::{
    extension_type_name, EventHub, EventHubConfig, SharedStateQuery, SharedStateResolver, EVENT_HUB_FRIENDLY_NAME,
    EVENT_HUB_NAME, STATE_CHANGE_EVENT_NAME, STATE_OWNER_KEY,
};
pub use extension::{Extension, ExtensionRegistration, ExtensionRuntime};
pub use listener::{EventListener, EventPreprocessor, ListenerId, ResponseCallback};
pub use shared_state::{SharedState, SharedStateResolution, SharedStateResult, SharedStateStatus, SharedStateType};
