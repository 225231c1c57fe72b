pub mod state;

pub use state::{
    AppSettings, DispatchSettings, SettingsError, SettingsStore, StorageBackendKind,
    StorageSettings, TransportKind,
};
