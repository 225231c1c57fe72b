use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use trickle_llm::{
    HttpTransport, RequestDispatcher, SimulatedTransport, StreamTransport, TransportError,
};
use trickle_storage::{
    FileKvStore, KeyValueStore, MemoryKvStore, SqliteKvStore, StorageError,
};

use crate::chat::{ChatController, MessageStore};
use crate::settings::{AppSettings, StorageBackendKind, TransportKind};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to set up transport on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("failed to open message storage on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// Wired-up chat session built from [`AppSettings`].
pub struct ChatApp {
    pub controller: ChatController,
    pub transport_name: String,
}

impl ChatApp {
    pub fn from_settings(settings: &AppSettings) -> AppResult<Self> {
        let transport = build_transport(settings)?;
        let transport_name = transport.name().to_string();
        let backend = open_backend(settings)?;
        let store = Arc::new(MessageStore::persistent(backend, settings.storage.key.clone()));
        let dispatcher =
            RequestDispatcher::new(transport, settings.dispatch.to_dispatcher_config());
        let controller =
            ChatController::with_stream_duration(store, dispatcher, settings.stream_duration_secs);

        tracing::info!(
            transport = %transport_name,
            storage = ?settings.storage.backend,
            messages = controller.store().len(),
            "chat session ready"
        );
        Ok(Self {
            controller,
            transport_name,
        })
    }
}

pub fn build_transport(settings: &AppSettings) -> AppResult<Arc<dyn StreamTransport>> {
    match settings.transport {
        TransportKind::Http => {
            let transport = HttpTransport::new(&settings.api_base_url).context(TransportSnafu {
                stage: "build-http-transport",
            })?;
            tracing::debug!(endpoint = transport.endpoint(), "using http transport");
            Ok(Arc::new(transport))
        }
        TransportKind::Simulated => Ok(Arc::new(SimulatedTransport::default())),
    }
}

pub fn open_backend(settings: &AppSettings) -> AppResult<Arc<dyn KeyValueStore>> {
    let path = settings.storage.resolved_path();
    match settings.storage.backend {
        StorageBackendKind::Memory => Ok(Arc::new(MemoryKvStore::new())),
        StorageBackendKind::File => {
            tracing::debug!(path = ?path, "using file storage");
            Ok(Arc::new(FileKvStore::new(path)))
        }
        StorageBackendKind::Sqlite => {
            tracing::debug!(path = ?path, "using sqlite storage");
            let location = path.to_string_lossy();
            let store = SqliteKvStore::open(&location).context(StorageSnafu {
                stage: "open-sqlite-storage",
            })?;
            Ok(Arc::new(store))
        }
    }
}
