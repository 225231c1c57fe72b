use snafu::Snafu;
use trickle_storage::StorageError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    #[snafu(display("failed to encode store snapshot on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode stored value on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("store has no storage key or backend configured (`{stage}`)"))]
    NotPersistent { stage: &'static str },
    #[snafu(display("store codec failed on `{stage}`: {source}"))]
    Codec {
        stage: &'static str,
        source: CodecError,
    },
    #[snafu(display("store backend failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

pub type CodecResult<T> = Result<T, CodecError>;
pub type StoreResult<T> = Result<T, StoreError>;
