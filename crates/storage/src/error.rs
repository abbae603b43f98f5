use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage key must not be empty"))]
    EmptyKey { stage: &'static str },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create storage directory at {path}"))]
    CreateDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read key-value file from {path}"))]
    ReadFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write key-value file to {path}"))]
    WriteFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace key-value file {from} with {to}"))]
    RenameFile {
        stage: &'static str,
        from: String,
        to: String,
        source: std::io::Error,
    },
    #[snafu(display("key-value file {path} is not a JSON object of strings"))]
    DecodeFile {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode key-value file for {path}"))]
    EncodeFile {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to initialize sqlite worker runtime"))]
    SqliteRuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
