use thiserror::Error;
use tokio_rusqlite::rusqlite;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("mysql error: {0}")]
    MySql(#[from] sqlx::Error),

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("upserted row for {player_id} ({ip}) could not be read back")]
    RowVanished { player_id: String, ip: String },
}

pub type Result<T> = std::result::Result<T, DbError>;
