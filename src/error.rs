use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FreeMapError {
    #[error("record pool exhausted: {0} records in use")]
    PoolExhausted(usize),

    #[error("scan index out of sync at file {file} offset {offset}")]
    IndexDesync { file: u32, offset: u64 },

    #[error("builder misconfigured: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FreeMapError>;
