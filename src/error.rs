use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("malformed DAP frame: {0}")]
    Frame(String),
    #[error("DAP connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("no deferred response slot for seq {0}")]
    UnknownSeq(i64),
    #[error("{0}")]
    Adapter(String),

    // --------------------------------- configuration errors --------------------------------------
    #[error("unknown language `{0}`")]
    UnknownLanguage(String),
    #[error("cannot detect debugger language for `{0}`, pass --language")]
    LanguageDetect(PathBuf),
    #[error("{0}")]
    NotInstalled(String),
    #[error("script not found: {0}")]
    ScriptNotFound(PathBuf),

    // --------------------------------- handshake errors ------------------------------------------
    #[error("adapter handshake failed: {0}")]
    Handshake(String),

    // --------------------------------- state precondition errors ---------------------------------
    #[error("a debug session is already active, run `close` first")]
    AlreadyActive,
    #[error("`{verb}` requires a {required} session, but session is {actual}")]
    WrongState {
        verb: &'static str,
        required: &'static str,
        actual: &'static str,
    },

    #[error("attach requires exactly one of --port or --pid")]
    AttachTarget,

    // --------------------------------- injection errors ------------------------------------------
    #[error("process with pid {0} not found")]
    ProcessNotFound(i32),
    #[error("pid attach is not supported for {0}")]
    InjectUnsupported(&'static str),
    #[error("injection failed: {0}")]
    Injection(String),

    // --------------------------------- serialization errors --------------------------------------
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "daemon", "{:#}", e);
                None
            }
        }
    };
    ($res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "daemon", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}
