use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("user {0:?} is not in the allowed-users list")]
    UserNotAllowed(String),
    #[error("shell {0:?} is not in the allowed-shells list")]
    ShellNotAllowed(String),
    #[error("switching to user root is not supported")]
    RootTargetDenied,
    #[error("the IMP is not installed setuid; unprivileged exec is disabled")]
    UnprivilegedExecDisabled,
    #[error("FLUX_IMP_EXEC_HELPER is set but empty")]
    EmptyHelperEnv,
    #[error("helper command {command:?} exited with status {status}")]
    HelperFailed { command: String, status: i32 },
    #[error("malformed json input: {0}")]
    InvalidJson(String),
    #[error("missing required field {0:?} in json input")]
    MissingField(&'static str),
    #[error(transparent)]
    Token(#[from] imp_token::TokenError),
    #[error(transparent)]
    Kv(#[from] imp_kv::KvError),
    #[error(transparent)]
    Ident(#[from] imp_ident::IdentError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("fork failed: {0}")]
    ForkFailed(std::io::Error),
    #[error("privsep handshake failed: {0}")]
    PrivsepHandshake(String),
}
