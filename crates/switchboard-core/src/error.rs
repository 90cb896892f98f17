use thiserror::Error;

use crate::agent::{HandlerError, RuntimeError};
use crate::channel::{ChannelError, PublishError};
use crate::config::ConfigError;
use crate::envelope::CodecError;
use crate::gateway::{GatewayError, ResponseStoreError};
use crate::session::SessionStoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error(transparent)]
    Responses(#[from] ResponseStoreError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
