use courier_broker::BrokerError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The worker has been shut down and cannot be started again.
    #[error("Worker has been shut down")]
    ShutDown,
}
