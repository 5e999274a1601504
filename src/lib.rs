//! Library crate for the exam session engine, exposing the controller, its collaborators and
//! the server abstractions for the binary and for tests.

pub mod config;
/// Assessment server abstraction and its implementations.
pub mod dao;
/// Values published to session observers.
pub mod dto;
/// Engine error taxonomy.
pub mod error;
/// Session controller and the components it coordinates.
pub mod services;
/// Attempt state owned by the controller.
pub mod state;

pub use config::EngineConfig;
pub use dto::snapshot::SessionSnapshot;
pub use error::{FailureKind, SessionError, SubmitRejection};
pub use services::{
    network::NetworkSignal,
    session::{Navigation, SessionHandle},
};
