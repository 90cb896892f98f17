pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, HttpError};
pub use routes::{AppState, WELCOME_MESSAGE, router};
pub use server::{bind, serve};
