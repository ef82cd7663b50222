//! Service layer for the validation server

pub mod app_state;
pub mod definitions;
pub mod sessions;
pub mod validation;

pub use app_state::AppState;
pub use definitions::DefinitionService;
pub use sessions::SessionHandle;
pub use validation::ValidationService;
