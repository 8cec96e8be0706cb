pub mod handlers;
pub mod identity;
pub mod routes;
pub mod state;

pub use identity::{HeaderIdentity, USER_ID_HEADER};
pub use routes::create_router;
pub use state::AppState;
